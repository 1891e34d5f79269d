// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{McpExecutionOutcome, McpExecutionRequest, McpExecutor};

/// Pre-scripted executor for tests.  Each call pops the next outcome from the
/// front of the queue; every request is recorded for inspection.
pub struct ScriptedMcpExecutor {
    outcomes: Mutex<Vec<McpExecutionOutcome>>,
    pub requests: Arc<Mutex<Vec<McpExecutionRequest>>>,
}

impl ScriptedMcpExecutor {
    pub fn new(outcomes: Vec<McpExecutionOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl McpExecutor for ScriptedMcpExecutor {
    async fn execute_with_llm(
        &self,
        req: McpExecutionRequest,
    ) -> anyhow::Result<McpExecutionOutcome> {
        self.requests.lock().unwrap().push(req);
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.is_empty() {
            anyhow::bail!("scripted executor exhausted");
        }
        Ok(outcomes.remove(0))
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
