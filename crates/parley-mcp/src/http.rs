// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! HTTP client for the external MCP execution service.
//!
//! The service owns the wire protocol (session setup, `list_tools`,
//! `call_tool`, OAuth token injection) and the tool-selection LLM; this side
//! just posts the request and decodes the aggregated outcome.  Individual
//! tool calls can run long, so the request timeout is generous.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;

use crate::{McpExecutionOutcome, McpExecutionRequest, McpExecutor};

/// Upper bound for one execution round-trip.
const EXECUTE_TIMEOUT: Duration = Duration::from_secs(120);

/// Failure modes at the execution-service boundary.
#[derive(Debug, thiserror::Error)]
pub enum McpCallError {
    #[error("mcp execution request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("mcp execution service error {status}: {body}")]
    Service { status: u16, body: String },
}

pub struct HttpMcpExecutor {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpMcpExecutor {
    pub fn new(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(EXECUTE_TIMEOUT)
            .build()
            .context("mcp http client build failed")?;
        Ok(Self { endpoint: endpoint.into(), client })
    }

    async fn post(&self, req: &McpExecutionRequest) -> Result<McpExecutionOutcome, McpCallError> {
        let resp = self.client.post(&self.endpoint).json(req).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(McpCallError::Service { status, body });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl McpExecutor for HttpMcpExecutor {
    async fn execute_with_llm(
        &self,
        req: McpExecutionRequest,
    ) -> anyhow::Result<McpExecutionOutcome> {
        debug!(server_id = %req.server_id, "forwarding MCP execution request");
        Ok(self.post(&req).await?)
    }
}
