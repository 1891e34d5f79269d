// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Action chains: ordered step lists persisted in Redis so a second agent can
//! resume where the first left off.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use parley_bus::KeyValueStore;

use crate::actions::ActionStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStatus {
    Pending,
    Running,
    Completed,
    Error,
}

/// A cross-agent task: created lazily on the first `AG_CALL_AG` step, loaded
/// by the recipient from the `action_chain:<id>` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionChain {
    pub chain_id: String,
    pub name: String,
    pub origin_agent_id: String,
    pub origin_topic_id: String,
    #[serde(default)]
    pub steps: Vec<ActionStep>,
    #[serde(default)]
    pub current_index: usize,
    #[serde(default = "default_status")]
    pub status: ChainStatus,
}

fn default_status() -> ChainStatus {
    ChainStatus::Pending
}

impl ActionChain {
    pub fn new(
        name: impl Into<String>,
        origin_agent_id: impl Into<String>,
        origin_topic_id: impl Into<String>,
    ) -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self {
            chain_id: format!("chain_{}", &hex[..12]),
            name: name.into(),
            origin_agent_id: origin_agent_id.into(),
            origin_topic_id: origin_topic_id.into(),
            steps: Vec::new(),
            current_index: 0,
            status: ChainStatus::Pending,
        }
    }

    pub fn add_step(&mut self, step: ActionStep) -> &mut Self {
        self.steps.push(step);
        self
    }

    pub fn current_step(&self) -> Option<&ActionStep> {
        self.steps.get(self.current_index)
    }

    /// Move past the current step.  The index never decreases and never
    /// exceeds `steps.len()`; reaching the end completes the chain.
    pub fn advance(&mut self) {
        if self.current_index < self.steps.len() {
            self.current_index += 1;
        }
        if self.current_index >= self.steps.len() {
            self.status = ChainStatus::Completed;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.current_index >= self.steps.len()
    }

    /// Progress payload for `action_chain_progress` events.
    pub fn progress(&self) -> Value {
        let status = match self.status {
            ChainStatus::Pending => "pending",
            ChainStatus::Running => "running",
            ChainStatus::Completed => "completed",
            ChainStatus::Error => "error",
        };
        json!({
            "current_index": self.current_index,
            "total_steps": self.steps.len(),
            "status": status,
            "current_step": self.current_step().map(|s| serde_json::to_value(s).ok()),
        })
    }
}

/// Redis persistence for chains.  No TTL by default; callers that want expiry
/// use [`ActionChainStore::save_with_ttl`].
pub struct ActionChainStore {
    kv: Arc<dyn KeyValueStore>,
}

impl ActionChainStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn key(chain_id: &str) -> String {
        format!("action_chain:{chain_id}")
    }

    pub async fn save(&self, chain: &ActionChain) -> anyhow::Result<()> {
        let payload = serde_json::to_string(chain)?;
        self.kv.set(&Self::key(&chain.chain_id), &payload, None).await
    }

    pub async fn save_with_ttl(&self, chain: &ActionChain, ttl: Duration) -> anyhow::Result<()> {
        let payload = serde_json::to_string(chain)?;
        self.kv
            .set(&Self::key(&chain.chain_id), &payload, Some(ttl))
            .await
    }

    /// Load a chain; `None` when missing, expired, or unparseable.
    pub async fn load(&self, chain_id: &str) -> Option<ActionChain> {
        let payload = match self.kv.get(&Self::key(chain_id)).await {
            Ok(Some(p)) => p,
            Ok(None) => return None,
            Err(e) => {
                warn!(chain_id = %chain_id, error = %e, "chain load failed");
                return None;
            }
        };
        match serde_json::from_str(&payload) {
            Ok(chain) => Some(chain),
            Err(e) => {
                warn!(chain_id = %chain_id, error = %e, "chain payload corrupt");
                None
            }
        }
    }

    pub async fn delete(&self, chain_id: &str) -> anyhow::Result<()> {
        self.kv.delete(&Self::key(chain_id)).await
    }

    pub async fn exists(&self, chain_id: &str) -> bool {
        self.kv
            .exists(&Self::key(chain_id))
            .await
            .unwrap_or(false)
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parley_bus::MemoryKv;

    fn store() -> ActionChainStore {
        ActionChainStore::new(Arc::new(MemoryKv::new()))
    }

    #[test]
    fn chain_id_has_wire_shape() {
        let chain = ActionChain::new("test", "a1", "t1");
        assert!(chain.chain_id.starts_with("chain_"));
        assert_eq!(chain.chain_id.len(), 18);
    }

    #[test]
    fn advance_never_exceeds_len() {
        let mut chain = ActionChain::new("test", "a1", "t1");
        chain.add_step(ActionStep::accept());
        chain.advance();
        chain.advance();
        chain.advance();
        assert_eq!(chain.current_index, 1);
        assert_eq!(chain.status, ChainStatus::Completed);
        assert!(chain.is_finished());
    }

    #[test]
    fn progress_reports_counts() {
        let mut chain = ActionChain::new("test", "a1", "t1");
        chain.add_step(ActionStep::accept());
        chain.add_step(ActionStep::self_generate("写总结"));
        let p = chain.progress();
        assert_eq!(p["current_index"], 0);
        assert_eq!(p["total_steps"], 2);
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let store = store();
        let mut chain = ActionChain::new("画熊猫", "a1", "t1");
        chain.add_step(ActionStep::call_agent("b1", None, "帮我画一个熊猫"));
        store.save(&chain).await.unwrap();

        let loaded = store.load(&chain.chain_id).await.unwrap();
        assert_eq!(loaded.name, "画熊猫");
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.steps[0].param_str("message"), Some("帮我画一个熊猫"));
    }

    #[tokio::test]
    async fn load_missing_chain_is_none() {
        assert!(store().load("chain_missing").await.is_none());
    }

    #[tokio::test]
    async fn expired_chain_is_gone() {
        let store = store();
        let chain = ActionChain::new("ttl", "a1", "t1");
        store
            .save_with_ttl(&chain, Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.load(&chain.chain_id).await.is_none());
    }

    #[tokio::test]
    async fn delete_removes_chain() {
        let store = store();
        let chain = ActionChain::new("del", "a1", "t1");
        store.save(&chain).await.unwrap();
        assert!(store.exists(&chain.chain_id).await);
        store.delete(&chain.chain_id).await.unwrap();
        assert!(!store.exists(&chain.chain_id).await);
    }
}
