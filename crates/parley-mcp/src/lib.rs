// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! MCP execution contract.
//!
//! The wire protocol (session initialisation, `list_tools`, `call_tool`,
//! OAuth header injection) lives in an external execution service.  The actor
//! core only depends on this interface: hand over the input plus an LLM
//! config, get back tool text, media, and per-tool results with classified
//! errors.

mod http;
mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use http::{HttpMcpExecutor, McpCallError};
pub use mock::ScriptedMcpExecutor;

/// Coarse error classes reported per tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpErrorKind {
    Network,
    Business,
    #[serde(untagged)]
    Other(String),
}

impl McpErrorKind {
    /// Chinese label used when folding tool errors into LLM-visible text.
    pub fn label(&self) -> &str {
        match self {
            McpErrorKind::Network => "网络错误",
            McpErrorKind::Business => "业务错误",
            McpErrorKind::Other(s) => s.as_str(),
        }
    }
}

/// One invocation of the MCP execution service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpExecutionRequest {
    pub server_id: String,
    /// Conversation context + current request, pre-formatted by the caller.
    pub input_text: String,
    pub llm_config_id: String,
    pub agent_system_prompt: Option<String>,
    /// Force a specific tool instead of letting the executor's LLM pick.
    pub forced_tool_name: Option<String>,
    pub forced_tool_args: Option<Value>,
    pub enable_tool_calling: bool,
    /// Forwarded so the executor can emit execution logs onto the topic.
    pub topic_id: Option<String>,
}

/// Result of one tool inside an execution batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpToolOutcome {
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "error_type", default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<McpErrorKind>,
}

impl McpToolOutcome {
    pub fn ok(tool: impl Into<String>, result: Value) -> Self {
        Self { tool: tool.into(), result: Some(result), error: None, error_kind: None }
    }

    pub fn failed(tool: impl Into<String>, error: impl Into<String>, kind: McpErrorKind) -> Self {
        Self {
            tool: tool.into(),
            result: None,
            error: Some(error.into()),
            error_kind: Some(kind),
        }
    }
}

/// The executor's aggregated outcome.  The core consumes `tool_text`,
/// `media`, and `results[*].error` / `error_kind`; everything else is
/// diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpExecutionOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_text: Option<String>,
    /// Raw media objects as returned by tools; normalised downstream.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<McpToolOutcome>,
    /// Top-level failure, when the batch as a whole did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Raw LLM output from the executor's tool-selection step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_response: Option<String>,
}

impl McpExecutionOutcome {
    pub fn text(tool: impl Into<String>, tool_text: impl Into<String>) -> Self {
        let tool = tool.into();
        let text: String = tool_text.into();
        Self {
            tool_text: Some(text.clone()),
            results: vec![McpToolOutcome::ok(&tool, Value::String(text))],
            ..Default::default()
        }
    }

    pub fn failure(tool: impl Into<String>, error: impl Into<String>, kind: McpErrorKind) -> Self {
        let error: String = error.into();
        Self {
            error: Some(error.clone()),
            results: vec![McpToolOutcome::failed(tool, error, kind)],
            ..Default::default()
        }
    }
}

/// External MCP execution service (120 s per call enforced by its HTTP
/// client; callers do not add their own timeout).
#[async_trait]
pub trait McpExecutor: Send + Sync {
    async fn execute_with_llm(
        &self,
        req: McpExecutionRequest,
    ) -> anyhow::Result<McpExecutionOutcome>;
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_serialises_lowercase() {
        assert_eq!(serde_json::to_string(&McpErrorKind::Network).unwrap(), "\"network\"");
        assert_eq!(serde_json::to_string(&McpErrorKind::Business).unwrap(), "\"business\"");
    }

    #[test]
    fn unknown_error_kind_round_trips() {
        let kind: McpErrorKind = serde_json::from_str("\"timeout\"").unwrap();
        assert_eq!(kind, McpErrorKind::Other("timeout".into()));
        assert_eq!(kind.label(), "timeout");
    }

    #[test]
    fn labels_for_known_kinds() {
        assert_eq!(McpErrorKind::Network.label(), "网络错误");
        assert_eq!(McpErrorKind::Business.label(), "业务错误");
    }

    #[test]
    fn outcome_text_constructor_populates_results() {
        let out = McpExecutionOutcome::text("send_post", "posted ok");
        assert_eq!(out.tool_text.as_deref(), Some("posted ok"));
        assert_eq!(out.results.len(), 1);
        assert!(out.error.is_none());
    }

    #[test]
    fn outcome_failure_constructor_sets_error_everywhere() {
        let out = McpExecutionOutcome::failure(
            "send_post",
            "field 'title' is required",
            McpErrorKind::Business,
        );
        assert!(out.error.is_some());
        assert_eq!(out.results[0].error_kind, Some(McpErrorKind::Business));
    }
}
