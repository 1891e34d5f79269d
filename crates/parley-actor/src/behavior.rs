// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;

use parley_capability::CapabilityRegistry;
use parley_mcp::McpExecutor;
use parley_model::ProviderFactory;
use parley_store::{AgentDirectory, LlmConfigRepository, MessageRecord};
use parley_topic::TopicService;

use crate::actions::{ActionStep, ResponseDecision};
use crate::chain::ActionChainStore;
use crate::context::IterationContext;
use crate::engine::ActorCore;

/// The authoritative parameter-error heuristic: substring match, mixed
/// English/Chinese.  Kept as configuration so deployments can tighten it
/// once MCP servers report structured error codes.
pub const PARAM_ERROR_KEYWORDS: &[&str] = &[
    "required", "missing", "invalid", "参数", "必需", "缺少", "无效",
    "parameter", "field", "字段", "must", "should", "validation", "验证失败",
];

/// Tunables of the actor engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub history_limit: usize,
    pub max_iterations: usize,
    pub memory_budget_threshold: f64,
    pub param_error_keywords: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            max_iterations: 10,
            memory_budget_threshold: 0.8,
            param_error_keywords: PARAM_ERROR_KEYWORDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl EngineConfig {
    /// Substring classification of a tool error against the keyword list.
    pub fn is_param_error(&self, error: &str) -> bool {
        let error_lower = error.to_lowercase();
        self.param_error_keywords
            .iter()
            .any(|kw| error_lower.contains(&kw.to_lowercase()))
    }
}

/// External collaborators of one actor.  Cloned into each engine; everything
/// is shared and thread-safe.
#[derive(Clone)]
pub struct ActorDeps {
    pub topics: Arc<TopicService>,
    pub configs: Arc<dyn LlmConfigRepository>,
    pub agents: Arc<dyn AgentDirectory>,
    pub providers: Arc<dyn ProviderFactory>,
    pub mcp: Arc<dyn McpExecutor>,
    pub chains: Arc<ActionChainStore>,
}

/// The hook set that differentiates agent types.  The engine owns the
/// lifecycle and the ReAct loop; implementations decide whether to respond,
/// what to plan, and when to stop.
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    /// Decide how to react to an incoming message.
    async fn should_respond(
        &self,
        core: &ActorCore,
        topic_id: &str,
        msg: &MessageRecord,
    ) -> ResponseDecision;

    /// Plan the actions for the current ReAct turn.  The default plans
    /// nothing (LLM-only reply path).
    async fn plan_actions(&self, core: &ActorCore, ctx: &IterationContext) -> Vec<ActionStep> {
        let _ = (core, ctx);
        Vec::new()
    }

    /// Whether another ReAct turn should run.  The default continues while
    /// actions are pending, plus one self-repair turn after an MCP
    /// parameter error.
    fn should_continue(&self, core: &ActorCore, ctx: &IterationContext) -> bool {
        default_should_continue(&core.config, ctx)
    }

    /// Register in-process tools on activation.
    fn register_builtin_tools(&self, registry: &mut CapabilityRegistry) {
        let _ = registry;
    }
}

/// Base continuation rule shared by every agent type.
pub fn default_should_continue(config: &EngineConfig, ctx: &IterationContext) -> bool {
    if ctx.has_pending_actions() {
        return true;
    }
    if let Some(last) = ctx.executed_results.last() {
        if !last.success {
            let error = last.error.as_deref().unwrap_or("");
            // A parameter error on an MCP call earns one more turn so the
            // executor's LLM can repair the arguments.
            return last.is_mcp() && config.is_param_error(error);
        }
    }
    false
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionResult;
    use chrono::Utc;
    use parley_model::Role;
    use parley_store::{MessageExt, SenderType};
    use serde_json::Value;

    fn ctx() -> IterationContext {
        let record = MessageRecord {
            message_id: "m1".into(),
            topic_id: "t1".into(),
            sender_id: "u1".into(),
            sender_type: SenderType::User,
            sender_name: None,
            sender_avatar: None,
            role: Role::User,
            content: "hi".into(),
            created_at: Utc::now(),
            mentions: vec![],
            ext: MessageExt::new(),
        };
        IterationContext::new(record, "t1", "msg_r1", 10)
    }

    #[test]
    fn keyword_classification_is_case_insensitive() {
        let cfg = EngineConfig::default();
        assert!(cfg.is_param_error("Field 'title' is REQUIRED"));
        assert!(cfg.is_param_error("缺少必要的参数"));
        assert!(!cfg.is_param_error("connection reset by peer"));
    }

    #[test]
    fn continues_while_actions_pending() {
        let cfg = EngineConfig::default();
        let mut c = ctx();
        c.planned_actions = vec![ActionStep::accept()];
        assert!(default_should_continue(&cfg, &c));
    }

    #[test]
    fn param_error_on_mcp_earns_retry_turn() {
        let cfg = EngineConfig::default();
        let mut c = ctx();
        c.planned_actions = vec![ActionStep::mcp("srv1", "auto", Default::default())];
        c.executed_results.push(
            ActionResult::failed(ActionResult::MCP, "field 'title' is required")
                .with_server("srv1"),
        );
        assert!(default_should_continue(&cfg, &c));
    }

    #[test]
    fn non_param_error_stops() {
        let cfg = EngineConfig::default();
        let mut c = ctx();
        c.planned_actions = vec![ActionStep::mcp("srv1", "auto", Default::default())];
        c.executed_results
            .push(ActionResult::failed(ActionResult::MCP, "connection timeout"));
        assert!(!default_should_continue(&cfg, &c));
    }

    #[test]
    fn param_error_on_non_mcp_stops() {
        let cfg = EngineConfig::default();
        let mut c = ctx();
        c.planned_actions = vec![ActionStep::accept()];
        c.executed_results
            .push(ActionResult::failed("AG_ACCEPT", "missing field"));
        assert!(!default_should_continue(&cfg, &c));
    }

    #[test]
    fn successful_completion_stops() {
        let cfg = EngineConfig::default();
        let mut c = ctx();
        c.planned_actions = vec![ActionStep::accept()];
        c.executed_results
            .push(ActionResult::ok("AG_ACCEPT", Value::Null));
        assert!(!default_should_continue(&cfg, &c));
    }
}
