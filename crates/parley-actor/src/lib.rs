// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Agent actor runtime.
//!
//! Each live agent is one tokio task draining a FIFO mailbox; all mutable
//! state is owned by that task, so no per-actor locking exists anywhere.
//! Cross-agent coordination happens only through the topic bus and the
//! Redis-persisted action chains — actors never hold references to each
//! other.
//!
//! Behaviour differences between agent types live behind [`AgentBehavior`]
//! (`should_respond`, `plan_actions`, `should_continue`,
//! `register_builtin_tools`); [`ChatAgent`] is the default implementation.

mod actions;
mod behavior;
mod chain;
mod chat_agent;
mod context;
mod engine;
mod manager;
mod respond;
mod state;
mod summarize;

pub use actions::{
    ActionKind, ActionResult, ActionStep, DecisionAction, ResponseDecision, StepStatus,
};
pub use behavior::{ActorDeps, AgentBehavior, EngineConfig, PARAM_ERROR_KEYWORDS};
pub use chain::{ActionChain, ActionChainStore, ChainStatus};
pub use chat_agent::ChatAgent;
pub use context::{ExecutionLogEntry, IterationContext, ProcessStep};
pub use engine::{ActorCore, ActorEngine, ActorEvent, ActorHandle, ActorStatus};
pub use manager::ActorManager;
pub use state::{ActorState, HistoryEntry, PromptMessage};
pub use summarize::SUMMARY_SYSTEM_PROMPT;
