// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The actor engine: mailbox loop, decision dispatch, and ReAct iteration.
//!
//! One engine = one tokio task = one agent.  The task owns every piece of
//! mutable state; the [`ActorHandle`] only enqueues events, so ordering
//! within a topic follows publish order and no locks guard the state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use parley_bus::{EventType, ParsedEvent};
use parley_capability::CapabilityRegistry;
use parley_mcp::{McpExecutionRequest, McpExecutor, McpToolOutcome};
use parley_model::LlmConfig;
use parley_store::{
    AgentDirectory, AgentProfile, LlmConfigRepository, MessageExt, MessageRecord, MessageStore,
    NewMessage, Participant, SessionType,
};
use parley_topic::ProcessPhase;

use crate::actions::{
    ActionKind, ActionResult, ActionStep, DecisionAction, ResponseDecision, StepStatus,
};
use crate::behavior::{ActorDeps, AgentBehavior, EngineConfig};
use crate::chain::{ActionChain, ChainStatus};
use crate::context::{ExecutionLogEntry, IterationContext};
use crate::state::ActorState;
use crate::summarize::summarize_memory;

/// Snapshot of one actor for pool monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct ActorStatus {
    pub agent_id: String,
    pub topic_id: String,
    pub context_size: usize,
    pub context_messages: usize,
    pub persona: Value,
    pub messages_processed: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub default_model: String,
    pub default_provider: String,
    pub is_running: bool,
}

impl ActorStatus {
    fn initial(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            topic_id: String::new(),
            context_size: 0,
            context_messages: 0,
            persona: Value::Null,
            messages_processed: 0,
            errors: 0,
            error_rate: 0.0,
            default_model: "-".into(),
            default_provider: "-".into(),
            is_running: true,
        }
    }
}

/// Mailbox events.
#[derive(Debug)]
pub enum ActorEvent {
    /// Bind to a topic (or refresh if already bound) and optionally process a
    /// trigger message immediately.
    Activate {
        topic_id: String,
        trigger: Option<MessageRecord>,
        history_limit: Option<usize>,
    },
    /// A whitelisted bus event dispatched by the manager.
    Bus {
        topic_id: String,
        event_type: EventType,
        data: Value,
    },
    /// Edit-and-resend: roll back to just before the edited message, then
    /// process the replacement content as a fresh user turn.
    EditResend {
        topic_id: String,
        target_message_id: String,
        new_content: String,
    },
    Stop,
}

/// Cheap clonable mailbox handle.
#[derive(Clone)]
pub struct ActorHandle {
    pub agent_id: String,
    tx: mpsc::UnboundedSender<ActorEvent>,
    running: Arc<AtomicBool>,
    status: Arc<Mutex<ActorStatus>>,
}

impl ActorHandle {
    /// Enqueue a bus event.  Never blocks; a dead actor drops the event.
    pub fn on_event(&self, topic_id: &str, event: &ParsedEvent) {
        let _ = self.tx.send(ActorEvent::Bus {
            topic_id: topic_id.to_string(),
            event_type: event.event_type,
            data: event.data(),
        });
    }

    pub fn activate(
        &self,
        topic_id: &str,
        trigger: Option<MessageRecord>,
        history_limit: Option<usize>,
    ) {
        let _ = self.tx.send(ActorEvent::Activate {
            topic_id: topic_id.to_string(),
            trigger,
            history_limit,
        });
    }

    pub fn edit_resend(&self, topic_id: &str, target_message_id: &str, new_content: &str) {
        let _ = self.tx.send(ActorEvent::EditResend {
            topic_id: topic_id.to_string(),
            target_message_id: target_message_id.to_string(),
            new_content: new_content.to_string(),
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.tx.send(ActorEvent::Stop);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ActorStatus {
        self.status.lock().unwrap().clone()
    }
}

/// Everything a behavior hook may read about its actor.
pub struct ActorCore {
    pub agent_id: String,
    pub topic_id: Option<String>,
    pub profile: Option<AgentProfile>,
    /// Model of the default LLM config, resolved at activation (memory
    /// budgeting needs it without a DB round-trip per message).
    pub default_model: Option<String>,
    pub default_provider: Option<String>,
    pub state: ActorState,
    pub capabilities: CapabilityRegistry,
    pub deps: ActorDeps,
    pub config: EngineConfig,
    pub messages_processed: u64,
    pub errors: u64,
}

impl ActorCore {
    pub fn agent_name(&self) -> &str {
        self.profile
            .as_ref()
            .map(|p| p.name.as_str())
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.agent_id)
    }

    pub fn agent_avatar(&self) -> Option<&str> {
        self.profile.as_ref().and_then(|p| p.avatar.as_deref())
    }

    pub fn persona_prompt(&self) -> &str {
        self.profile
            .as_ref()
            .map(|p| p.system_prompt.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("你是一个AI助手。")
    }

    pub fn default_llm_config_id(&self) -> Option<&str> {
        self.profile.as_ref().and_then(|p| p.llm_config_id.as_deref())
    }

    /// Resolve the LLM config id for this call: explicit user config (when it
    /// differs from the session default), then user model lookup, then the
    /// session default.  No silent fallbacks past that.
    pub async fn resolve_llm_config_id(&self, ctx: &IterationContext) -> anyhow::Result<String> {
        let session_default = self.default_llm_config_id();

        if let Some(user_id) = ctx.user_selected_llm_config_id.as_deref() {
            if Some(user_id) != session_default {
                return Ok(user_id.to_string());
            }
        }
        if let Some(model) = ctx.user_selected_model.as_deref() {
            match self.deps.configs.find_by_model(model).await? {
                Some(config) => return Ok(config.config_id),
                None => {
                    debug!(agent_id = %self.agent_id, model, "no config for user model, using default");
                }
            }
        }
        session_default.map(str::to_string).ok_or_else(|| {
            anyhow::anyhow!(
                "Agent {} 未配置默认LLM模型，且用户未选择模型。请在Agent配置中设置默认LLM模型。",
                self.agent_id
            )
        })
    }

    pub(crate) async fn load_llm_config(&self, config_id: &str) -> anyhow::Result<LlmConfig> {
        self.deps
            .configs
            .find_by_id(config_id)
            .await?
            .with_context(|| format!("LLM config not found: {config_id}"))
    }

    fn status(&self, is_running: bool) -> ActorStatus {
        let model = self.default_model.clone().unwrap_or_else(|| "-".into());
        let context_size = self
            .default_model
            .as_deref()
            .map(|m| self.state.estimate_tokens(m))
            .unwrap_or(0);
        let persona = json!({
            "name": self.agent_name(),
            "avatar": self.agent_avatar(),
            "system_prompt": truncate(self.persona_prompt(), 200),
        });
        let error_rate = if self.messages_processed > 0 {
            self.errors as f64 / self.messages_processed as f64
        } else {
            0.0
        };
        ActorStatus {
            agent_id: self.agent_id.clone(),
            topic_id: self.topic_id.clone().unwrap_or_default(),
            context_size,
            context_messages: self.state.history.len(),
            persona,
            messages_processed: self.messages_processed,
            errors: self.errors,
            error_rate: (error_rate * 10_000.0).round() / 10_000.0,
            default_model: model,
            default_provider: self.default_provider.clone().unwrap_or_else(|| "-".into()),
            is_running,
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_chars).collect();
    format!("{cut}...")
}

pub(crate) fn new_reply_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("msg_{}", &hex[..8])
}

/// Models whose streams carry a separate reasoning trace.
const THINKING_MODELS: &[&str] = &[
    "claude-3-5-sonnet", "claude-3-opus", "claude-3-sonnet",
    "o1-preview", "o1-mini", "o1",
    "gemini-2.0-flash-thinking", "gemini-exp",
    "deepseek-reasoner", "deepseek-r1",
];

pub(crate) fn is_thinking_model(provider: &str, model: &str) -> bool {
    let model_lower = model.to_lowercase();
    if THINKING_MODELS.iter().any(|m| model_lower.contains(m)) {
        return true;
    }
    provider.eq_ignore_ascii_case("anthropic")
}

// ─── Engine ───────────────────────────────────────────────────────────────────

pub struct ActorEngine {
    pub(crate) core: ActorCore,
    pub(crate) behavior: Arc<dyn AgentBehavior>,
    rx: mpsc::UnboundedReceiver<ActorEvent>,
    running: Arc<AtomicBool>,
    status: Arc<Mutex<ActorStatus>>,
    tx: mpsc::UnboundedSender<ActorEvent>,
    activated: bool,
}

impl ActorEngine {
    pub fn new(
        agent_id: impl Into<String>,
        behavior: Arc<dyn AgentBehavior>,
        deps: ActorDeps,
        config: EngineConfig,
    ) -> Self {
        let agent_id = agent_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            core: ActorCore {
                agent_id: agent_id.clone(),
                topic_id: None,
                profile: None,
                default_model: None,
                default_provider: None,
                state: ActorState::new(),
                capabilities: CapabilityRegistry::new(),
                deps,
                config,
                messages_processed: 0,
                errors: 0,
            },
            behavior,
            rx,
            running: Arc::new(AtomicBool::new(true)),
            status: Arc::new(Mutex::new(ActorStatus::initial(&agent_id))),
            tx,
            activated: false,
        }
    }

    pub fn handle(&self) -> ActorHandle {
        ActorHandle {
            agent_id: self.core.agent_id.clone(),
            tx: self.tx.clone(),
            running: Arc::clone(&self.running),
            status: Arc::clone(&self.status),
        }
    }

    /// Construct and spawn in one go; returns the mailbox handle.
    pub fn spawn(
        agent_id: impl Into<String>,
        behavior: Arc<dyn AgentBehavior>,
        deps: ActorDeps,
        config: EngineConfig,
    ) -> ActorHandle {
        let engine = Self::new(agent_id, behavior, deps, config);
        let handle = engine.handle();
        tokio::spawn(engine.run());
        handle
    }

    /// Drain the mailbox until stopped.  The short dequeue timeout keeps
    /// shutdown responsive; no event is allowed to kill the task.
    pub async fn run(mut self) {
        info!(agent_id = %self.core.agent_id, "actor worker started");
        while self.running.load(Ordering::SeqCst) {
            let event = match tokio::time::timeout(Duration::from_secs(1), self.rx.recv()).await {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(event)) => event,
            };
            match event {
                ActorEvent::Stop => break,
                ActorEvent::Activate { topic_id, trigger, history_limit } => {
                    if let Err(e) = self.handle_activate(&topic_id, trigger, history_limit).await {
                        self.core.errors += 1;
                        error!(agent_id = %self.core.agent_id, topic_id = %topic_id, error = %e, "activation failed");
                    }
                }
                ActorEvent::Bus { topic_id, event_type, data } => {
                    self.handle_bus_event(&topic_id, event_type, data).await;
                }
                ActorEvent::EditResend { topic_id, target_message_id, new_content } => {
                    self.handle_edit_resend(&topic_id, &target_message_id, new_content)
                        .await;
                }
            }
            *self.status.lock().unwrap() = self.core.status(self.running.load(Ordering::SeqCst));
        }
        self.running.store(false, Ordering::SeqCst);
        self.status.lock().unwrap().is_running = false;
        info!(agent_id = %self.core.agent_id, "actor worker stopped");
    }

    // ─── Activation ──────────────────────────────────────────────────────────

    async fn handle_activate(
        &mut self,
        topic_id: &str,
        trigger: Option<MessageRecord>,
        history_limit: Option<usize>,
    ) -> anyhow::Result<()> {
        let limit = history_limit.unwrap_or(self.core.config.history_limit);
        let already_active = self.activated && self.core.topic_id.as_deref() == Some(topic_id);

        if already_active {
            debug!(agent_id = %self.core.agent_id, topic_id, "already active, refreshing history");
            let store = Arc::clone(self.core.deps.topics.message_store());
            self.core
                .state
                .load_history(store.as_ref(), topic_id, limit)
                .await?;
        } else {
            self.core.topic_id = Some(topic_id.to_string());
            self.load_profile().await?;
            self.load_capabilities().await;
            let store = Arc::clone(self.core.deps.topics.message_store());
            let loaded = self
                .core
                .state
                .load_history(store.as_ref(), topic_id, limit)
                .await?;
            self.activated = true;
            info!(
                agent_id = %self.core.agent_id,
                topic_id,
                history = loaded,
                "actor activated"
            );
        }

        if let Some(trigger) = trigger {
            self.handle_new_message(topic_id, trigger).await;
        }
        Ok(())
    }

    async fn load_profile(&mut self) -> anyhow::Result<()> {
        let profile = self
            .core
            .deps
            .agents
            .find_agent(&self.core.agent_id)
            .await?;
        if profile.is_none() {
            warn!(agent_id = %self.core.agent_id, "no agent profile found");
        }
        self.core.profile = profile;

        self.core.default_model = None;
        self.core.default_provider = None;
        if let Some(config_id) = self.core.default_llm_config_id().map(str::to_string) {
            if let Ok(Some(config)) = self.core.deps.configs.find_by_id(&config_id).await {
                self.core.default_model = Some(config.model);
                self.core.default_provider = Some(config.provider);
            }
        }
        Ok(())
    }

    async fn load_capabilities(&mut self) {
        self.core.capabilities.clear();
        if let Some(profile) = &self.core.profile {
            let servers = profile.mcp_servers();
            self.core.capabilities.load_mcp_servers(&servers);
        }
        match self
            .core
            .deps
            .agents
            .assigned_skill_packs(&self.core.agent_id)
            .await
        {
            Ok(packs) => {
                for pack in packs {
                    self.core.capabilities.register_skill(
                        parley_capability::SkillCapability {
                            skill_id: pack.skill_pack_id,
                            name: pack.name,
                            description: pack.summary,
                            trigger_keywords: pack.trigger_keywords,
                            steps: pack.steps,
                            required_mcps: Vec::new(),
                        },
                    );
                }
            }
            Err(e) => warn!(agent_id = %self.core.agent_id, error = %e, "skill pack load failed"),
        }
        let behavior = Arc::clone(&self.behavior);
        behavior.register_builtin_tools(&mut self.core.capabilities);
    }

    // ─── Event dispatch ──────────────────────────────────────────────────────

    async fn handle_bus_event(&mut self, topic_id: &str, event_type: EventType, data: Value) {
        match event_type {
            EventType::NewMessage => match serde_json::from_value::<MessageRecord>(data) {
                Ok(record) => self.handle_new_message(topic_id, record).await,
                Err(e) => warn!(agent_id = %self.core.agent_id, error = %e, "malformed new_message payload"),
            },
            EventType::MessagesRolledBack => {
                let to_id = data
                    .get("to_message_id")
                    .or_else(|| data.get("message_id"))
                    .and_then(Value::as_str);
                if let Some(to_id) = to_id {
                    self.core.state.clear_after(to_id);
                }
                self.core.state.drop_summary_if_stale();
            }
            EventType::TopicParticipantsUpdated => {
                let participants: Vec<Participant> = data
                    .get("participants")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                self.core.state.update_participants(participants);
            }
            // Roster deltas and metadata changes carry no actor-side state.
            _ => {}
        }
    }

    // ─── New-message pipeline ────────────────────────────────────────────────

    pub(crate) async fn handle_new_message(&mut self, topic_id: &str, record: MessageRecord) {
        // 1. Dedup: at most one full processing per (agent, message).
        if self.core.state.is_processed(&record.message_id) {
            debug!(agent_id = %self.core.agent_id, message_id = %record.message_id, "duplicate, skipping");
            return;
        }

        // 2. Record in light history (samples media for later re-attachment).
        self.core.state.append_record(&record);

        // 3. Own messages are dropped unless explicitly self-triggered
        //    (parameter-error retry or chained-step continuation).
        let ext = &record.ext;
        let self_triggered = ext.auto_trigger() && (ext.retry() || ext.chain_append());
        if record.sender_id == self.core.agent_id && !self_triggered {
            return;
        }

        let msg_type = classify_msg_type(&record);
        self.publish_phase(ProcessPhase::MsgTypeClassify, "completed", json!({ "msg_type": msg_type }))
            .await;
        info!(
            agent_id = %self.core.agent_id,
            message_id = %record.message_id,
            msg_type,
            preview = %truncate(&record.content, 50),
            "message received"
        );

        // 4. Memory budget: summarise before growing the prompt further.
        if let Some(model) = self.core.default_model.clone() {
            if self
                .core
                .state
                .check_memory_budget(&model, self.core.config.memory_budget_threshold)
            {
                let config_id = self.core.default_llm_config_id().map(str::to_string);
                summarize_memory(
                    &mut self.core.state,
                    &self.core.deps,
                    &self.core.agent_id,
                    config_id.as_deref(),
                    24,
                    12,
                )
                .await;
            }
        }

        // 5. Decide.
        let decision = self
            .behavior
            .should_respond(&self.core, topic_id, &record)
            .await;
        self.publish_phase(
            ProcessPhase::MsgPreDeal,
            "completed",
            json!({ "action": decision.action.as_str(), "reason": decision.reason }),
        )
        .await;

        // 6. Act on the decision.
        match decision.action {
            DecisionAction::Silent => self.handle_silent_decision(topic_id, &record, &decision).await,
            DecisionAction::Delegate => {
                self.handle_delegate_decision(topic_id, &record, &decision).await
            }
            DecisionAction::Like => self.handle_like(topic_id, &record).await,
            DecisionAction::Oppose => self.handle_oppose(topic_id, &record).await,
            DecisionAction::AskHuman => self.handle_ask_human(topic_id, &record).await,
            DecisionAction::Reply => self.process_message(topic_id, record, decision).await,
        }
    }

    // ─── ReAct processing ────────────────────────────────────────────────────

    pub(crate) async fn process_message(
        &mut self,
        topic_id: &str,
        record: MessageRecord,
        _decision: ResponseDecision,
    ) {
        let reply_message_id = new_reply_id();
        let mut ctx = IterationContext::new(
            record.clone(),
            topic_id,
            reply_message_id,
            self.core.config.max_iterations,
        );

        // Per-turn model overrides only apply in 1:1 agent sessions — group
        // topics keep each agent on its own default model.
        let session_type = self
            .core
            .deps
            .topics
            .get_topic(topic_id)
            .await
            .ok()
            .flatten()
            .map(|t| t.session_type);
        if session_type == Some(SessionType::Agent) {
            if let Some(config_id) = record.ext.user_llm_config_id() {
                ctx.user_selected_llm_config_id = Some(config_id.to_string());
            } else if let Some(model) = record.ext.get("model").and_then(Value::as_str) {
                ctx.user_selected_model = Some(model.to_string());
            }
        }

        self.check_inherited_chain(&mut ctx).await;

        let mut fields = Map::new();
        fields.insert("agent_id".into(), json!(self.core.agent_id));
        fields.insert("agent_name".into(), json!(self.core.agent_name()));
        ctx.add_step("agent_activated", Some("开始处理消息..."), fields);
        ctx.update_last_step(Some(StepStatus::Completed), Map::new());
        let entry = ctx.add_execution_log("开始处理消息...", "step", None, None);
        self.send_execution_log(topic_id, &entry).await;

        self.publish_agent_thinking(&ctx).await;
        self.core.messages_processed += 1;

        let outcome = self.run_iterations(&mut ctx).await;
        match outcome {
            Ok(()) => {}
            Err(e) => {
                self.core.errors += 1;
                error!(agent_id = %self.core.agent_id, topic_id, error = %e, "processing failed");
                ctx.mark_error(e.to_string());
                self.handle_process_error(&mut ctx).await;
            }
        }
    }

    async fn run_iterations(&mut self, ctx: &mut IterationContext) -> anyhow::Result<()> {
        let iteration_start = Utc::now();
        while !ctx.is_complete && ctx.iteration < ctx.max_iterations {
            ctx.iteration += 1;
            let entry = ctx.add_execution_log(
                format!("开始第 {} 轮迭代...", ctx.iteration),
                "step",
                None,
                None,
            );
            self.send_execution_log(&ctx.topic_id.clone(), &entry).await;

            self.iterate(ctx).await?;

            // Interrupts take effect at turn boundaries; long MCP calls are
            // never cancelled mid-flight.
            if self.check_interruption(ctx).await {
                ctx.mark_interrupted("用户中断");
                let entry = ctx.add_execution_log("处理被打断", "info", None, None);
                self.send_execution_log(&ctx.topic_id.clone(), &entry).await;
                break;
            }
        }
        let duration = (Utc::now() - iteration_start).num_milliseconds();
        let entry = ctx.add_execution_log(
            format!("迭代完成，共 {} 轮", ctx.iteration),
            "success",
            None,
            Some(duration),
        );
        self.send_execution_log(&ctx.topic_id.clone(), &entry).await;

        let entry = ctx.add_execution_log("开始生成回复...", "thinking", None, None);
        self.send_execution_log(&ctx.topic_id.clone(), &entry).await;
        self.generate_final_response(ctx).await
    }

    /// One ReAct turn: plan, execute the first pending planned action,
    /// observe.  A parameter-error retry re-executes the failed slot instead
    /// of consuming a new one, so `executed_results` never outgrows
    /// `planned_actions`.
    async fn iterate(&mut self, ctx: &mut IterationContext) -> anyhow::Result<()> {
        let entry = ctx.add_execution_log("规划行动...", "thinking", None, None);
        self.send_execution_log(&ctx.topic_id.clone(), &entry).await;

        // Is this turn a self-repair retry of the previous MCP failure?
        let repair = ctx
            .executed_results
            .last()
            .map(|r| {
                !r.success
                    && r.is_mcp()
                    && self
                        .core
                        .config
                        .is_param_error(r.error.as_deref().unwrap_or(""))
            })
            .unwrap_or(false);

        let plan_start = Utc::now();
        let actions = self.behavior.plan_actions(&self.core, ctx).await;
        let plan_duration = (Utc::now() - plan_start).num_milliseconds();
        ctx.planned_actions = actions;

        if ctx.planned_actions.is_empty() {
            let entry = ctx.add_execution_log(
                "无需执行行动，准备生成回复",
                "info",
                None,
                Some(plan_duration),
            );
            self.send_execution_log(&ctx.topic_id.clone(), &entry).await;
            ctx.mark_complete();
            return Ok(());
        }

        ctx.add_step(
            "thinking",
            Some(&format!("规划了 {} 个行动...", ctx.planned_actions.len())),
            Map::new(),
        );
        ctx.update_last_step(Some(StepStatus::Completed), Map::new());
        let entry = ctx.add_execution_log(
            format!("规划了 {} 个行动", ctx.planned_actions.len()),
            "step",
            None,
            Some(plan_duration),
        );
        self.send_execution_log(&ctx.topic_id.clone(), &entry).await;

        let slot = if repair {
            ctx.executed_results.len() - 1
        } else {
            ctx.executed_results.len()
        };
        let Some(mut action) = ctx.planned_actions.get(slot).cloned() else {
            // The plan shrank below what was already executed; nothing left.
            ctx.mark_complete();
            return Ok(());
        };
        let action_desc = action_description(&action);
        let entry = ctx.add_execution_log(format!("执行: {action_desc}"), "tool", None, None);
        self.send_execution_log(&ctx.topic_id.clone(), &entry).await;

        let exec_start = Utc::now();
        let result = self.execute_action(&mut action, ctx).await;
        let exec_duration = (Utc::now() - exec_start).num_milliseconds();
        let step_interrupted = action.interrupt;
        ctx.planned_actions[slot] = action;

        if result.success {
            let entry = ctx.add_execution_log(
                format!("执行成功: {action_desc}"),
                "success",
                None,
                Some(exec_duration),
            );
            self.send_execution_log(&ctx.topic_id.clone(), &entry).await;
        } else {
            let entry = ctx.add_execution_log(
                format!("执行失败: {action_desc}"),
                "error",
                result.error.clone(),
                Some(exec_duration),
            );
            self.send_execution_log(&ctx.topic_id.clone(), &entry).await;
        }
        if repair {
            *ctx.executed_results.last_mut().unwrap() = result;
        } else {
            ctx.executed_results.push(result);
        }

        self.advance_chain(ctx, step_interrupted).await;

        ctx.is_complete = !self.behavior.should_continue(&self.core, ctx);
        Ok(())
    }

    // ─── Action execution ────────────────────────────────────────────────────

    pub(crate) async fn execute_action(
        &mut self,
        step: &mut ActionStep,
        ctx: &mut IterationContext,
    ) -> ActionResult {
        debug!(
            agent_id = %self.core.agent_id,
            step_id = %step.step_id,
            action = step.action_type.as_str(),
            "executing action step"
        );
        match step.action_type {
            ActionKind::UseMcp => self.call_mcp(step, ctx).await,
            ActionKind::SelfGenerate => {
                // Generation happens in the final-response phase.
                ActionResult::ok("llm", json!({ "pending": true }))
            }
            ActionKind::CallAgent => match self.handle_call_agent_step(step, ctx).await {
                Ok(data) => ActionResult::ok(step.action_type.as_str(), data),
                Err(e) => ActionResult::failed(step.action_type.as_str(), e.to_string()),
            },
            ActionKind::CallHuman => {
                ActionResult::ok(step.action_type.as_str(), json!({ "waiting_for_human": true }))
            }
            ActionKind::Accept => {
                ActionResult::ok(step.action_type.as_str(), json!({ "accepted": true }))
            }
            ActionKind::Refuse => {
                // Refusal interrupts the chain: no later step may run.
                step.interrupt = true;
                ActionResult::ok(
                    step.action_type.as_str(),
                    json!({ "refused": true, "reason": step.param_str("reason").unwrap_or("") }),
                )
            }
            ActionKind::SelfDecision => ActionResult::ok(
                step.action_type.as_str(),
                json!({ "decision": step.param_str("decision").unwrap_or("") }),
            ),
        }
    }

    async fn call_mcp(&mut self, step: &ActionStep, ctx: &mut IterationContext) -> ActionResult {
        let start = Utc::now();
        let Some(server_id) = step.mcp_server_id.clone() else {
            return ActionResult::failed(ActionResult::MCP, "MCP step has no server id");
        };
        let server_name = self
            .core
            .capabilities
            .get_mcp(&server_id)
            .map(|m| m.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| server_id.clone());
        let tool_name = step.mcp_tool_name.clone().unwrap_or_else(|| "auto".into());

        let mut fields = Map::new();
        fields.insert("mcpServer".into(), json!(server_id));
        fields.insert("mcpServerName".into(), json!(server_name));
        fields.insert("toolName".into(), json!(tool_name));
        fields.insert("arguments".into(), Value::Object(step.params.clone()));
        fields.insert("iteration".into(), json!(ctx.iteration));
        ctx.add_step("mcp_call", Some(&format!("调用 MCP {server_name}...")), fields);

        let entry = ctx.add_execution_log(
            format!("开始调用 MCP 服务: {server_name}"),
            "tool",
            Some(format!("工具: {tool_name}")),
            None,
        );
        self.send_execution_log(&ctx.topic_id.clone(), &entry).await;

        let llm_config_id = match self.core.resolve_llm_config_id(ctx).await {
            Ok(id) => id,
            Err(e) => {
                let error = e.to_string();
                let mut extra = Map::new();
                extra.insert("error".into(), json!(error));
                ctx.update_last_step(Some(StepStatus::Error), extra);
                return ActionResult::failed(ActionResult::MCP, error).with_server(server_id);
            }
        };

        let history_context = build_mcp_context(&self.core.state, 8);
        let mut input_parts = Vec::new();
        if !history_context.is_empty() {
            input_parts.push(format!("【对话历史】\n{history_context}"));
        }
        input_parts.push(format!("【当前请求】\n{}", ctx.original_message.content));
        if !ctx.tool_results_text.is_empty() {
            input_parts.push(format!("【已有工具结果】\n{}", ctx.tool_results_text));
        }
        let input_text = input_parts.join("\n\n");

        let forced_tool_name = step
            .mcp_tool_name
            .as_deref()
            .filter(|t| !t.is_empty() && *t != "auto")
            .map(str::to_string);
        let request = McpExecutionRequest {
            server_id: server_id.clone(),
            input_text,
            llm_config_id,
            agent_system_prompt: Some(self.core.persona_prompt().to_string()),
            forced_tool_name,
            forced_tool_args: Some(Value::Object(step.params.clone())),
            enable_tool_calling: ctx.original_message.ext.use_tool_calling(),
            topic_id: Some(ctx.topic_id.clone()),
        };

        ctx.update_last_step(
            None,
            {
                let mut m = Map::new();
                m.insert("thinking".into(), json!(format!("正在执行 {server_name} 工具调用...")));
                m
            },
        );

        let outcome = match self.core.deps.mcp.execute_with_llm(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let error = e.to_string();
                let mut extra = Map::new();
                extra.insert("error".into(), json!(error));
                ctx.update_last_step(Some(StepStatus::Error), extra);
                return ActionResult::failed(ActionResult::MCP, error)
                    .with_duration((Utc::now() - start).num_milliseconds())
                    .with_server(server_id);
            }
        };
        let duration_ms = (Utc::now() - start).num_milliseconds();

        if let Some(top_error) = outcome.error.clone() {
            let detailed_error = format_tool_errors(&outcome.results, &top_error);

            // Parameter errors feed a repair block back into the tool results
            // so the next ReAct turn can fix the arguments.
            if self.core.config.is_param_error(&detailed_error) {
                let error_context = format!(
                    "\n【工具调用失败 - 需要修复参数】\n\n工具: {}\n服务器: {}\n错误信息: {}\n\n请分析上述错误信息，找出缺失或错误的参数，然后重新调用工具并传递正确的参数。\n",
                    step.mcp_tool_name.as_deref().unwrap_or("auto"),
                    server_id,
                    detailed_error,
                );
                ctx.append_tool_result(&format!("MCP:{server_id}"), &error_context);
            }

            let mut extra = Map::new();
            extra.insert("error".into(), json!(detailed_error));
            ctx.update_last_step(Some(StepStatus::Error), extra);
            return ActionResult::failed(ActionResult::MCP, detailed_error)
                .with_duration(duration_ms)
                .with_server(server_id);
        }

        let mut tool_text = outcome.tool_text.clone().unwrap_or_default();
        let partial_errors: Vec<String> = outcome
            .results
            .iter()
            .filter_map(|r| {
                let error = r.error.as_deref()?;
                let kind = r
                    .error_kind
                    .as_ref()
                    .map(|k| k.label().to_string())
                    .unwrap_or_else(|| "unknown".into());
                Some(format!("{}({}): {}", r.tool, kind, error))
            })
            .collect();
        if !partial_errors.is_empty() {
            tool_text.push_str("\n\n⚠️ 部分工具执行失败:\n");
            tool_text.push_str(&partial_errors.join("\n"));
        }

        let success_count = outcome.results.iter().filter(|r| r.error.is_none()).count();
        let mut completion_msg = format!("{server_name} 调用完成");
        if success_count > 0 {
            completion_msg.push_str(&format!("（成功 {success_count} 个工具"));
            if !partial_errors.is_empty() {
                completion_msg.push_str(&format!("，失败 {} 个", partial_errors.len()));
            }
            completion_msg.push('）');
        }

        let mut extra = Map::new();
        extra.insert("thinking".into(), json!(completion_msg));
        extra.insert(
            "result".into(),
            json!({
                "summary": outcome.summary,
                "tool_text": truncate(&tool_text, 500),
                "content": outcome.media.clone(),
            }),
        );
        ctx.update_last_step(Some(StepStatus::Completed), extra);

        if !outcome.media.is_empty() {
            ctx.mcp_media.extend(outcome.media.clone());
        }
        if !tool_text.is_empty() {
            ctx.append_tool_result(&format!("MCP:{server_id}"), &tool_text);
        }

        ActionResult::ok(ActionResult::MCP, serde_json::to_value(&outcome).unwrap_or(Value::Null))
            .with_text(tool_text)
            .with_duration(duration_ms)
            .with_server(server_id)
    }

    /// `AG_CALL_AG`: persist the chain, post the `@`-message, do not wait.
    async fn handle_call_agent_step(
        &mut self,
        step: &ActionStep,
        ctx: &mut IterationContext,
    ) -> anyhow::Result<Value> {
        let target = step
            .target_agent_id
            .clone()
            .context("AG_CALL_AG step has no target agent")?;
        let target_topic = step
            .target_topic_id
            .clone()
            .unwrap_or_else(|| ctx.topic_id.clone());
        let message = step.param_str("message").unwrap_or("").to_string();

        // Chains are created lazily on the first cross-agent step.
        if ctx.action_chain_id.is_none() {
            let mut chain = ActionChain::new(
                format!("Chain for {}", ctx.reply_message_id),
                self.core.agent_id.as_str(),
                ctx.topic_id.as_str(),
            );
            chain.status = ChainStatus::Running;
            chain.add_step(step.clone());
            self.core.deps.chains.save(&chain).await?;
            info!(agent_id = %self.core.agent_id, chain_id = %chain.chain_id, "action chain created");
            ctx.action_chain_id = Some(chain.chain_id);
            ctx.inherited_chain = false;
            ctx.chain_step_index = 0;
        } else if let Some(chain_id) = &ctx.action_chain_id {
            if let Some(chain) = self.core.deps.chains.load(chain_id).await {
                self.core.deps.chains.save(&chain).await?;
            }
        }

        let content = format!("@{target} {message}");
        let ext = MessageExt::new()
            .with("action_chain_id", json!(ctx.action_chain_id))
            .with("chain_step_index", json!(ctx.chain_step_index))
            .with("origin_agent_id", json!(self.core.agent_id))
            .with("delegated_to", json!(target));

        self.core
            .deps
            .topics
            .send_message(
                NewMessage {
                    sender_name: Some(self.core.agent_name().to_string()),
                    sender_avatar: self.core.agent_avatar().map(str::to_string),
                    ..NewMessage::agent(target_topic.as_str(), self.core.agent_id.as_str(), content)
                }
                .with_mentions(vec![target.clone()])
                .with_ext(ext),
            )
            .await?;

        info!(agent_id = %self.core.agent_id, target_agent = %target, "called agent via @ message");
        Ok(json!({
            "called_agent": target,
            "chain_id": ctx.action_chain_id,
            "message_sent": true,
        }))
    }

    // ─── Chain bookkeeping ───────────────────────────────────────────────────

    /// Resume a chain carried in the incoming message's ext, if any.  A
    /// missing chain is logged and ignored — the message is then processed
    /// fresh rather than failing the user request.
    async fn check_inherited_chain(&mut self, ctx: &mut IterationContext) {
        let Some(chain_id) = ctx.original_message.ext.action_chain_id().map(str::to_string) else {
            return;
        };
        let Some(chain) = self.core.deps.chains.load(&chain_id).await else {
            warn!(agent_id = %self.core.agent_id, chain_id = %chain_id, "inherited chain not found, processing fresh");
            return;
        };

        ctx.action_chain_id = Some(chain_id.clone());
        ctx.inherited_chain = true;
        ctx.chain_step_index = ctx
            .original_message
            .ext
            .chain_step_index()
            .unwrap_or(chain.current_index);

        info!(
            agent_id = %self.core.agent_id,
            chain_id = %chain_id,
            step = ctx.chain_step_index,
            total = chain.steps.len(),
            "inherited action chain"
        );

        let progress = format!("{}/{}", ctx.chain_step_index + 1, chain.steps.len());
        let mut fields = Map::new();
        fields.insert("chain_id".into(), json!(chain_id));
        fields.insert("chain_progress".into(), json!(progress));
        fields.insert(
            "origin_agent_id".into(),
            json!(ctx.original_message.ext.origin_agent_id()),
        );
        ctx.add_step(
            "action_chain_resumed",
            Some(&format!("接续处理 ActionChain，当前进度 {progress}")),
            fields,
        );
        ctx.update_last_step(Some(StepStatus::Completed), Map::new());
    }

    /// After a step in a chained run: advance the cursor, persist, publish
    /// progress.  An interrupted step (refusal) freezes the chain instead of
    /// advancing past it.
    async fn advance_chain(&mut self, ctx: &mut IterationContext, step_interrupted: bool) {
        let Some(chain_id) = ctx.action_chain_id.clone() else { return };
        let Some(mut chain) = self.core.deps.chains.load(&chain_id).await else { return };
        if chain.status == ChainStatus::Pending {
            chain.status = ChainStatus::Running;
        }
        if step_interrupted {
            chain.status = ChainStatus::Completed;
        } else {
            chain.advance();
        }
        ctx.chain_step_index = chain.current_index;
        if let Err(e) = self.core.deps.chains.save(&chain).await {
            warn!(agent_id = %self.core.agent_id, chain_id = %chain_id, error = %e, "chain save failed");
        }
        let progress = chain.progress();
        self.core
            .deps
            .topics
            .publish_action_chain_progress(
                &ctx.topic_id,
                &self.core.agent_id,
                &chain.chain_id,
                chain.current_index,
                chain.steps.len(),
                progress["status"].as_str().unwrap_or("running"),
                progress["current_step"].clone(),
            )
            .await;
    }

    // ─── Edit and resend ─────────────────────────────────────────────────────

    /// Roll back to the message before `target_message_id` (local history and
    /// store), then process the replacement content as a fresh user turn.
    /// The replacement keeps the edited message's sender.
    async fn handle_edit_resend(
        &mut self,
        topic_id: &str,
        target_message_id: &str,
        new_content: String,
    ) {
        let target_pos = self
            .core
            .state
            .history
            .iter()
            .position(|m| m.message_id.as_deref() == Some(target_message_id));
        let (prev_id, sender_id) = match target_pos {
            Some(idx) => (
                idx.checked_sub(1)
                    .and_then(|p| self.core.state.history[p].message_id.clone()),
                self.core.state.history[idx].sender_id.clone(),
            ),
            None => {
                warn!(
                    agent_id = %self.core.agent_id,
                    target_message_id,
                    "edit target not in history, processing as fresh message"
                );
                (None, String::new())
            }
        };

        if let Some(prev_id) = prev_id {
            self.core.state.clear_after(&prev_id);
            let store = Arc::clone(self.core.deps.topics.message_store());
            if let Err(e) = store.delete_after(topic_id, &prev_id).await {
                warn!(agent_id = %self.core.agent_id, error = %e, "edit rollback delete failed");
            }
        }

        let record = MessageRecord {
            message_id: new_reply_id(),
            topic_id: topic_id.to_string(),
            sender_id,
            sender_type: parley_store::SenderType::User,
            sender_name: None,
            sender_avatar: None,
            role: parley_model::Role::User,
            content: new_content,
            created_at: Utc::now(),
            mentions: Vec::new(),
            ext: MessageExt::new(),
        };
        self.core.state.append_record(&record);
        self.process_message(topic_id, record, ResponseDecision::reply("编辑重发"))
            .await;
    }

    // ─── Interrupts ──────────────────────────────────────────────────────────

    pub(crate) async fn check_interruption(&self, ctx: &IterationContext) -> bool {
        let interrupted = self
            .core
            .deps
            .topics
            .check_interrupt(&ctx.topic_id, &self.core.agent_id)
            .await;
        if interrupted {
            info!(agent_id = %self.core.agent_id, topic_id = %ctx.topic_id, "interrupted via flag");
            self.core
                .deps
                .topics
                .clear_interrupt(&ctx.topic_id, &self.core.agent_id)
                .await;
        }
        interrupted
    }

    // ─── Event helpers ───────────────────────────────────────────────────────

    /// Fan out one log line.  The entry nests under `data` — its own `type`
    /// (info/tool/thinking/…) must not collide with the envelope's event type.
    pub(crate) async fn send_execution_log(&self, topic_id: &str, entry: &ExecutionLogEntry) {
        let mut log = serde_json::to_value(entry).unwrap_or(Value::Null);
        if let Some(obj) = log.as_object_mut() {
            obj.insert("agent_id".into(), json!(self.core.agent_id));
            obj.insert("agent_name".into(), json!(self.core.agent_name()));
        }
        let mut fields = Map::new();
        fields.insert("data".into(), log);
        self.core
            .deps
            .topics
            .publish_event(topic_id, EventType::ExecutionLog, fields)
            .await;
    }

    pub(crate) async fn publish_phase(&self, phase: ProcessPhase, status: &str, data: Value) {
        let Some(topic_id) = self.core.topic_id.clone() else { return };
        self.core
            .deps
            .topics
            .publish_process_event(
                &topic_id,
                phase,
                &self.core.agent_id,
                status,
                data,
                Some(self.core.agent_name()),
                self.core.agent_avatar(),
            )
            .await;
    }

    pub(crate) fn agent_event_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("agent_id".into(), json!(self.core.agent_id));
        fields.insert("agent_name".into(), json!(self.core.agent_name()));
        fields.insert("agent_avatar".into(), json!(self.core.agent_avatar()));
        fields
    }

    async fn publish_agent_thinking(&self, ctx: &IterationContext) {
        let mut fields = self.agent_event_fields();
        fields.insert("message_id".into(), json!(ctx.reply_message_id));
        fields.insert("processSteps".into(), ctx.process_steps_value());
        fields.insert("processMessages".into(), ctx.to_process_messages());
        fields.insert("in_reply_to".into(), json!(ctx.original_message.message_id));
        self.core
            .deps
            .topics
            .publish_event(&ctx.topic_id, EventType::AgentThinking, fields)
            .await;
    }

    // ─── Decision handlers ───────────────────────────────────────────────────

    async fn handle_silent_decision(
        &self,
        topic_id: &str,
        record: &MessageRecord,
        decision: &ResponseDecision,
    ) {
        let mut fields = self.agent_event_fields();
        fields.insert("in_reply_to".into(), json!(record.message_id));
        fields.insert("reason".into(), json!(decision.reason));
        self.core
            .deps
            .topics
            .publish_event(topic_id, EventType::AgentSilent, fields)
            .await;
    }

    async fn handle_delegate_decision(
        &mut self,
        topic_id: &str,
        record: &MessageRecord,
        decision: &ResponseDecision,
    ) {
        let Some(target) = decision.delegate_to.clone() else {
            warn!(agent_id = %self.core.agent_id, "delegate decision without target");
            return;
        };
        let user_text = record.content.trim();
        let content = format!("@{target} 我认为这个问题更适合你处理：{user_text}");
        let ext = MessageExt::new().with("delegated_to", json!(target));
        let sent = self
            .core
            .deps
            .topics
            .send_message(
                NewMessage {
                    sender_name: Some(self.core.agent_name().to_string()),
                    sender_avatar: self.core.agent_avatar().map(str::to_string),
                    ..NewMessage::agent(topic_id, self.core.agent_id.as_str(), content)
                }
                .with_mentions(vec![target])
                .with_ext(ext),
            )
            .await;
        match sent {
            Ok(record) => self.core.state.append_record(&record),
            Err(e) => warn!(agent_id = %self.core.agent_id, error = %e, "delegate message failed"),
        }
    }

    async fn handle_like(&self, topic_id: &str, record: &MessageRecord) {
        if record.message_id.is_empty() {
            return;
        }
        let mut fields = Map::new();
        fields.insert("reaction".into(), json!("like"));
        fields.insert("message_id".into(), json!(record.message_id));
        fields.insert("from_agent_id".into(), json!(self.core.agent_id));
        fields.insert("from_agent_name".into(), json!(self.core.agent_name()));
        fields.insert("target_sender_id".into(), json!(record.sender_id));
        fields.insert("target_sender_type".into(), json!(record.sender_type));
        self.core
            .deps
            .topics
            .publish_event(topic_id, EventType::Reaction, fields)
            .await;
    }

    async fn handle_oppose(&mut self, topic_id: &str, record: &MessageRecord) {
        let mut quoted = record.content.trim().replace('\n', " ");
        if quoted.chars().count() > 120 {
            quoted = quoted.chars().take(120).collect::<String>() + "...";
        }
        let content = format!("> 引用：{quoted}\n\n我不同意上述观点。我的理由是：……");
        let ext = MessageExt::new().with(
            "quotedMessage",
            json!({ "id": record.message_id, "content": record.content }),
        );
        let sent = self
            .core
            .deps
            .topics
            .send_message(
                NewMessage {
                    sender_name: Some(self.core.agent_name().to_string()),
                    sender_avatar: self.core.agent_avatar().map(str::to_string),
                    ..NewMessage::agent(topic_id, self.core.agent_id.as_str(), content)
                }
                .with_ext(ext),
            )
            .await;
        match sent {
            Ok(record) => self.core.state.append_record(&record),
            Err(e) => warn!(agent_id = %self.core.agent_id, error = %e, "oppose message failed"),
        }
    }

    async fn handle_ask_human(&mut self, topic_id: &str, record: &MessageRecord) {
        let user_text = record.content.trim();
        let content = format!("@human 我需要你确认/执行以下事项：{user_text}");
        let ext = MessageExt::new().with("needs_human", json!(true));
        let sent = self
            .core
            .deps
            .topics
            .send_message(
                NewMessage {
                    sender_name: Some(self.core.agent_name().to_string()),
                    sender_avatar: self.core.agent_avatar().map(str::to_string),
                    ..NewMessage::agent(topic_id, self.core.agent_id.as_str(), content)
                }
                .with_ext(ext),
            )
            .await;
        match sent {
            Ok(record) => self.core.state.append_record(&record),
            Err(e) => warn!(agent_id = %self.core.agent_id, error = %e, "ask_human message failed"),
        }
    }
}

// ─── Free helpers ─────────────────────────────────────────────────────────────

fn action_description(action: &ActionStep) -> String {
    match action.action_type {
        ActionKind::UseMcp => format!(
            "MCP {}:{}",
            action.mcp_server_id.as_deref().unwrap_or("?"),
            action.mcp_tool_name.as_deref().unwrap_or("auto"),
        ),
        ActionKind::SelfGenerate => "调用 LLM".into(),
        ActionKind::CallAgent => format!(
            "委托给 {}",
            action.target_agent_id.as_deref().unwrap_or("?")
        ),
        other => other.as_str().to_string(),
    }
}

/// user_new_msg | agent_msg | agent_toolcall_msg, from sender type + ext.
fn classify_msg_type(record: &MessageRecord) -> &'static str {
    use parley_store::SenderType;
    match record.sender_type {
        SenderType::Agent => {
            if record.ext.chain_append() || record.ext.auto_trigger() {
                "agent_msg"
            } else if record
                .ext
                .get("tool_call")
                .and_then(|tc| tc.get("tool_name"))
                .and_then(Value::as_str)
                .is_some()
            {
                "agent_toolcall_msg"
            } else {
                "user_new_msg"
            }
        }
        SenderType::System if record.ext.mcp_error() && record.ext.auto_trigger() => "agent_msg",
        _ => "user_new_msg",
    }
}

/// Last `max_history` turns formatted for the MCP executor's tool-selection
/// context.
fn build_mcp_context(state: &ActorState, max_history: usize) -> String {
    let start = state.history.len().saturating_sub(max_history);
    let mut lines = Vec::new();
    for msg in &state.history[start..] {
        if msg.content.is_empty() {
            continue;
        }
        let mut content = msg.content.clone();
        if content.chars().count() > 500 {
            content = content.chars().take(500).collect::<String>() + "...";
        }
        let role_label = match msg.role {
            parley_model::Role::User => "用户",
            _ => "助手",
        };
        lines.push(format!("{role_label}: {content}"));
    }
    lines.join("\n")
}

/// Fold per-tool errors into one detail block, labelled by error class.
fn format_tool_errors(results: &[McpToolOutcome], top_error: &str) -> String {
    let details: Vec<String> = results
        .iter()
        .filter_map(|r| {
            let error = r.error.as_deref()?;
            let label = r
                .error_kind
                .as_ref()
                .map(|k| k.label().to_string())
                .unwrap_or_else(|| "unknown".into());
            Some(format!("[{label}] {}: {error}", r.tool))
        })
        .collect();
    if details.is_empty() {
        top_error.to_string()
    } else {
        details.join("\n")
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parley_store::{MessageExt, SenderType};
    use parley_model::Role;

    fn record(sender_type: SenderType, ext: MessageExt) -> MessageRecord {
        MessageRecord {
            message_id: "m1".into(),
            topic_id: "t1".into(),
            sender_id: "a1".into(),
            sender_type,
            sender_name: None,
            sender_avatar: None,
            role: Role::User,
            content: "hi".into(),
            created_at: Utc::now(),
            mentions: vec![],
            ext,
        }
    }

    #[test]
    fn classify_user_message() {
        let r = record(SenderType::User, MessageExt::new());
        assert_eq!(classify_msg_type(&r), "user_new_msg");
    }

    #[test]
    fn classify_chain_append_agent_message() {
        let ext = MessageExt::new()
            .with("chain_append", json!(true))
            .with("auto_trigger", json!(true));
        let r = record(SenderType::Agent, ext);
        assert_eq!(classify_msg_type(&r), "agent_msg");
    }

    #[test]
    fn classify_toolcall_agent_message() {
        let ext = MessageExt::new().with("tool_call", json!({ "tool_name": "send_post" }));
        let r = record(SenderType::Agent, ext);
        assert_eq!(classify_msg_type(&r), "agent_toolcall_msg");
    }

    #[test]
    fn classify_mcp_error_system_message() {
        let ext = MessageExt::new()
            .with("mcp_error", json!(true))
            .with("auto_trigger", json!(true));
        let r = record(SenderType::System, ext);
        assert_eq!(classify_msg_type(&r), "agent_msg");
    }

    #[test]
    fn thinking_model_detection() {
        assert!(is_thinking_model("openai", "o1-mini"));
        assert!(is_thinking_model("deepseek", "deepseek-r1-distill"));
        assert!(is_thinking_model("anthropic", "any-model"));
        assert!(!is_thinking_model("openai", "gpt-4o"));
    }

    #[test]
    fn tool_errors_fold_with_labels() {
        use parley_mcp::McpErrorKind;
        let results = vec![
            McpToolOutcome::failed("send_post", "field 'title' is required", McpErrorKind::Business),
            McpToolOutcome::ok("list_posts", json!("ok")),
        ];
        let text = format_tool_errors(&results, "batch failed");
        assert_eq!(text, "[业务错误] send_post: field 'title' is required");
    }

    #[test]
    fn tool_errors_fall_back_to_top_error() {
        let text = format_tool_errors(&[], "batch failed");
        assert_eq!(text, "batch failed");
    }

    #[test]
    fn reply_id_shape() {
        let id = new_reply_id();
        assert!(id.starts_with("msg_"));
        assert_eq!(id.len(), 12);
    }
}
