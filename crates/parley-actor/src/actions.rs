use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

// ─── Action steps ─────────────────────────────────────────────────────────────

/// The closed set of actions an agent can take in one ReAct turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    #[serde(rename = "AG_USE_MCP")]
    UseMcp,
    #[serde(rename = "AG_SELF_GEN")]
    SelfGenerate,
    #[serde(rename = "AG_CALL_AG")]
    CallAgent,
    #[serde(rename = "AG_CALL_HUMAN")]
    CallHuman,
    #[serde(rename = "AG_ACCEPT")]
    Accept,
    #[serde(rename = "AG_REFUSE")]
    Refuse,
    #[serde(rename = "AG_SELF_DECISION")]
    SelfDecision,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::UseMcp => "AG_USE_MCP",
            ActionKind::SelfGenerate => "AG_SELF_GEN",
            ActionKind::CallAgent => "AG_CALL_AG",
            ActionKind::CallHuman => "AG_CALL_HUMAN",
            ActionKind::Accept => "AG_ACCEPT",
            ActionKind::Refuse => "AG_REFUSE",
            ActionKind::SelfDecision => "AG_SELF_DECISION",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Error,
}

/// One step of an agent's plan (and of an [`ActionChain`](crate::ActionChain)).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStep {
    pub step_id: String,
    pub action_type: ActionKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_topic_id: Option<String>,
    #[serde(default = "default_status")]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// When set, the chain stops after this step (refusal).
    #[serde(default)]
    pub interrupt: bool,
}

fn default_status() -> StepStatus {
    StepStatus::Pending
}

fn new_step_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl ActionStep {
    fn base(action_type: ActionKind, description: impl Into<String>) -> Self {
        Self {
            step_id: new_step_id(),
            action_type,
            description: description.into(),
            params: Map::new(),
            mcp_server_id: None,
            mcp_tool_name: None,
            target_agent_id: None,
            target_topic_id: None,
            status: StepStatus::Pending,
            result: None,
            interrupt: false,
        }
    }

    /// MCP invocation.  `tool_name = "auto"` lets the MCP executor pick.
    pub fn mcp(
        server_id: impl Into<String>,
        tool_name: impl Into<String>,
        params: Map<String, Value>,
    ) -> Self {
        let server_id = server_id.into();
        let tool_name = tool_name.into();
        let mut step = Self::base(ActionKind::UseMcp, format!("调用 MCP {server_id}"));
        step.params = params;
        step.mcp_server_id = Some(server_id);
        step.mcp_tool_name = Some(tool_name);
        step
    }

    /// Cross-agent hand-off via `@`-mention.
    pub fn call_agent(
        target_agent_id: impl Into<String>,
        target_topic_id: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        let target = target_agent_id.into();
        let mut step = Self::base(ActionKind::CallAgent, format!("调用 Agent {target}"));
        step.params.insert("message".into(), json!(message.into()));
        step.target_agent_id = Some(target);
        step.target_topic_id = target_topic_id;
        step
    }

    pub fn self_generate(description: impl Into<String>) -> Self {
        Self::base(ActionKind::SelfGenerate, description)
    }

    pub fn call_human(message: impl Into<String>) -> Self {
        let mut step = Self::base(ActionKind::CallHuman, "请求人类协助");
        step.params.insert("message".into(), json!(message.into()));
        step
    }

    pub fn accept() -> Self {
        Self::base(ActionKind::Accept, "接受处理")
    }

    pub fn refuse(reason: impl Into<String>) -> Self {
        let mut step = Self::base(ActionKind::Refuse, "拒绝处理");
        step.params.insert("reason".into(), json!(reason.into()));
        step
    }

    pub fn self_decision(decision: impl Into<String>) -> Self {
        let mut step = Self::base(ActionKind::SelfDecision, "自主决策");
        step.params.insert("decision".into(), json!(decision.into()));
        step
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

// ─── Action results ───────────────────────────────────────────────────────────

/// Outcome of executing one [`ActionStep`].
///
/// `action_type` is the dispatch label (`"mcp"` for MCP calls, the step's
/// kind string otherwise); the self-repair check keys on it.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub action_type: String,
    pub success: bool,
    pub data: Value,
    pub text: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub mcp_server_id: Option<String>,
}

impl ActionResult {
    pub const MCP: &'static str = "mcp";

    pub fn ok(action_type: impl Into<String>, data: Value) -> Self {
        Self {
            action_type: action_type.into(),
            success: true,
            data,
            text: None,
            error: None,
            duration_ms: None,
            mcp_server_id: None,
        }
    }

    pub fn failed(action_type: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            success: false,
            data: Value::Null,
            text: None,
            error: Some(error.into()),
            duration_ms: None,
            mcp_server_id: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_server(mut self, server_id: impl Into<String>) -> Self {
        self.mcp_server_id = Some(server_id.into());
        self
    }

    pub fn is_mcp(&self) -> bool {
        self.action_type == Self::MCP
    }
}

// ─── Response decisions ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    Reply,
    Silent,
    Delegate,
    Like,
    Oppose,
    AskHuman,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionAction::Reply => "reply",
            DecisionAction::Silent => "silent",
            DecisionAction::Delegate => "delegate",
            DecisionAction::Like => "like",
            DecisionAction::Oppose => "oppose",
            DecisionAction::AskHuman => "ask_human",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "reply" => DecisionAction::Reply,
            "silent" => DecisionAction::Silent,
            "delegate" => DecisionAction::Delegate,
            "like" => DecisionAction::Like,
            "oppose" => DecisionAction::Oppose,
            "ask_human" => DecisionAction::AskHuman,
            _ => return None,
        })
    }
}

/// What an agent decided to do about an incoming message.
#[derive(Debug, Clone)]
pub struct ResponseDecision {
    pub action: DecisionAction,
    pub reason: String,
    pub delegate_to: Option<String>,
    pub needs_thinking: bool,
}

impl ResponseDecision {
    pub fn reply(reason: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Reply,
            reason: reason.into(),
            delegate_to: None,
            needs_thinking: true,
        }
    }

    /// Reply without the thinking phase (private chats, normal mode).
    pub fn reply_quick(reason: impl Into<String>) -> Self {
        Self { needs_thinking: false, ..Self::reply(reason) }
    }

    pub fn silent(reason: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Silent,
            reason: reason.into(),
            delegate_to: None,
            needs_thinking: false,
        }
    }

    pub fn delegate(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action: DecisionAction::Delegate,
            reason: reason.into(),
            delegate_to: Some(target.into()),
            needs_thinking: false,
        }
    }

    pub fn of(action: DecisionAction, reason: impl Into<String>) -> Self {
        Self { action, reason: reason.into(), delegate_to: None, needs_thinking: false }
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
