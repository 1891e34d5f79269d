use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use parley_model::Role;

// ─── Enumerations ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    User,
    Agent,
    System,
}

/// Conversation mode of a topic.
///
/// - `Agent` — 1:1 session with a single agent (user overrides allowed)
/// - `PrivateChat` — private user+agent chat, always replied to
/// - `TopicGeneral` — multi-participant group topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Agent,
    PrivateChat,
    TopicGeneral,
    Memory,
    #[serde(other)]
    Unknown,
}

// ─── Ext envelope ─────────────────────────────────────────────────────────────

/// The opaque extension envelope carried on every message.
///
/// Stored and forwarded as-is; the typed accessors below cover only the keys
/// the core reads.  Unknown keys survive round-trips untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageExt(pub Map<String, Value>);

impl MessageExt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.set(key, value);
        self
    }

    fn flag(&self, key: &str) -> bool {
        self.0.get(key).map(truthy).unwrap_or(false)
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    // -- self-loop safeguards --

    pub fn auto_trigger(&self) -> bool {
        self.flag("auto_trigger")
    }

    pub fn retry(&self) -> bool {
        self.flag("retry")
    }

    pub fn chain_append(&self) -> bool {
        self.flag("chain_append")
    }

    pub fn mcp_error(&self) -> bool {
        self.flag("mcp_error")
    }

    // -- action chain hand-off --

    pub fn action_chain_id(&self) -> Option<&str> {
        self.str_field("action_chain_id")
    }

    pub fn chain_step_index(&self) -> Option<usize> {
        self.0
            .get("chain_step_index")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
    }

    pub fn origin_agent_id(&self) -> Option<&str> {
        self.str_field("origin_agent_id")
    }

    // -- model selection --

    pub fn user_llm_config_id(&self) -> Option<&str> {
        self.str_field("user_llm_config_id")
    }

    /// MCP server ids selected for this message.  Accepts the three spellings
    /// seen on the wire and a bare string as a one-element list.
    pub fn mcp_servers(&self) -> Vec<String> {
        for key in ["mcp_servers", "selectedMcpServerIds", "selected_mcp_server_ids"] {
            match self.0.get(key) {
                Some(Value::Array(arr)) => {
                    let ids: Vec<String> = arr
                        .iter()
                        .filter_map(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                    if !ids.is_empty() {
                        return ids;
                    }
                }
                Some(Value::String(s)) if !s.is_empty() => return vec![s.clone()],
                _ => {}
            }
        }
        Vec::new()
    }

    pub fn use_tool_calling(&self) -> bool {
        self.0.get("use_tool_calling").map(truthy).unwrap_or(true)
    }

    /// `ext.imageGen.useThoughtSignature`, defaulting to true.  When off, the
    /// engine neither re-attaches historical media nor requests signature
    /// round-tripping (fresh image generation).
    pub fn use_thought_signature(&self) -> bool {
        self.0
            .get("imageGen")
            .and_then(|v| v.get("useThoughtSignature"))
            .map(truthy)
            .unwrap_or(true)
    }

    // -- media --

    /// Raw media list, exactly as stored.
    pub fn media_raw(&self) -> Option<&Vec<Value>> {
        self.0.get("media").and_then(Value::as_array).filter(|a| !a.is_empty())
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        _ => false,
    }
}

impl From<Map<String, Value>> for MessageExt {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

// ─── Records ──────────────────────────────────────────────────────────────────

/// A persisted topic message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub topic_id: String,
    pub sender_id: String,
    pub sender_type: SenderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_avatar: Option<String>,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,
    #[serde(default, skip_serializing_if = "MessageExt::is_empty")]
    pub ext: MessageExt,
}

/// Input for appending a message.  `message_id` may be pre-assigned (reply
/// ids are fixed before streaming starts); otherwise the store generates a
/// `msg_<hex8>` id.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub topic_id: String,
    pub sender_id: String,
    pub sender_type: SenderType,
    pub role: Role,
    pub content: String,
    pub message_id: Option<String>,
    pub mentions: Vec<String>,
    pub ext: MessageExt,
    pub sender_name: Option<String>,
    pub sender_avatar: Option<String>,
}

impl NewMessage {
    pub fn user(topic_id: impl Into<String>, sender_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            topic_id: topic_id.into(),
            sender_id: sender_id.into(),
            sender_type: SenderType::User,
            role: Role::User,
            content: content.into(),
            message_id: None,
            mentions: Vec::new(),
            ext: MessageExt::new(),
            sender_name: None,
            sender_avatar: None,
        }
    }

    pub fn agent(topic_id: impl Into<String>, agent_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            topic_id: topic_id.into(),
            sender_id: agent_id.into(),
            sender_type: SenderType::Agent,
            role: Role::Assistant,
            content: content.into(),
            message_id: None,
            mentions: Vec::new(),
            ext: MessageExt::new(),
            sender_name: None,
            sender_avatar: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_mentions(mut self, mentions: Vec<String>) -> Self {
        self.mentions = mentions;
        self
    }

    pub fn with_ext(mut self, ext: MessageExt) -> Self {
        self.ext = ext;
        self
    }
}

/// Generate a short message id in the `msg_<hex8>` form used on the wire.
pub(crate) fn new_message_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("msg_{}", &hex[..8])
}

/// One roster entry of a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: String,
    pub participant_type: SenderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_config_id: Option<String>,
}

impl Participant {
    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            participant_id: id.into(),
            participant_type: SenderType::Agent,
            name: None,
            avatar: None,
            system_prompt: None,
            llm_config_id: None,
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            participant_id: id.into(),
            participant_type: SenderType::User,
            name: None,
            avatar: None,
            system_prompt: None,
            llm_config_id: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Topic metadata the core reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicRecord {
    pub topic_id: String,
    pub session_type: SessionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub ext: Map<String, Value>,
}

impl TopicRecord {
    pub fn new(topic_id: impl Into<String>, session_type: SessionType) -> Self {
        Self {
            topic_id: topic_id.into(),
            session_type,
            name: None,
            ext: Map::new(),
        }
    }

    /// Pinned SOP skill pack of a group topic, if any.
    pub fn current_sop_skill_pack_id(&self) -> Option<&str> {
        self.ext
            .get("currentSopSkillPackId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Agent configuration row, as loaded on activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_config_id: Option<String>,
    /// Agent ext blob: `mcp_servers` (server dicts), `persona.responseMode`.
    #[serde(default)]
    pub ext: Map<String, Value>,
}

impl AgentProfile {
    pub fn new(agent_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            avatar: None,
            system_prompt: String::new(),
            llm_config_id: None,
            ext: Map::new(),
        }
    }

    pub fn with_llm_config(mut self, config_id: impl Into<String>) -> Self {
        self.llm_config_id = Some(config_id.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// `ext.persona.responseMode`, defaulting to `"normal"`.
    pub fn response_mode(&self) -> &str {
        self.ext
            .get("persona")
            .and_then(|p| p.get("responseMode"))
            .and_then(Value::as_str)
            .unwrap_or("normal")
    }

    /// MCP server definitions from the agent ext.
    pub fn mcp_servers(&self) -> Vec<Value> {
        self.ext
            .get("mcp_servers")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }
}

/// A skill pack assigned to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillPackRecord {
    pub skill_pack_id: String,
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub trigger_keywords: Vec<String>,
    #[serde(default)]
    pub steps: Vec<Value>,
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ext_from(v: Value) -> MessageExt {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn ext_flags_default_false() {
        let ext = MessageExt::new();
        assert!(!ext.auto_trigger());
        assert!(!ext.retry());
        assert!(!ext.chain_append());
    }

    #[test]
    fn ext_flags_read_booleans() {
        let ext = ext_from(json!({ "auto_trigger": true, "retry": true }));
        assert!(ext.auto_trigger() && ext.retry());
    }

    #[test]
    fn ext_mcp_servers_accepts_all_spellings() {
        for key in ["mcp_servers", "selectedMcpServerIds", "selected_mcp_server_ids"] {
            let ext = ext_from(json!({ key: ["srv-1", "srv-2"] }));
            assert_eq!(ext.mcp_servers(), vec!["srv-1", "srv-2"], "key {key}");
        }
    }

    #[test]
    fn ext_mcp_servers_accepts_bare_string() {
        let ext = ext_from(json!({ "mcp_servers": "srv-1" }));
        assert_eq!(ext.mcp_servers(), vec!["srv-1"]);
    }

    #[test]
    fn ext_use_thought_signature_defaults_true() {
        assert!(MessageExt::new().use_thought_signature());
        let off = ext_from(json!({ "imageGen": { "useThoughtSignature": false } }));
        assert!(!off.use_thought_signature());
    }

    #[test]
    fn ext_unknown_keys_round_trip() {
        let ext = ext_from(json!({ "some_future_field": { "a": 1 } }));
        let json = serde_json::to_value(&ext).unwrap();
        assert_eq!(json["some_future_field"]["a"], 1);
    }

    #[test]
    fn ext_chain_fields() {
        let ext = ext_from(json!({ "action_chain_id": "ch-1", "chain_step_index": 2 }));
        assert_eq!(ext.action_chain_id(), Some("ch-1"));
        assert_eq!(ext.chain_step_index(), Some(2));
    }

    #[test]
    fn session_type_unknown_variants_deserialize() {
        let st: SessionType = serde_json::from_str("\"round_table\"").unwrap();
        assert_eq!(st, SessionType::Unknown);
        let st: SessionType = serde_json::from_str("\"topic_general\"").unwrap();
        assert_eq!(st, SessionType::TopicGeneral);
    }

    #[test]
    fn new_message_id_has_wire_shape() {
        let id = new_message_id();
        assert!(id.starts_with("msg_"));
        assert_eq!(id.len(), 12);
    }

    #[test]
    fn profile_response_mode_defaults_normal() {
        let p = AgentProfile::new("a1", "Alice");
        assert_eq!(p.response_mode(), "normal");
        let mut p = p;
        p.ext = json!({ "persona": { "responseMode": "persona" } })
            .as_object()
            .unwrap()
            .clone();
        assert_eq!(p.response_mode(), "persona");
    }

    #[test]
    fn topic_sop_id_empty_string_is_none() {
        let mut t = TopicRecord::new("t1", SessionType::TopicGeneral);
        t.ext.insert("currentSopSkillPackId".into(), json!(""));
        assert!(t.current_sop_skill_pack_id().is_none());
    }
}
