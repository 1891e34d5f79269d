use serde_json::{Map, Value};

/// The closed set of event types the core publishes and consumes.
///
/// Unknown types on the wire are dropped at parse time; new fields inside
/// known events are forward-compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    NewMessage,
    TopicUpdated,
    TopicParticipantsUpdated,
    AgentJoined,
    ParticipantLeft,
    MessagesRolledBack,
    AgentThinking,
    AgentStreamChunk,
    AgentStreamDone,
    AgentSilent,
    ExecutionLog,
    Reaction,
    TopicProcessEvent,
    ActionChainProgress,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::NewMessage => "new_message",
            EventType::TopicUpdated => "topic_updated",
            EventType::TopicParticipantsUpdated => "topic_participants_updated",
            EventType::AgentJoined => "agent_joined",
            EventType::ParticipantLeft => "participant_left",
            EventType::MessagesRolledBack => "messages_rolled_back",
            EventType::AgentThinking => "agent_thinking",
            EventType::AgentStreamChunk => "agent_stream_chunk",
            EventType::AgentStreamDone => "agent_stream_done",
            EventType::AgentSilent => "agent_silent",
            EventType::ExecutionLog => "execution_log",
            EventType::Reaction => "reaction",
            EventType::TopicProcessEvent => "topic_process_event",
            EventType::ActionChainProgress => "action_chain_progress",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "new_message" => EventType::NewMessage,
            "topic_updated" => EventType::TopicUpdated,
            "topic_participants_updated" => EventType::TopicParticipantsUpdated,
            "agent_joined" => EventType::AgentJoined,
            "participant_left" => EventType::ParticipantLeft,
            "messages_rolled_back" => EventType::MessagesRolledBack,
            "agent_thinking" => EventType::AgentThinking,
            "agent_stream_chunk" => EventType::AgentStreamChunk,
            "agent_stream_done" => EventType::AgentStreamDone,
            "agent_silent" => EventType::AgentSilent,
            "execution_log" => EventType::ExecutionLog,
            "reaction" => EventType::Reaction,
            "topic_process_event" => EventType::TopicProcessEvent,
            "action_chain_progress" => EventType::ActionChainProgress,
            _ => return None,
        })
    }
}

/// Event types the actor manager dispatches into actor mailboxes.  The rest
/// are UI-facing and only travel outwards.
pub const MANAGER_EVENTS: &[EventType] = &[
    EventType::NewMessage,
    EventType::TopicUpdated,
    EventType::TopicParticipantsUpdated,
    EventType::AgentJoined,
    EventType::ParticipantLeft,
    EventType::MessagesRolledBack,
];

/// Pub/sub channel for a topic.
pub fn topic_channel(topic_id: &str) -> String {
    format!("topic:{topic_id}")
}

/// Inverse of [`topic_channel`] — the id is everything after the last colon.
pub fn topic_id_from_channel(channel: &str) -> &str {
    channel.rsplit(':').next().unwrap_or(channel)
}

/// Short-lived interrupt flag key for `(topic, agent)`.
pub fn interrupt_key(topic_id: &str, agent_id: &str) -> String {
    format!("topic_interrupt:{topic_id}:{agent_id}")
}

/// Build the wire envelope: `{type, timestamp, ...fields}`.
///
/// `fields` are merged at the top level; event-specific `data` objects are
/// just another field.  `type` and `timestamp` always win.
pub fn make_envelope(event_type: EventType, fields: Map<String, Value>) -> Value {
    let mut obj = fields;
    obj.insert("type".into(), Value::String(event_type.as_str().into()));
    obj.insert("timestamp".into(), Value::from(now_epoch_seconds()));
    Value::Object(obj)
}

fn now_epoch_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// A whitelisted event parsed off the wire.
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub event_type: EventType,
    pub raw: Value,
}

impl ParsedEvent {
    /// The event's `data` object, when present.
    pub fn data(&self) -> Value {
        self.raw.get("data").cloned().unwrap_or(Value::Null)
    }
}

/// Parse a raw pub/sub payload.  Returns `None` for non-JSON payloads and for
/// event types outside the whitelist — both are silently ignored upstream.
pub fn parse_event(payload: &str) -> Option<ParsedEvent> {
    let raw: Value = serde_json::from_str(payload).ok()?;
    let event_type = EventType::parse(raw.get("type")?.as_str()?)?;
    Some(ParsedEvent { event_type, raw })
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
