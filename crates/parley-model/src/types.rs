use serde::{Deserialize, Serialize};

use crate::media::MediaItem;

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A single message sent to a provider.
///
/// `media` carries attachments for multimodal turns.  Each [`MediaItem`]
/// may include a `thoughtSignature` that MUST be forwarded verbatim — some
/// reasoning-model providers reject follow-up turns referencing a prior
/// generated image without it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Vec<MediaItem>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into(), media: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), media: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), media: None }
    }

    pub fn with_media(mut self, media: Vec<MediaItem>) -> Self {
        if !media.is_empty() {
            self.media = Some(media);
        }
        self
    }
}

/// A tool schema handed to the model (OpenAI function-calling shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// JSON-encoded argument object
    pub arguments: String,
}

// ─── Request / response ───────────────────────────────────────────────────────

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    pub tool_choice: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self { messages, ..Default::default() }
    }
}

/// Token usage from one completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A complete (non-streamed) provider response.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    /// Media returned by the model (image-generation models).  Items keep
    /// their `thoughtSignature` untouched.
    pub media: Vec<MediaItem>,
    /// Final aggregated reasoning trace, when the model exposes one.
    pub thinking: Option<String>,
    /// Provider-specific raw payload for diagnostics.
    pub raw: Option<serde_json::Value>,
}

// ─── Streaming ────────────────────────────────────────────────────────────────

/// Terminal state of a [`StreamEvent::Done`] — everything the provider only
/// knows once the stream has finished.
#[derive(Debug, Clone, Default)]
pub struct StreamEnd {
    pub media: Vec<MediaItem>,
    pub thinking: Option<String>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

/// A single streamed event from the model.
///
/// `Thinking` deltas are the reasoning trace of thinking-class models; the
/// actor surfaces them as `execution_log` entries and never mixes them into
/// the user-visible content.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    Thinking(String),
    Done(StreamEnd),
}

// ─── LLM configuration ────────────────────────────────────────────────────────

/// One row of the LLM configuration catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub config_id: String,
    pub provider: String,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors_set_roles() {
        assert_eq!(ChatMessage::system("s").role, Role::System);
        assert_eq!(ChatMessage::user("u").role, Role::User);
        assert_eq!(ChatMessage::assistant("a").role, Role::Assistant);
    }

    #[test]
    fn with_media_ignores_empty_list() {
        let m = ChatMessage::user("hi").with_media(vec![]);
        assert!(m.media.is_none());
    }

    #[test]
    fn message_serialises_without_media_field() {
        let json = serde_json::to_string(&ChatMessage::user("hi")).unwrap();
        assert!(!json.contains("media"), "media must be omitted when None: {json}");
    }

    #[test]
    fn llm_config_defaults_enabled_true() {
        let cfg: LlmConfig = serde_json::from_str(
            r#"{"config_id":"c1","provider":"openai","model":"gpt-4"}"#,
        )
        .unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.api_key, "");
    }

    #[test]
    fn role_round_trips_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
        let back: Role = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Role::Assistant);
    }
}
