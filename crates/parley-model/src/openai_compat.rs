// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible `/chat/completions` provider.
//!
//! Hosted gateways and local servers overwhelmingly speak this wire format,
//! so a single driver configured with the endpoint URL covers all of them.
//! Streaming uses SSE; events may be split across TCP packets, so a line
//! buffer is maintained and only complete `data:` lines are parsed.
//!
//! Thinking deltas arrive under two field names in the wild:
//! `reasoning_content` (DeepSeek-R1, Qwen3, llama.cpp) and `reasoning`
//! (OpenRouter-style aggregators).  Both map to [`StreamEvent::Thinking`].

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::media::normalize_media;
use crate::provider::ChatStream;
use crate::types::{
    ChatMessage, ChatRequest, ChatResponse, LlmConfig, StreamEnd, StreamEvent, ToolCallRequest,
    Usage,
};

pub struct OpenAiCompatProvider {
    provider_type: String,
    model: String,
    api_key: String,
    chat_url: String,
    client: reqwest::Client,
    /// Forwarded to providers that honour it (Gemini-class image models);
    /// ignored by everyone else.
    use_thought_signature: bool,
}

impl OpenAiCompatProvider {
    pub fn new(
        provider_type: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        base_url: &str,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        let chat_url = if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{base}/chat/completions")
        };
        Self {
            provider_type: provider_type.into(),
            model: model.into(),
            api_key: api_key.into(),
            chat_url,
            client: reqwest::Client::new(),
            use_thought_signature: true,
        }
    }

    pub fn from_config(config: &LlmConfig, use_thought_signature: bool) -> Self {
        let base = config.api_url.as_deref().unwrap_or("https://api.openai.com/v1");
        let mut p = Self::new(&config.provider, &config.model, &config.api_key, base);
        p.use_thought_signature = use_thought_signature;
        p
    }

    fn request_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": build_wire_messages(&req.messages),
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(mt) = req.max_tokens {
            body["max_tokens"] = json!(mt);
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            body["tool_choice"] = json!(req.tool_choice.as_deref().unwrap_or("auto"));
        }
        if !self.use_thought_signature {
            // Opt out of signature round-tripping for fresh image generation.
            body["thought_signature"] = json!(false);
        }
        body
    }

    async fn send(&self, body: &Value) -> anyhow::Result<reqwest::Response> {
        debug!(
            provider = %self.provider_type,
            model = %self.model,
            "sending completion request"
        );
        let mut http_req = self.client.post(&self.chat_url).json(body);
        if !self.api_key.is_empty() {
            http_req = http_req.bearer_auth(&self.api_key);
        }
        let resp = http_req
            .send()
            .await
            .with_context(|| format!("{} request failed", self.provider_type))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.provider_type);
        }
        Ok(resp)
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.provider_type
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        let body = self.request_body(&req, false);
        let resp = self.send(&body).await?;
        let v: Value = resp.json().await.context("invalid completion response")?;

        let message = &v["choices"][0]["message"];
        let content = message["content"].as_str().unwrap_or("").to_string();
        let thinking = message
            .get("reasoning_content")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let tool_calls = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|tc| {
                        Some(ToolCallRequest {
                            id: tc["id"].as_str()?.to_string(),
                            name: tc["function"]["name"].as_str()?.to_string(),
                            arguments: tc["function"]["arguments"]
                                .as_str()
                                .unwrap_or("{}")
                                .to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let media = message
            .get("media")
            .and_then(Value::as_array)
            .map(|arr| normalize_media(arr))
            .unwrap_or_default();

        Ok(ChatResponse {
            content,
            tool_calls,
            finish_reason: v["choices"][0]["finish_reason"].as_str().map(str::to_string),
            usage: parse_usage(v.get("usage")),
            media,
            thinking,
            raw: Some(v),
        })
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<ChatStream> {
        let body = self.request_body(&req, true);
        let resp = self.send(&body).await?;

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across TCP packets: keep a line buffer and
        // the terminal-state accumulator across chunks.
        let event_stream = byte_stream
            .scan(SseState::default(), |state, chunk| {
                let events: Vec<anyhow::Result<StreamEvent>> = match chunk {
                    Ok(b) => {
                        state.buffer.push_str(&String::from_utf8_lossy(&b));
                        state.drain_lines()
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

// ─── SSE parsing ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct SseState {
    buffer: String,
    thinking: String,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    done_sent: bool,
}

impl SseState {
    /// Drain all complete `\n`-terminated lines from the buffer, leaving any
    /// trailing partial line in place for the next TCP chunk.
    fn drain_lines(&mut self) -> Vec<anyhow::Result<StreamEvent>> {
        let mut events = Vec::new();
        while let Some(nl) = self.buffer.find('\n') {
            let line = self.buffer[..nl].trim_end_matches('\r').to_string();
            self.buffer = self.buffer[nl + 1..].to_string();
            self.consume_line(&line, &mut events);
        }
        events
    }

    fn consume_line(&mut self, line: &str, events: &mut Vec<anyhow::Result<StreamEvent>>) {
        let Some(data) = line.strip_prefix("data: ") else { return };
        let data = data.trim();
        if data.is_empty() {
            return;
        }
        if data == "[DONE]" {
            if !self.done_sent {
                self.done_sent = true;
                events.push(Ok(StreamEvent::Done(StreamEnd {
                    media: Vec::new(),
                    thinking: if self.thinking.is_empty() {
                        None
                    } else {
                        Some(std::mem::take(&mut self.thinking))
                    },
                    usage: self.usage.take(),
                    finish_reason: self.finish_reason.take(),
                })));
            }
            return;
        }
        let Ok(v) = serde_json::from_str::<Value>(data) else { return };

        if let Some(usage) = parse_usage(v.get("usage").filter(|u| !u.is_null())) {
            self.usage = Some(usage);
            return;
        }

        let choice = &v["choices"][0];
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_string());
        }

        let delta = &choice["delta"];
        let thinking_text = delta
            .get("reasoning_content")
            .and_then(Value::as_str)
            .or_else(|| delta.get("reasoning").and_then(Value::as_str));
        if let Some(t) = thinking_text {
            if !t.is_empty() {
                self.thinking.push_str(t);
                events.push(Ok(StreamEvent::Thinking(t.to_string())));
            }
            return;
        }

        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::TextDelta(text.to_string())));
            }
        }
    }
}

fn parse_usage(usage: Option<&Value>) -> Option<Usage> {
    let u = usage?;
    let input = u.get("prompt_tokens").and_then(Value::as_u64)?;
    let output = u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0);
    Some(Usage {
        input_tokens: input as u32,
        output_tokens: output as u32,
    })
}

/// Convert messages into the OpenAI wire-format array.  Media attachments
/// become `image_url` content parts with data URLs.
fn build_wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let media_urls: Vec<String> = m
                .media
                .iter()
                .flatten()
                .filter_map(|item| item.as_data_url().or_else(|| item.url.clone()))
                .collect();
            if media_urls.is_empty() {
                json!({ "role": m.role.as_str(), "content": m.content })
            } else {
                let mut parts = vec![json!({ "type": "text", "text": m.content })];
                for url in media_urls {
                    parts.push(json!({ "type": "image_url", "image_url": { "url": url } }));
                }
                json!({ "role": m.role.as_str(), "content": parts })
            }
        })
        .collect()
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaItem;

    fn drain(state: &mut SseState, input: &str) -> Vec<StreamEvent> {
        state.buffer.push_str(input);
        state
            .drain_lines()
            .into_iter()
            .map(|e| e.unwrap())
            .collect()
    }

    #[test]
    fn chat_url_appends_path() {
        let p = OpenAiCompatProvider::new("openai", "gpt-4", "k", "http://localhost:9999/v1");
        assert_eq!(p.chat_url, "http://localhost:9999/v1/chat/completions");
    }

    #[test]
    fn chat_url_not_doubled_when_full() {
        let p = OpenAiCompatProvider::new(
            "openai",
            "gpt-4",
            "k",
            "http://localhost:9999/v1/chat/completions",
        );
        assert_eq!(p.chat_url, "http://localhost:9999/v1/chat/completions");
    }

    #[test]
    fn text_delta_parsed_from_sse_line() {
        let mut st = SseState::default();
        let evs = drain(
            &mut st,
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n",
        );
        assert!(matches!(&evs[0], StreamEvent::TextDelta(t) if t == "hi"));
    }

    #[test]
    fn reasoning_content_maps_to_thinking() {
        let mut st = SseState::default();
        let evs = drain(
            &mut st,
            "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"hmm\"}}]}\n",
        );
        assert!(matches!(&evs[0], StreamEvent::Thinking(t) if t == "hmm"));
    }

    #[test]
    fn openrouter_reasoning_field_also_maps_to_thinking() {
        let mut st = SseState::default();
        let evs = drain(
            &mut st,
            "data: {\"choices\":[{\"delta\":{\"reasoning\":\"hmm\"}}]}\n",
        );
        assert!(matches!(&evs[0], StreamEvent::Thinking(t) if t == "hmm"));
    }

    #[test]
    fn done_sentinel_carries_accumulated_thinking_and_usage() {
        let mut st = SseState::default();
        drain(
            &mut st,
            "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"a\"}}]}\n",
        );
        drain(
            &mut st,
            "data: {\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":5}}\n",
        );
        let evs = drain(&mut st, "data: [DONE]\n");
        match &evs[0] {
            StreamEvent::Done(end) => {
                assert_eq!(end.thinking.as_deref(), Some("a"));
                assert_eq!(end.usage.unwrap().input_tokens, 10);
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn partial_line_is_buffered_until_newline() {
        let mut st = SseState::default();
        let evs = drain(&mut st, "data: {\"choices\":[{\"delta\":{\"con");
        assert!(evs.is_empty(), "incomplete line must not be parsed");
        let evs = drain(&mut st, "tent\":\"x\"}}]}\n");
        assert!(matches!(&evs[0], StreamEvent::TextDelta(t) if t == "x"));
    }

    #[test]
    fn garbage_lines_are_ignored() {
        let mut st = SseState::default();
        assert!(drain(&mut st, ": keepalive\n\ndata: not-json\n").is_empty());
    }

    #[test]
    fn wire_messages_attach_media_as_image_parts() {
        let msg = ChatMessage::user("look")
            .with_media(vec![MediaItem::image_base64("image/png", "AAAA")]);
        let wire = build_wire_messages(&[msg]);
        let parts = wire[0]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(
            parts[1]["image_url"]["url"].as_str().unwrap(),
            "data:image/png;base64,AAAA"
        );
    }

    #[test]
    fn wire_messages_plain_text_stays_string() {
        let wire = build_wire_messages(&[ChatMessage::user("hi")]);
        assert_eq!(wire[0]["content"].as_str(), Some("hi"));
    }
}
