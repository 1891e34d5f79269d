// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::media::MediaItem;
use crate::provider::ChatStream;
use crate::types::{ChatRequest, ChatResponse, StreamEnd, StreamEvent, Usage};

/// Deterministic mock provider for tests.  Echoes the last user message back
/// as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        let reply = last_user_text(&req);
        Ok(ChatResponse {
            content: format!("MOCK: {reply}"),
            usage: Some(Usage { input_tokens: 10, output_tokens: 10 }),
            ..Default::default()
        })
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<ChatStream> {
        let reply = last_user_text(&req);
        let events: Vec<anyhow::Result<StreamEvent>> = vec![
            Ok(StreamEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(StreamEvent::Done(StreamEnd::default())),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

fn last_user_text(req: &ChatRequest) -> String {
    req.messages
        .iter()
        .rev()
        .find(|m| m.role == crate::Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_else(|| "[no input]".to_string())
}

/// A pre-scripted mock provider.  Each call to `chat` / `chat_stream` pops the
/// next script from the front of the queue, so tests can specify exact event
/// sequences — including thinking deltas and generated media — without
/// network access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<Vec<StreamEvent>>>>,
    name: String,
    /// Every `ChatRequest` seen by this provider, in call order.  Tests use
    /// this to assert on call counts and on exactly what was sent.
    pub requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl ScriptedMockProvider {
    /// Build a provider from a list of response scripts.  The outer `Vec` is
    /// the ordered list of calls; the inner `Vec` is the event sequence for
    /// that call.  A script without a terminal `Done` gets one appended.
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            name: "scripted-mock".into(),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![StreamEvent::TextDelta(reply.into())]])
    }

    /// Convenience: a thinking trace followed by the visible reply.
    pub fn thinking_then_text(thinking: impl Into<String>, reply: impl Into<String>) -> Self {
        Self::new(vec![vec![
            StreamEvent::Thinking(thinking.into()),
            StreamEvent::TextDelta(reply.into()),
        ]])
    }

    /// Convenience: a text reply that also produced media.
    pub fn text_with_media(reply: impl Into<String>, media: Vec<MediaItem>) -> Self {
        Self::new(vec![vec![
            StreamEvent::TextDelta(reply.into()),
            StreamEvent::Done(StreamEnd { media, ..Default::default() }),
        ]])
    }

    /// Number of calls served so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next_script(&self) -> Vec<StreamEvent> {
        let mut scripts = self.scripts.lock().unwrap();
        let mut events = if scripts.is_empty() {
            vec![StreamEvent::TextDelta("[no more scripts]".into())]
        } else {
            scripts.remove(0)
        };
        if !matches!(events.last(), Some(StreamEvent::Done(_))) {
            events.push(StreamEvent::Done(StreamEnd::default()));
        }
        events
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        &self.name
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        self.requests.lock().unwrap().push(req);
        let mut resp = ChatResponse::default();
        let mut thinking = String::new();
        for ev in self.next_script() {
            match ev {
                StreamEvent::TextDelta(t) => resp.content.push_str(&t),
                StreamEvent::Thinking(t) => thinking.push_str(&t),
                StreamEvent::Done(end) => {
                    resp.media = end.media;
                    resp.usage = end.usage;
                    resp.finish_reason = end.finish_reason;
                }
            }
        }
        if !thinking.is_empty() {
            resp.thinking = Some(thinking);
        }
        Ok(resp)
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<ChatStream> {
        self.requests.lock().unwrap().push(req);
        let events: Vec<anyhow::Result<StreamEvent>> =
            self.next_script().into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(events)))
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::{ChatMessage, ModelProvider};

    fn req() -> ChatRequest {
        ChatRequest::from_messages(vec![ChatMessage::user("hi")])
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let resp = MockProvider.chat(req()).await.unwrap();
        assert!(resp.content.contains("MOCK: hi"));
    }

    #[tokio::test]
    async fn scripted_stream_ends_with_done() {
        let p = ScriptedMockProvider::always_text("hello");
        let mut s = p.chat_stream(req()).await.unwrap();
        let mut events = Vec::new();
        while let Some(ev) = s.next().await {
            events.push(ev.unwrap());
        }
        assert!(matches!(events.first(), Some(StreamEvent::TextDelta(t)) if t == "hello"));
        assert!(matches!(events.last(), Some(StreamEvent::Done(_))));
    }

    #[tokio::test]
    async fn scripted_chat_folds_text_and_thinking() {
        let p = ScriptedMockProvider::thinking_then_text("pondering", "answer");
        let resp = p.chat(req()).await.unwrap();
        assert_eq!(resp.content, "answer");
        assert_eq!(resp.thinking.as_deref(), Some("pondering"));
    }

    #[tokio::test]
    async fn scripted_media_survives_with_signature() {
        let media =
            vec![MediaItem::image_base64("image/png", "AAAA").with_thought_signature("sig-1")];
        let p = ScriptedMockProvider::text_with_media("here", media);
        let resp = p.chat(req()).await.unwrap();
        assert_eq!(resp.media[0].thought_signature.as_deref(), Some("sig-1"));
    }

    #[tokio::test]
    async fn request_log_counts_calls() {
        let p = ScriptedMockProvider::new(vec![
            vec![StreamEvent::TextDelta("a".into())],
            vec![StreamEvent::TextDelta("b".into())],
        ]);
        let _ = p.chat(req()).await.unwrap();
        let _ = p.chat(req()).await.unwrap();
        assert_eq!(p.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_scripts_fall_back() {
        let p = ScriptedMockProvider::new(vec![]);
        let resp = p.chat(req()).await.unwrap();
        assert!(resp.content.contains("no more scripts"));
    }
}
