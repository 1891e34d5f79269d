// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-(agent, topic) runtime state: bounded light history, running summary,
//! roster, last-media cache, and processed-message dedup.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;

use parley_model::catalog::{estimate_messages_tokens, model_max_tokens};
use parley_model::{ChatMessage, Role};
use parley_store::{MessageRecord, MessageStore, Participant, SenderType};

/// Keywords that signal the user is referring to earlier visuals, so the
/// cached `last_media` should be re-attached.
const MEDIA_REFERENCE_KEYWORDS: &[&str] = &[
    "上图", "这张图", "那张图", "图里", "图中", "看图",
    "描述一下图", "识别图片", "图片", "photo", "image", "screenshot",
    "根据图片", "根据上面的图", "根据刚才的图", "帮我看下图",
];

const MAX_PROCESSED_IDS: usize = 1000;

/// Light projection of a message: only what prompt assembly needs, never the
/// full ext.  Media stays in the store and is re-fetched by id on demand.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub message_id: Option<String>,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub sender_id: String,
    pub sender_type: SenderType,
    pub has_media: bool,
}

impl HistoryEntry {
    pub fn from_record(record: &MessageRecord) -> Self {
        Self {
            message_id: Some(record.message_id.clone()),
            role: record.role,
            content: record.content.clone(),
            created_at: record.created_at,
            sender_id: record.sender_id.clone(),
            sender_type: record.sender_type,
            has_media: record.ext.media_raw().is_some(),
        }
    }
}

/// A history message prepared for an LLM prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
    pub message_id: Option<String>,
    pub has_media: bool,
}

impl PromptMessage {
    pub fn into_chat_message(self) -> ChatMessage {
        ChatMessage { role: self.role, content: self.content, media: None }
    }
}

#[derive(Default)]
pub struct ActorState {
    pub topic_id: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub summary: Option<String>,
    pub summary_until: Option<String>,
    pub participants: Vec<Participant>,
    /// agent_id → first 80 chars of its system prompt
    pub agent_abilities: HashMap<String, String>,
    /// Most recent media payload seen in any message (raw ext shape).
    pub last_media: Option<Vec<Value>>,
    processed_ids: HashSet<String>,
    processed_order: Vec<String>,
}

impl ActorState {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── History loading ─────────────────────────────────────────────────────

    /// Load up to `limit` messages, oldest-first, walking the store's
    /// `before_id` cursor backwards.  The newest media payload encountered is
    /// cached in `last_media`.
    pub async fn load_history(
        &mut self,
        store: &dyn MessageStore,
        topic_id: &str,
        limit: usize,
    ) -> anyhow::Result<usize> {
        self.topic_id = Some(topic_id.to_string());

        let page_size = limit.min(200).max(1);
        let mut all: Vec<MessageRecord> = Vec::new();
        let mut before_id: Option<String> = None;

        while all.len() < limit {
            let page = store
                .get_messages_paginated(topic_id, page_size, before_id.as_deref())
                .await?;
            if page.messages.is_empty() {
                break;
            }
            before_id = page.messages.first().map(|m| m.message_id.clone());
            let mut merged = page.messages;
            merged.extend(all);
            all = merged;
            if !page.has_more || all.len() >= limit {
                break;
            }
        }

        let start = all.len().saturating_sub(limit);
        self.history.clear();
        self.last_media = None;
        for record in &all[start..] {
            if let Some(media) = record.ext.media_raw() {
                self.last_media = Some(media.clone());
            }
            self.history.push(HistoryEntry::from_record(record));
        }
        Ok(self.history.len())
    }

    /// Append one message in light form, sampling its media.
    pub fn append_record(&mut self, record: &MessageRecord) {
        if let Some(media) = record.ext.media_raw() {
            self.last_media = Some(media.clone());
        }
        self.history.push(HistoryEntry::from_record(record));
    }

    pub fn append_entry(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    // ─── Memory budget ───────────────────────────────────────────────────────

    pub fn estimate_tokens(&self, model: &str) -> usize {
        let _ = model;
        let mut msgs: Vec<ChatMessage> = Vec::with_capacity(self.history.len() + 1);
        if let Some(summary) = &self.summary {
            msgs.push(ChatMessage::system(summary.clone()));
        }
        msgs.extend(
            self.history
                .iter()
                .filter(|m| !m.content.is_empty())
                .map(|m| ChatMessage { role: m.role, content: m.content.clone(), media: None }),
        );
        estimate_messages_tokens(&msgs)
    }

    /// True when the estimated memory exceeds `threshold` of the model's
    /// context window — time to summarise.
    pub fn check_memory_budget(&self, model: &str, threshold: f64) -> bool {
        let max_tokens = model_max_tokens(model);
        self.estimate_tokens(model) as f64 > max_tokens as f64 * threshold
    }

    // ─── Rollback ────────────────────────────────────────────────────────────

    /// Truncate history strictly after `message_id` (the target itself is
    /// kept).  If the summary no longer covers a live message, summary and
    /// cursor are dropped together.
    pub fn clear_after(&mut self, message_id: &str) {
        let Some(idx) = self
            .history
            .iter()
            .position(|m| m.message_id.as_deref() == Some(message_id))
        else {
            return;
        };
        self.history.truncate(idx + 1);
        self.drop_summary_if_stale();
    }

    /// Clear the summary when `summary_until` points at a message no longer
    /// in history.
    pub fn drop_summary_if_stale(&mut self) {
        if let Some(until) = &self.summary_until {
            let live = self
                .history
                .iter()
                .any(|m| m.message_id.as_deref() == Some(until.as_str()));
            if !live {
                self.summary = None;
                self.summary_until = None;
            }
        }
    }

    // ─── Dedup ───────────────────────────────────────────────────────────────

    /// Atomic add-and-test.  Returns true when the id was already seen.  On
    /// overflow the oldest half is evicted, keeping the newest entries.
    pub fn is_processed(&mut self, message_id: &str) -> bool {
        if message_id.is_empty() {
            return false;
        }
        if self.processed_ids.contains(message_id) {
            return true;
        }
        self.processed_ids.insert(message_id.to_string());
        self.processed_order.push(message_id.to_string());
        if self.processed_order.len() > MAX_PROCESSED_IDS {
            let keep = MAX_PROCESSED_IDS / 2;
            let evict = self.processed_order.len() - keep;
            for old in self.processed_order.drain(..evict) {
                self.processed_ids.remove(&old);
            }
        }
        false
    }

    // ─── Prompt assembly ─────────────────────────────────────────────────────

    /// Recent history shaped for an LLM prompt: time-sorted tail, user and
    /// assistant turns only, cleaned and truncated, oldest dropped first when
    /// the total character budget is exceeded.
    pub fn get_recent_history(
        &self,
        max_messages: usize,
        max_total_chars: usize,
        max_per_message_chars: usize,
        include_summary: bool,
    ) -> Vec<PromptMessage> {
        let mut result = Vec::new();

        if include_summary {
            if let Some(summary) = &self.summary {
                result.push(PromptMessage {
                    role: Role::System,
                    content: format!("【对话摘要（自动生成）】\n{}", summary.trim()),
                    message_id: None,
                    has_media: false,
                });
            }
        }

        let mut sorted: Vec<&HistoryEntry> = self.history.iter().collect();
        sorted.sort_by_key(|m| m.created_at);
        let tail_start = sorted.len().saturating_sub(max_messages);

        let mut msgs: Vec<PromptMessage> = Vec::new();
        for m in &sorted[tail_start..] {
            if !matches!(m.role, Role::User | Role::Assistant) {
                continue;
            }
            let content = clean_content(&m.content);
            if content.is_empty() {
                continue;
            }
            let content = truncate_chars(&content, max_per_message_chars);
            msgs.push(PromptMessage {
                role: m.role,
                content,
                message_id: m.message_id.clone(),
                has_media: m.has_media,
            });
        }

        let total: usize = msgs.iter().map(|m| m.content.chars().count()).sum();
        if total > max_total_chars && max_total_chars > 0 {
            let mut trimmed: Vec<PromptMessage> = Vec::new();
            let mut running = 0usize;
            for m in msgs.into_iter().rev() {
                let len = m.content.chars().count();
                if running + len > max_total_chars && !trimmed.is_empty() {
                    continue;
                }
                running += len;
                trimmed.push(m);
            }
            trimmed.reverse();
            msgs = trimmed;
        }

        result.extend(msgs);
        result
    }

    // ─── Participants ────────────────────────────────────────────────────────

    /// Replace the roster and recompute the ability digests used by the
    /// intent classifier.
    pub fn update_participants(&mut self, participants: Vec<Participant>) {
        self.agent_abilities = participants
            .iter()
            .filter(|p| p.participant_type == SenderType::Agent)
            .map(|p| {
                let ability = p
                    .system_prompt
                    .as_deref()
                    .map(|s| truncate_chars(s, 80))
                    .unwrap_or_default();
                (p.participant_id.clone(), ability)
            })
            .collect();
        self.participants = participants;
    }

    // ─── Media ───────────────────────────────────────────────────────────────

    /// True when `text` implicitly references prior visuals.
    pub fn should_attach_last_media(&self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        let t = text.to_lowercase();
        MEDIA_REFERENCE_KEYWORDS.iter().any(|k| t.contains(k))
    }

    pub fn get_last_media(&self) -> Option<&Vec<Value>> {
        self.last_media.as_ref().filter(|m| !m.is_empty())
    }
}

/// Strip tool-grant prefixes and inline base64 image markdown from a history
/// entry before it enters a prompt.
fn clean_content(content: &str) -> String {
    static TOOL_PREFIX: OnceLock<Regex> = OnceLock::new();
    static IMAGE_MARKDOWN: OnceLock<Regex> = OnceLock::new();
    let tool_prefix =
        TOOL_PREFIX.get_or_init(|| Regex::new(r"^\[你已获得工具使用权：[^\]]*\]\s*").unwrap());
    let image_markdown =
        IMAGE_MARKDOWN.get_or_init(|| Regex::new(r"!\[[^\]]*\]\(data:image/[^)]+\)").unwrap());

    let t = content.trim();
    let t = tool_prefix.replace(t, "");
    let t = image_markdown.replace_all(&t, "");
    t.trim().to_string()
}

/// Truncate on a character boundary, appending an ellipsis when cut.
fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parley_store::{MemoryMessageStore, MessageExt, NewMessage};
    use serde_json::json;

    fn entry(id: &str, role: Role, content: &str, at_ms: i64) -> HistoryEntry {
        HistoryEntry {
            message_id: Some(id.to_string()),
            role,
            content: content.to_string(),
            created_at: DateTime::from_timestamp_millis(at_ms).unwrap(),
            sender_id: "u1".into(),
            sender_type: SenderType::User,
            has_media: false,
        }
    }

    // ── Dedup ─────────────────────────────────────────────────────────────────

    #[test]
    fn first_sighting_is_not_processed() {
        let mut st = ActorState::new();
        assert!(!st.is_processed("m1"));
        assert!(st.is_processed("m1"));
    }

    #[test]
    fn empty_id_never_dedups() {
        let mut st = ActorState::new();
        assert!(!st.is_processed(""));
        assert!(!st.is_processed(""));
    }

    #[test]
    fn overflow_keeps_newest_half() {
        let mut st = ActorState::new();
        for i in 0..(MAX_PROCESSED_IDS + 1) {
            st.is_processed(&format!("m{i}"));
        }
        // Newest ids survive, the oldest were evicted.
        assert!(st.is_processed(&format!("m{MAX_PROCESSED_IDS}")));
        assert!(!st.is_processed("m0"));
        assert!(st.processed_order.len() <= MAX_PROCESSED_IDS);
    }

    // ── clear_after / summary coupling ────────────────────────────────────────

    #[test]
    fn clear_after_keeps_target() {
        let mut st = ActorState::new();
        for i in 0..5 {
            st.append_entry(entry(&format!("m{i}"), Role::User, "x", i as i64));
        }
        st.clear_after("m2");
        assert_eq!(st.history.len(), 3);
        assert_eq!(st.history.last().unwrap().message_id.as_deref(), Some("m2"));
    }

    #[test]
    fn clear_after_unknown_id_is_noop() {
        let mut st = ActorState::new();
        st.append_entry(entry("m0", Role::User, "x", 0));
        st.clear_after("nope");
        assert_eq!(st.history.len(), 1);
    }

    #[test]
    fn summary_dropped_when_anchor_rolled_back() {
        let mut st = ActorState::new();
        for i in 0..5 {
            st.append_entry(entry(&format!("m{i}"), Role::User, "x", i as i64));
        }
        st.summary = Some("摘要".into());
        st.summary_until = Some("m4".into());
        st.clear_after("m2");
        assert!(st.summary.is_none());
        assert!(st.summary_until.is_none());
    }

    #[test]
    fn summary_kept_when_anchor_survives() {
        let mut st = ActorState::new();
        for i in 0..5 {
            st.append_entry(entry(&format!("m{i}"), Role::User, "x", i as i64));
        }
        st.summary = Some("摘要".into());
        st.summary_until = Some("m1".into());
        st.clear_after("m2");
        assert!(st.summary.is_some());
    }

    // ── get_recent_history ────────────────────────────────────────────────────

    #[test]
    fn recent_history_filters_non_chat_roles() {
        let mut st = ActorState::new();
        st.append_entry(entry("m0", Role::System, "sys", 0));
        st.append_entry(entry("m1", Role::User, "hi", 1));
        st.append_entry(entry("m2", Role::Tool, "tool out", 2));
        let msgs = st.get_recent_history(10, 1000, 100, false);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "hi");
    }

    #[test]
    fn recent_history_sorted_by_time() {
        let mut st = ActorState::new();
        st.append_entry(entry("m1", Role::User, "later", 100));
        st.append_entry(entry("m0", Role::User, "earlier", 50));
        let msgs = st.get_recent_history(10, 1000, 100, false);
        assert_eq!(msgs[0].content, "earlier");
        assert_eq!(msgs[1].content, "later");
    }

    #[test]
    fn per_message_cap_is_enforced() {
        let mut st = ActorState::new();
        st.append_entry(entry("m0", Role::User, &"甲".repeat(500), 0));
        let msgs = st.get_recent_history(10, 10_000, 100, false);
        assert!(msgs[0].content.chars().count() <= 100);
        assert!(msgs[0].content.ends_with('…'));
    }

    #[test]
    fn total_budget_drops_oldest_first() {
        let mut st = ActorState::new();
        for i in 0..10 {
            st.append_entry(entry(&format!("m{i}"), Role::User, &"a".repeat(50), i as i64));
        }
        let msgs = st.get_recent_history(10, 120, 100, false);
        let total: usize = msgs.iter().map(|m| m.content.chars().count()).sum();
        assert!(total <= 120, "total {total} exceeds budget");
        // The newest message must survive.
        assert_eq!(msgs.last().unwrap().message_id.as_deref(), Some("m9"));
    }

    #[test]
    fn summary_prefix_is_prepended() {
        let mut st = ActorState::new();
        st.summary = Some("用户正在规划行程".into());
        st.append_entry(entry("m0", Role::User, "继续", 0));
        let msgs = st.get_recent_history(10, 1000, 100, true);
        assert_eq!(msgs[0].role, Role::System);
        assert!(msgs[0].content.starts_with("【对话摘要（自动生成）】\n"));
    }

    #[test]
    fn tool_grant_prefix_and_image_markdown_are_stripped() {
        let mut st = ActorState::new();
        st.append_entry(entry(
            "m0",
            Role::User,
            "[你已获得工具使用权：搜索] 查一下 ![img](data:image/png;base64,AAAA) 这个",
            0,
        ));
        let msgs = st.get_recent_history(10, 1000, 100, false);
        assert!(!msgs[0].content.contains("工具使用权"));
        assert!(!msgs[0].content.contains("data:image"));
        assert!(msgs[0].content.contains("查一下"));
    }

    // ── Media reference detection ─────────────────────────────────────────────

    #[test]
    fn media_keywords_trigger_attachment() {
        let st = ActorState::new();
        assert!(st.should_attach_last_media("帮我看看上图"));
        assert!(st.should_attach_last_media("describe this IMAGE"));
        assert!(st.should_attach_last_media("看一下 screenshot"));
        assert!(!st.should_attach_last_media("今天天气如何"));
        assert!(!st.should_attach_last_media(""));
    }

    // ── Participants ──────────────────────────────────────────────────────────

    #[test]
    fn abilities_truncate_system_prompts() {
        let mut st = ActorState::new();
        st.update_participants(vec![
            Participant::agent("a1").with_system_prompt("甲".repeat(200)),
            Participant::user("u1"),
        ]);
        assert_eq!(st.agent_abilities.len(), 1);
        assert!(st.agent_abilities["a1"].chars().count() <= 80);
    }

    // ── load_history ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn load_history_paginates_and_samples_media() {
        let store = MemoryMessageStore::new();
        for i in 0..30 {
            let mut msg = NewMessage::user("t1", "u1", format!("msg {i}"));
            if i == 25 {
                msg = msg.with_ext(MessageExt::new().with(
                    "media",
                    json!([{ "type": "image", "mimeType": "image/png", "data": "AAAA" }]),
                ));
            }
            store.append(msg).await.unwrap();
        }

        let mut st = ActorState::new();
        let loaded = st.load_history(&store, "t1", 20).await.unwrap();
        assert_eq!(loaded, 20);
        assert_eq!(st.history[0].content, "msg 10");
        assert_eq!(st.history[19].content, "msg 29");
        assert!(st.get_last_media().is_some(), "media from msg 25 must be cached");
        assert!(st.history[15].has_media);
    }

    #[tokio::test]
    async fn load_history_with_small_topic() {
        let store = MemoryMessageStore::new();
        for i in 0..3 {
            store.append(NewMessage::user("t1", "u1", format!("m{i}"))).await.unwrap();
        }
        let mut st = ActorState::new();
        assert_eq!(st.load_history(&store, "t1", 100).await.unwrap(), 3);
    }

    // ── Budget ────────────────────────────────────────────────────────────────

    #[test]
    fn budget_trips_above_threshold() {
        let mut st = ActorState::new();
        // gpt-4 window = 8192 tokens; 0.8 → 6553.  Each entry ≈ 254 tokens.
        for i in 0..30 {
            st.append_entry(entry(&format!("m{i}"), Role::User, &"a".repeat(1000), i as i64));
        }
        assert!(st.check_memory_budget("gpt-4", 0.8));
        assert!(!st.check_memory_budget("claude-sonnet-4", 0.8));
    }
}
