// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-memory store implementations for tests and the dev server.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use parley_model::LlmConfig;

use crate::traits::{AgentDirectory, LlmConfigRepository, MessagePage, MessageStore, TopicStore};
use crate::types::{
    new_message_id, AgentProfile, MessageRecord, NewMessage, SkillPackRecord, TopicRecord,
};

/// Message store backed by a per-topic `Vec`, append-ordered.
#[derive(Default)]
pub struct MemoryMessageStore {
    topics: Mutex<HashMap<String, Vec<MessageRecord>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message count for a topic (test helper).
    pub fn len(&self, topic_id: &str) -> usize {
        self.topics
            .lock()
            .unwrap()
            .get(topic_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, topic_id: &str) -> bool {
        self.len(topic_id) == 0
    }

    /// Snapshot of a topic's messages (test helper).
    pub fn snapshot(&self, topic_id: &str) -> Vec<MessageRecord> {
        self.topics
            .lock()
            .unwrap()
            .get(topic_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, msg: NewMessage) -> anyhow::Result<MessageRecord> {
        let record = MessageRecord {
            message_id: msg.message_id.unwrap_or_else(new_message_id),
            topic_id: msg.topic_id.clone(),
            sender_id: msg.sender_id,
            sender_type: msg.sender_type,
            sender_name: msg.sender_name,
            sender_avatar: msg.sender_avatar,
            role: msg.role,
            content: msg.content,
            created_at: Utc::now(),
            mentions: msg.mentions,
            ext: msg.ext,
        };
        self.topics
            .lock()
            .unwrap()
            .entry(msg.topic_id)
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn get_messages_paginated(
        &self,
        topic_id: &str,
        limit: usize,
        before_id: Option<&str>,
    ) -> anyhow::Result<MessagePage> {
        let topics = self.topics.lock().unwrap();
        let all = topics.get(topic_id).map(Vec::as_slice).unwrap_or(&[]);
        let end = match before_id {
            Some(id) => all
                .iter()
                .position(|m| m.message_id == id)
                .unwrap_or(all.len()),
            None => all.len(),
        };
        let start = end.saturating_sub(limit);
        Ok(MessagePage {
            messages: all[start..end].to_vec(),
            has_more: start > 0,
            latest_id: all.last().map(|m| m.message_id.clone()),
        })
    }

    async fn delete_after(&self, topic_id: &str, target_id: &str) -> anyhow::Result<usize> {
        let mut topics = self.topics.lock().unwrap();
        let Some(msgs) = topics.get_mut(topic_id) else { return Ok(0) };
        let Some(idx) = msgs.iter().position(|m| m.message_id == target_id) else {
            return Ok(0);
        };
        let removed = msgs.len() - (idx + 1);
        msgs.truncate(idx + 1);
        Ok(removed)
    }

    async fn get_message(
        &self,
        topic_id: &str,
        message_id: &str,
    ) -> anyhow::Result<Option<MessageRecord>> {
        let topics = self.topics.lock().unwrap();
        Ok(topics
            .get(topic_id)
            .and_then(|msgs| msgs.iter().find(|m| m.message_id == message_id))
            .cloned())
    }
}

/// Topic metadata held in a map; tests insert fixtures directly.
#[derive(Default)]
pub struct MemoryTopicStore {
    topics: Mutex<HashMap<String, TopicRecord>>,
}

impl MemoryTopicStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, topic: TopicRecord) {
        self.topics
            .lock()
            .unwrap()
            .insert(topic.topic_id.clone(), topic);
    }
}

#[async_trait]
impl TopicStore for MemoryTopicStore {
    async fn get_topic(&self, topic_id: &str) -> anyhow::Result<Option<TopicRecord>> {
        Ok(self.topics.lock().unwrap().get(topic_id).cloned())
    }
}

/// LLM config rows held in a map.
#[derive(Default)]
pub struct MemoryLlmConfigs {
    configs: Mutex<HashMap<String, LlmConfig>>,
}

impl MemoryLlmConfigs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, config: LlmConfig) {
        self.configs
            .lock()
            .unwrap()
            .insert(config.config_id.clone(), config);
    }
}

#[async_trait]
impl LlmConfigRepository for MemoryLlmConfigs {
    async fn find_by_id(&self, config_id: &str) -> anyhow::Result<Option<LlmConfig>> {
        Ok(self.configs.lock().unwrap().get(config_id).cloned())
    }

    async fn find_by_model(&self, model: &str) -> anyhow::Result<Option<LlmConfig>> {
        Ok(self
            .configs
            .lock()
            .unwrap()
            .values()
            .find(|c| c.model == model && c.enabled)
            .cloned())
    }
}

/// Agent profiles and skill-pack assignments held in maps.
#[derive(Default)]
pub struct MemoryAgentDirectory {
    agents: Mutex<HashMap<String, AgentProfile>>,
    skill_packs: Mutex<HashMap<String, SkillPackRecord>>,
    assignments: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_agent(&self, profile: AgentProfile) {
        self.agents
            .lock()
            .unwrap()
            .insert(profile.agent_id.clone(), profile);
    }

    pub fn insert_skill_pack(&self, pack: SkillPackRecord) {
        self.skill_packs
            .lock()
            .unwrap()
            .insert(pack.skill_pack_id.clone(), pack);
    }

    pub fn assign_skill_pack(&self, agent_id: &str, skill_pack_id: &str) {
        self.assignments
            .lock()
            .unwrap()
            .entry(agent_id.to_string())
            .or_default()
            .push(skill_pack_id.to_string());
    }
}

#[async_trait]
impl AgentDirectory for MemoryAgentDirectory {
    async fn find_agent(&self, agent_id: &str) -> anyhow::Result<Option<AgentProfile>> {
        Ok(self.agents.lock().unwrap().get(agent_id).cloned())
    }

    async fn assigned_skill_packs(&self, agent_id: &str) -> anyhow::Result<Vec<SkillPackRecord>> {
        let assignments = self.assignments.lock().unwrap();
        let packs = self.skill_packs.lock().unwrap();
        Ok(assignments
            .get(agent_id)
            .into_iter()
            .flatten()
            .filter_map(|id| packs.get(id).cloned())
            .collect())
    }

    async fn find_skill_pack(
        &self,
        skill_pack_id: &str,
    ) -> anyhow::Result<Option<SkillPackRecord>> {
        Ok(self.skill_packs.lock().unwrap().get(skill_pack_id).cloned())
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(store: &MemoryMessageStore, n: usize) -> Vec<String> {
        let mut ids = Vec::new();
        for i in 0..n {
            let rec = store
                .append(NewMessage::user("t1", "u1", format!("msg {i}")))
                .await
                .unwrap();
            ids.push(rec.message_id);
        }
        ids
    }

    #[tokio::test]
    async fn append_assigns_id_when_missing() {
        let store = MemoryMessageStore::new();
        let rec = store
            .append(NewMessage::user("t1", "u1", "hello"))
            .await
            .unwrap();
        assert!(rec.message_id.starts_with("msg_"));
    }

    #[tokio::test]
    async fn append_keeps_preassigned_id() {
        let store = MemoryMessageStore::new();
        let rec = store
            .append(NewMessage::user("t1", "u1", "hello").with_id("msg_fixed01"))
            .await
            .unwrap();
        assert_eq!(rec.message_id, "msg_fixed01");
    }

    #[tokio::test]
    async fn pagination_returns_tail_first() {
        let store = MemoryMessageStore::new();
        seed(&store, 10).await;
        let page = store.get_messages_paginated("t1", 3, None).await.unwrap();
        assert_eq!(page.messages.len(), 3);
        assert_eq!(page.messages[0].content, "msg 7");
        assert_eq!(page.messages[2].content, "msg 9");
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn pagination_cursor_walks_backwards() {
        let store = MemoryMessageStore::new();
        let ids = seed(&store, 6).await;
        let page = store
            .get_messages_paginated("t1", 3, Some(&ids[3]))
            .await
            .unwrap();
        let contents: Vec<_> = page.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg 0", "msg 1", "msg 2"]);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn pagination_empty_topic() {
        let store = MemoryMessageStore::new();
        let page = store.get_messages_paginated("t9", 5, None).await.unwrap();
        assert!(page.messages.is_empty());
        assert!(!page.has_more);
        assert!(page.latest_id.is_none());
    }

    #[tokio::test]
    async fn delete_after_keeps_target_inclusive() {
        let store = MemoryMessageStore::new();
        let ids = seed(&store, 5).await;
        let removed = store.delete_after("t1", &ids[2]).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.len("t1"), 3);
        let snapshot = store.snapshot("t1");
        assert_eq!(snapshot.last().unwrap().message_id, ids[2]);
    }

    #[tokio::test]
    async fn delete_after_unknown_target_is_noop() {
        let store = MemoryMessageStore::new();
        seed(&store, 3).await;
        assert_eq!(store.delete_after("t1", "msg_nope").await.unwrap(), 0);
        assert_eq!(store.len("t1"), 3);
    }

    #[tokio::test]
    async fn llm_config_find_by_model_skips_disabled() {
        let repo = MemoryLlmConfigs::new();
        repo.insert(LlmConfig {
            config_id: "c1".into(),
            provider: "openai".into(),
            api_url: None,
            api_key: String::new(),
            model: "gpt-4".into(),
            enabled: false,
        });
        assert!(repo.find_by_model("gpt-4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn skill_pack_assignment_resolves() {
        let dir = MemoryAgentDirectory::new();
        dir.insert_skill_pack(SkillPackRecord {
            skill_pack_id: "sp1".into(),
            name: "发帖".into(),
            summary: "发一篇帖子".into(),
            trigger_keywords: vec!["发帖".into()],
            steps: vec![],
        });
        dir.assign_skill_pack("a1", "sp1");
        let packs = dir.assigned_skill_packs("a1").await.unwrap();
        assert_eq!(packs.len(), 1);
        assert_eq!(packs[0].name, "发帖");
    }
}
