// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use parley_model::LlmConfig;

use crate::types::{AgentProfile, MessageRecord, NewMessage, SkillPackRecord, TopicRecord};

/// One page of a paginated history read, oldest-first within the page.
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub messages: Vec<MessageRecord>,
    /// True when older messages exist before this page.
    pub has_more: bool,
    /// Newest message id in the topic at read time.
    pub latest_id: Option<String>,
}

/// Append-only message persistence.  Writes are ordered per topic by the
/// Topic Service; implementations must tolerate concurrent appends from
/// different topics.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message and return the stored record (with its assigned id).
    async fn append(&self, msg: NewMessage) -> anyhow::Result<MessageRecord>;

    /// Read up to `limit` messages strictly before `before_id` (or the tail
    /// of the topic when `None`), oldest-first within the page.
    async fn get_messages_paginated(
        &self,
        topic_id: &str,
        limit: usize,
        before_id: Option<&str>,
    ) -> anyhow::Result<MessagePage>;

    /// Rollback support: delete every message created after `target_id`.
    /// Returns the number of deleted messages.
    async fn delete_after(&self, topic_id: &str, target_id: &str) -> anyhow::Result<usize>;

    /// Fetch one message by id (lazy media re-attachment).
    async fn get_message(
        &self,
        topic_id: &str,
        message_id: &str,
    ) -> anyhow::Result<Option<MessageRecord>>;
}

/// Topic metadata lookup.
#[async_trait]
pub trait TopicStore: Send + Sync {
    async fn get_topic(&self, topic_id: &str) -> anyhow::Result<Option<TopicRecord>>;
}

/// LLM configuration rows.  Read-only within a message-processing pass.
#[async_trait]
pub trait LlmConfigRepository: Send + Sync {
    async fn find_by_id(&self, config_id: &str) -> anyhow::Result<Option<LlmConfig>>;

    /// Lookup by model name; only enabled configs match.
    async fn find_by_model(&self, model: &str) -> anyhow::Result<Option<LlmConfig>>;
}

/// Agent configuration: profile plus assigned skill packs.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn find_agent(&self, agent_id: &str) -> anyhow::Result<Option<AgentProfile>>;

    async fn assigned_skill_packs(&self, agent_id: &str) -> anyhow::Result<Vec<SkillPackRecord>>;

    /// Skill pack by id (topic SOP injection).
    async fn find_skill_pack(&self, skill_pack_id: &str)
        -> anyhow::Result<Option<SkillPackRecord>>;
}
