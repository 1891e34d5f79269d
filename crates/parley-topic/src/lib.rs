// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Topic Service: the single outbound surface for messages and events.
//!
//! `send_message` persists first, then publishes `new_message` on the topic
//! channel.  Every other event type publishes without persisting.  Publishing
//! is best-effort — a bus failure is logged, never propagated, because all
//! state-carrying events are also present in the message store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use parley_bus::{interrupt_key, make_envelope, topic_channel, EventBus, EventType, KeyValueStore};
use parley_store::{MessageRecord, MessageStore, NewMessage, Participant, TopicRecord, TopicStore};

/// Processing phases surfaced to clients via `topic_process_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPhase {
    LoadLlmTool,
    PrepareContext,
    MsgTypeClassify,
    MsgPreDeal,
    MsgDeal,
    PostMsgDeal,
}

impl ProcessPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessPhase::LoadLlmTool => "load_llm_tool",
            ProcessPhase::PrepareContext => "prepare_context",
            ProcessPhase::MsgTypeClassify => "msg_type_classify",
            ProcessPhase::MsgPreDeal => "msg_pre_deal",
            ProcessPhase::MsgDeal => "msg_deal",
            ProcessPhase::PostMsgDeal => "post_msg_deal",
        }
    }
}

/// Default lifetime of an interrupt flag.
const INTERRUPT_TTL: Duration = Duration::from_secs(30);

pub struct TopicService {
    store: Arc<dyn MessageStore>,
    topics: Arc<dyn TopicStore>,
    bus: Arc<dyn EventBus>,
    kv: Arc<dyn KeyValueStore>,
}

impl TopicService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        topics: Arc<dyn TopicStore>,
        bus: Arc<dyn EventBus>,
        kv: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self { store, topics, bus, kv }
    }

    pub fn message_store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    // ─── Messages ────────────────────────────────────────────────────────────

    /// Persist a message, then fan it out as `new_message`.
    pub async fn send_message(&self, msg: NewMessage) -> anyhow::Result<MessageRecord> {
        let record = self.store.append(msg).await?;
        let mut fields = Map::new();
        fields.insert("data".into(), serde_json::to_value(&record)?);
        self.publish(&record.topic_id, EventType::NewMessage, fields).await;
        Ok(record)
    }

    pub async fn get_topic(&self, topic_id: &str) -> anyhow::Result<Option<TopicRecord>> {
        self.topics.get_topic(topic_id).await
    }

    /// Delete everything after `to_message_id` and announce the rollback.
    /// Returns the number of deleted messages.
    pub async fn rollback(&self, topic_id: &str, to_message_id: &str) -> anyhow::Result<usize> {
        let removed = self.store.delete_after(topic_id, to_message_id).await?;
        let mut fields = Map::new();
        fields.insert("data".into(), json!({ "to_message_id": to_message_id }));
        self.publish(topic_id, EventType::MessagesRolledBack, fields).await;
        Ok(removed)
    }

    // ─── Events ──────────────────────────────────────────────────────────────

    /// Publish an event on the topic channel.  Best-effort: failures are
    /// logged and swallowed.
    pub async fn publish_event(&self, topic_id: &str, event_type: EventType, fields: Map<String, Value>) {
        self.publish(topic_id, event_type, fields).await;
    }

    async fn publish(&self, topic_id: &str, event_type: EventType, fields: Map<String, Value>) {
        let envelope = make_envelope(event_type, fields);
        let channel = topic_channel(topic_id);
        let payload = envelope.to_string();
        if let Err(e) = self.bus.publish(&channel, &payload).await {
            warn!(topic_id, event = event_type.as_str(), error = %e, "event publish failed");
        } else {
            debug!(topic_id, event = event_type.as_str(), "event published");
        }
    }

    /// Phase transition of one agent's processing pass.
    pub async fn publish_process_event(
        &self,
        topic_id: &str,
        phase: ProcessPhase,
        agent_id: &str,
        status: &str,
        data: Value,
        agent_name: Option<&str>,
        agent_avatar: Option<&str>,
    ) {
        let mut fields = Map::new();
        fields.insert("phase".into(), json!(phase.as_str()));
        fields.insert("agent_id".into(), json!(agent_id));
        fields.insert("status".into(), json!(status));
        fields.insert("data".into(), data);
        if let Some(name) = agent_name {
            fields.insert("agent_name".into(), json!(name));
        }
        if let Some(avatar) = agent_avatar {
            fields.insert("agent_avatar".into(), json!(avatar));
        }
        self.publish(topic_id, EventType::TopicProcessEvent, fields).await;
    }

    /// Chain advanced by one step.
    #[allow(clippy::too_many_arguments)]
    pub async fn publish_action_chain_progress(
        &self,
        topic_id: &str,
        agent_id: &str,
        chain_id: &str,
        current_index: usize,
        total_steps: usize,
        status: &str,
        current_step: Value,
    ) {
        let mut fields = Map::new();
        fields.insert("agent_id".into(), json!(agent_id));
        fields.insert("chain_id".into(), json!(chain_id));
        fields.insert("current_index".into(), json!(current_index));
        fields.insert("total_steps".into(), json!(total_steps));
        fields.insert("status".into(), json!(status));
        fields.insert("current_step".into(), current_step);
        self.publish(topic_id, EventType::ActionChainProgress, fields).await;
    }

    /// Replace the roster (published when the REST layer changes membership).
    pub async fn publish_participants_updated(&self, topic_id: &str, participants: &[Participant]) {
        let mut fields = Map::new();
        fields.insert("data".into(), json!({ "participants": participants }));
        self.publish(topic_id, EventType::TopicParticipantsUpdated, fields).await;
    }

    // ─── Interrupts ──────────────────────────────────────────────────────────

    /// Raise the interrupt flag for `(topic, agent)`.  The flag is
    /// short-lived; a stalled agent must not trip on stale requests.
    pub async fn request_interrupt(&self, topic_id: &str, agent_id: &str) -> anyhow::Result<()> {
        self.kv
            .set(&interrupt_key(topic_id, agent_id), "1", Some(INTERRUPT_TTL))
            .await
    }

    pub async fn check_interrupt(&self, topic_id: &str, agent_id: &str) -> bool {
        match self.kv.exists(&interrupt_key(topic_id, agent_id)).await {
            Ok(v) => v,
            Err(e) => {
                warn!(topic_id, agent_id, error = %e, "interrupt check failed");
                false
            }
        }
    }

    pub async fn clear_interrupt(&self, topic_id: &str, agent_id: &str) {
        if let Err(e) = self.kv.delete(&interrupt_key(topic_id, agent_id)).await {
            warn!(topic_id, agent_id, error = %e, "interrupt clear failed");
        }
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
