// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Persistence interfaces the actor core consumes, plus the record types
//! that cross them.
//!
//! The relational backing store is outside the core; everything here is a
//! trait with plain-record inputs and outputs.  The in-memory implementations
//! back the test suites and the dev server.

mod memory;
mod traits;
mod types;

pub use memory::{MemoryAgentDirectory, MemoryLlmConfigs, MemoryMessageStore, MemoryTopicStore};
pub use traits::{AgentDirectory, LlmConfigRepository, MessagePage, MessageStore, TopicStore};
pub use types::{
    AgentProfile, MessageExt, MessageRecord, NewMessage, Participant, SenderType, SessionType,
    SkillPackRecord, TopicRecord,
};
