// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! LLM provider contract for the parley actor runtime.
//!
//! The actor core only depends on two calls — `chat` (blocking completion)
//! and `chat_stream` (delta stream with optional reasoning-trace events).
//! Concrete providers live behind [`ModelProvider`]; the one shipped here
//! speaks the OpenAI-compatible `/chat/completions` wire format, which covers
//! the large majority of hosted and local endpoints.  Tests use the scripted
//! mocks instead of the network.

pub mod catalog;
pub mod media;
pub mod mock;
mod openai_compat;
mod provider;
mod types;

pub use media::{normalize_media, MediaItem, MediaKind};
pub use mock::{MockProvider, ScriptedMockProvider};
pub use openai_compat::OpenAiCompatProvider;
pub use provider::{create_provider, ChatStream, HttpProviderFactory, ModelProvider, ProviderFactory};
pub use types::{
    ChatMessage, ChatRequest, ChatResponse, LlmConfig, Role, StreamEnd, StreamEvent,
    ToolCallRequest, ToolSchema, Usage,
};
