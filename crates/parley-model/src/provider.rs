// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use futures::Stream;

use crate::openai_compat::OpenAiCompatProvider;
use crate::types::{ChatRequest, ChatResponse, LlmConfig, StreamEvent};

pub type ChatStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// The provider contract the actor core depends on.
///
/// Only two properties matter to the core: stream-ability (with thinking
/// deltas kept separate from content) and media pass-through with
/// `thoughtSignature` intact.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider id for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Blocking completion — used for summarisation and intent decisions.
    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse>;

    /// Streaming completion — used for final-response generation.
    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<ChatStream>;
}

/// Builds providers from configuration rows.  The actor engine resolves the
/// effective [`LlmConfig`] per call and hands it here, so tests can substitute
/// scripted mocks without touching the resolution logic.
pub trait ProviderFactory: Send + Sync {
    fn create(
        &self,
        config: &LlmConfig,
        use_thought_signature: bool,
    ) -> anyhow::Result<Arc<dyn ModelProvider>>;
}

/// Factory for the HTTP providers shipped with this crate.
#[derive(Debug, Default, Clone)]
pub struct HttpProviderFactory;

impl ProviderFactory for HttpProviderFactory {
    fn create(
        &self,
        config: &LlmConfig,
        use_thought_signature: bool,
    ) -> anyhow::Result<Arc<dyn ModelProvider>> {
        create_provider(config, use_thought_signature)
    }
}

/// Build a provider for a configuration row.
///
/// Every known provider type currently speaks the OpenAI-compatible wire
/// format (hosted gateways and local servers alike), so this dispatch is a
/// single arm; it exists so that native drivers can be added without touching
/// call sites.
pub fn create_provider(
    config: &LlmConfig,
    use_thought_signature: bool,
) -> anyhow::Result<Arc<dyn ModelProvider>> {
    if config.model.is_empty() {
        bail!("LLM config {} has no model name", config.config_id);
    }
    match config.provider.as_str() {
        "" => bail!("LLM config {} has no provider type", config.config_id),
        _ => Ok(Arc::new(OpenAiCompatProvider::from_config(
            config,
            use_thought_signature,
        ))),
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str, model: &str) -> LlmConfig {
        LlmConfig {
            config_id: "c1".into(),
            provider: provider.into(),
            api_url: Some("http://localhost:9999/v1".into()),
            api_key: "k".into(),
            model: model.into(),
            enabled: true,
        }
    }

    #[test]
    fn create_provider_rejects_missing_model() {
        assert!(create_provider(&config("openai", ""), true).is_err());
    }

    #[test]
    fn create_provider_rejects_missing_provider() {
        assert!(create_provider(&config("", "gpt-4"), true).is_err());
    }

    #[test]
    fn create_provider_builds_openai_compat() {
        let p = create_provider(&config("openai", "gpt-4"), true).unwrap();
        assert_eq!(p.name(), "openai");
        assert_eq!(p.model_name(), "gpt-4");
    }
}
