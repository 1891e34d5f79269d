// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use parley_store::SessionType;

/// Server configuration, loaded from `parley.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Redis connection URL for the bus, interrupt flags, and action chains.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Endpoint of the external MCP execution service.  Agents can run
    /// without it, but any planned MCP step will fail with a clear error.
    #[serde(default)]
    pub mcp_executor_url: Option<String>,

    #[serde(default)]
    pub llm_configs: Vec<LlmConfigEntry>,

    #[serde(default)]
    pub topics: Vec<TopicEntry>,

    #[serde(default)]
    pub agents: Vec<AgentEntry>,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfigEntry {
    pub config_id: String,
    pub provider: String,
    #[serde(default)]
    pub api_url: Option<String>,
    /// Environment variable that holds the API key (read at startup).
    /// Prefer this over `api_key` to keep secrets out of config files.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl LlmConfigEntry {
    pub fn resolve_api_key(&self) -> String {
        if let Some(env) = &self.api_key_env {
            if let Ok(key) = std::env::var(env) {
                return key;
            }
        }
        self.api_key.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicEntry {
    pub topic_id: String,
    pub session_type: SessionType,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    pub agent_id: String,
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub llm_config_id: Option<String>,
    /// Topics the agent joins at startup.
    #[serde(default)]
    pub topics: Vec<String>,
    /// Free-form agent ext (`mcp_servers`, `persona.responseMode`, …).
    #[serde(default)]
    pub ext: Map<String, Value>,
}

pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let path = path.unwrap_or_else(|| Path::new("parley.toml"));
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config {}", path.display()))?;
    let config: Config =
        toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

/// Cross-reference checks: agents must point at known LLM configs and topics.
pub fn validate(config: &Config) -> anyhow::Result<()> {
    for agent in &config.agents {
        if let Some(config_id) = &agent.llm_config_id {
            if !config.llm_configs.iter().any(|c| &c.config_id == config_id) {
                anyhow::bail!(
                    "agent {} references unknown llm config {}",
                    agent.agent_id,
                    config_id
                );
            }
        }
        for topic in &agent.topics {
            if !config.topics.iter().any(|t| &t.topic_id == topic) {
                anyhow::bail!("agent {} references unknown topic {}", agent.agent_id, topic);
            }
        }
    }
    Ok(())
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
