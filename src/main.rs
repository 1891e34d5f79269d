// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;
mod config;

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use parley_actor::{ActionChainStore, ActorManager, ChatAgent, EngineConfig};
use parley_bus::{EventBus, RedisBus, RedisKv};
use parley_mcp::{HttpMcpExecutor, McpErrorKind, McpExecutionOutcome, McpExecutionRequest, McpExecutor};
use parley_model::{HttpProviderFactory, LlmConfig};
use parley_store::{
    AgentProfile, MemoryAgentDirectory, MemoryLlmConfigs, MemoryMessageStore, MemoryTopicStore,
    TopicRecord,
};
use parley_topic::TopicService;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Some(Commands::ShowConfig) => {
            let config = config::load(cli.config.as_deref())?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Commands::Check) => {
            let config = config::load(cli.config.as_deref())?;
            println!(
                "ok: {} agents, {} topics, {} llm configs",
                config.agents.len(),
                config.topics.len(),
                config.llm_configs.len()
            );
            Ok(())
        }
        None | Some(Commands::Serve) => {
            let config = config::load(cli.config.as_deref())?;
            serve(config).await
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn serve(config: config::Config) -> anyhow::Result<()> {
    let bus = RedisBus::connect(&config.redis_url)
        .await
        .with_context(|| format!("cannot reach redis at {}", config.redis_url))?;
    let kv = Arc::new(RedisKv::new(bus.connection()));
    let bus: Arc<dyn EventBus> = Arc::new(bus);

    // Message/topic/agent persistence is owned by the REST layer; the runtime
    // holds the in-process stores seeded from the config file.
    let store = Arc::new(MemoryMessageStore::new());
    let topics = Arc::new(MemoryTopicStore::new());
    let configs = Arc::new(MemoryLlmConfigs::new());
    let agents = Arc::new(MemoryAgentDirectory::new());

    for entry in &config.llm_configs {
        configs.insert(LlmConfig {
            config_id: entry.config_id.clone(),
            provider: entry.provider.clone(),
            api_url: entry.api_url.clone(),
            api_key: entry.resolve_api_key(),
            model: entry.model.clone(),
            enabled: entry.enabled,
        });
    }
    for entry in &config.topics {
        let mut topic = TopicRecord::new(entry.topic_id.as_str(), entry.session_type);
        topic.name = entry.name.clone();
        topics.insert(topic);
    }
    for entry in &config.agents {
        let mut profile = AgentProfile::new(entry.agent_id.as_str(), entry.name.as_str())
            .with_system_prompt(entry.system_prompt.as_str());
        profile.avatar = entry.avatar.clone();
        profile.llm_config_id = entry.llm_config_id.clone();
        profile.ext = entry.ext.clone();
        agents.insert_agent(profile);
    }

    let topic_service = Arc::new(TopicService::new(
        store,
        topics,
        Arc::clone(&bus),
        kv.clone(),
    ));

    let mcp: Arc<dyn McpExecutor> = match &config.mcp_executor_url {
        Some(url) => Arc::new(HttpMcpExecutor::new(url)?),
        None => Arc::new(DisabledMcpExecutor),
    };

    let deps = parley_actor::ActorDeps {
        topics: topic_service,
        configs,
        agents,
        providers: Arc::new(HttpProviderFactory),
        mcp,
        chains: Arc::new(ActionChainStore::new(kv)),
    };

    let manager = ActorManager::new(deps, bus, EngineConfig::default());
    for agent in &config.agents {
        for topic in &agent.topics {
            manager
                .activate_agent(&agent.agent_id, topic, None, Arc::new(ChatAgent::new()))
                .await;
        }
    }

    info!(
        agents = config.agents.len(),
        topics = config.topics.len(),
        "parley runtime up, waiting for topic events (ctrl-c to stop)"
    );
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    manager.shutdown();
    Ok(())
}

/// Stand-in executor when no MCP execution service is configured: every
/// planned MCP step fails fast with an explicit reason instead of hanging.
struct DisabledMcpExecutor;

#[async_trait]
impl McpExecutor for DisabledMcpExecutor {
    async fn execute_with_llm(
        &self,
        req: McpExecutionRequest,
    ) -> anyhow::Result<McpExecutionOutcome> {
        Ok(McpExecutionOutcome::failure(
            req.server_id,
            "MCP 执行服务未配置（缺少 mcp_executor_url）",
            McpErrorKind::Other("unconfigured".into()),
        ))
    }
}
