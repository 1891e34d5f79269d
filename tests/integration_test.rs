// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Cross-crate integration: the non-reply decision paths (like / oppose /
//! ask-human / delegate) driven through the full manager + bus + store stack.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use parley_actor::{ActionChainStore, ActorDeps, ActorManager, ChatAgent, EngineConfig};
use parley_bus::{parse_event, topic_channel, BusSubscriber, EventBus, EventType, MemoryBus, MemoryKv, ParsedEvent};
use parley_mcp::{McpExecutor, ScriptedMcpExecutor};
use parley_model::{LlmConfig, ModelProvider, ProviderFactory, ScriptedMockProvider};
use parley_store::{
    AgentProfile, MemoryAgentDirectory, MemoryLlmConfigs, MemoryMessageStore, MemoryTopicStore,
    NewMessage, Participant, SessionType, TopicRecord,
};
use parley_topic::TopicService;

struct SingleProviderFactory(Arc<ScriptedMockProvider>);

impl ProviderFactory for SingleProviderFactory {
    fn create(
        &self,
        _config: &LlmConfig,
        _use_thought_signature: bool,
    ) -> anyhow::Result<Arc<dyn ModelProvider>> {
        Ok(self.0.clone())
    }
}

struct Stack {
    store: Arc<MemoryMessageStore>,
    bus: MemoryBus,
    topic_service: Arc<TopicService>,
    manager: ActorManager,
}

/// One agent ("agent-a") on a `topic_general` topic whose intent classifier
/// always answers with `classifier_reply`.
async fn stack(topic_id: &str, classifier_reply: &str) -> Stack {
    let bus = MemoryBus::new();
    let store = Arc::new(MemoryMessageStore::new());
    let topics = Arc::new(MemoryTopicStore::new());
    topics.insert(TopicRecord::new(topic_id, SessionType::TopicGeneral));
    let configs = Arc::new(MemoryLlmConfigs::new());
    configs.insert(LlmConfig {
        config_id: "c1".into(),
        provider: "openai".into(),
        api_url: None,
        api_key: "k".into(),
        model: "gpt-4o".into(),
        enabled: true,
    });
    let agents = Arc::new(MemoryAgentDirectory::new());
    agents.insert_agent(
        AgentProfile::new("agent-a", "评论员")
            .with_system_prompt("你是一个犀利的评论员。")
            .with_llm_config("c1"),
    );
    let kv = Arc::new(MemoryKv::new());
    let topic_service = Arc::new(TopicService::new(
        store.clone(),
        topics,
        Arc::new(bus.clone()),
        kv.clone(),
    ));
    let mcp: Arc<dyn McpExecutor> = Arc::new(ScriptedMcpExecutor::new(vec![]));
    let deps = ActorDeps {
        topics: topic_service.clone(),
        configs,
        agents,
        providers: Arc::new(SingleProviderFactory(Arc::new(
            ScriptedMockProvider::always_text(classifier_reply),
        ))),
        mcp,
        chains: Arc::new(ActionChainStore::new(kv)),
    };
    let manager = ActorManager::new(deps, Arc::new(bus.clone()), EngineConfig::default());
    manager
        .activate_agent("agent-a", topic_id, None, Arc::new(ChatAgent::new()))
        .await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    Stack { store, bus, topic_service, manager }
}

async fn subscribe(bus: &MemoryBus, topic_id: &str) -> Box<dyn BusSubscriber> {
    let mut sub = bus.open_subscriber().await.unwrap();
    sub.subscribe(&topic_channel(topic_id)).await.unwrap();
    sub
}

async fn collect(sub: &mut Box<dyn BusSubscriber>, secs: u64) -> Vec<ParsedEvent> {
    let mut events = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(secs), async {
        loop {
            if let Ok(Some(msg)) = sub.next_message().await {
                if let Some(ev) = parse_event(&msg.payload) {
                    events.push(ev);
                }
            } else {
                break;
            }
        }
    })
    .await;
    events
}

#[tokio::test]
async fn like_decision_publishes_reaction_only() {
    let st = stack("t-like", r#"{"action":"like"}"#).await;
    let mut sub = subscribe(&st.bus, "t-like").await;

    st.topic_service
        .send_message(NewMessage::user("t-like", "user-1", "我今天完成了季度目标"))
        .await
        .unwrap();
    let events = collect(&mut sub, 2).await;

    let reaction = events
        .iter()
        .find(|e| e.event_type == EventType::Reaction)
        .expect("like must publish a reaction event");
    assert_eq!(reaction.raw["reaction"], "like");
    assert_eq!(reaction.raw["from_agent_id"], "agent-a");
    assert_eq!(reaction.raw["target_sender_id"], "user-1");
    // Reactions persist no message.
    assert_eq!(st.store.len("t-like"), 1);
    st.manager.shutdown();
}

#[tokio::test]
async fn oppose_decision_posts_quoted_reply() {
    let st = stack("t-opp", r#"{"action":"oppose"}"#).await;
    let mut sub = subscribe(&st.bus, "t-opp").await;

    st.topic_service
        .send_message(NewMessage::user("t-opp", "user-1", "我认为测试都是浪费时间"))
        .await
        .unwrap();
    let _ = collect(&mut sub, 2).await;

    let reply = st
        .store
        .snapshot("t-opp")
        .into_iter()
        .find(|m| m.sender_id == "agent-a")
        .expect("oppose must persist a quoted reply");
    assert!(reply.content.starts_with("> 引用：我认为测试都是浪费时间"));
    assert!(reply.content.contains("我不同意上述观点"));
    let quoted = reply.ext.get("quotedMessage").expect("quotedMessage ext");
    assert_eq!(quoted["content"], "我认为测试都是浪费时间");
    st.manager.shutdown();
}

#[tokio::test]
async fn ask_human_decision_posts_human_request() {
    let st = stack("t-ask", r#"{"action":"ask_human"}"#).await;
    let mut sub = subscribe(&st.bus, "t-ask").await;

    st.topic_service
        .send_message(NewMessage::user("t-ask", "user-1", "把生产数据库清空"))
        .await
        .unwrap();
    let _ = collect(&mut sub, 2).await;

    let reply = st
        .store
        .snapshot("t-ask")
        .into_iter()
        .find(|m| m.sender_id == "agent-a")
        .expect("ask_human must persist a message");
    assert!(reply
        .content
        .starts_with("@human 我需要你确认/执行以下事项：把生产数据库清空"));
    assert_eq!(reply.ext.get("needs_human"), Some(&json!(true)));
    st.manager.shutdown();
}

#[tokio::test]
async fn delegate_decision_forwards_via_mention() {
    let st = stack("t-del", r#"{"action":"delegate","agent_id":"agent-b"}"#).await;

    // The delegation target must be a present participant.
    st.topic_service
        .publish_participants_updated(
            "t-del",
            &[
                Participant::agent("agent-a").with_name("评论员"),
                Participant::agent("agent-b")
                    .with_name("执行者")
                    .with_system_prompt("负责动手执行任务"),
                Participant::user("user-1"),
            ],
        )
        .await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut sub = subscribe(&st.bus, "t-del").await;
    st.topic_service
        .send_message(NewMessage::user("t-del", "user-1", "帮我部署这个服务"))
        .await
        .unwrap();
    let _ = collect(&mut sub, 2).await;

    let forward = st
        .store
        .snapshot("t-del")
        .into_iter()
        .find(|m| m.sender_id == "agent-a")
        .expect("delegate must persist a forwarding message");
    assert!(forward
        .content
        .starts_with("@agent-b 我认为这个问题更适合你处理：帮我部署这个服务"));
    assert_eq!(forward.mentions, vec!["agent-b".to_string()]);
    assert_eq!(forward.ext.get("delegated_to"), Some(&json!("agent-b")));
    st.manager.shutdown();
}
