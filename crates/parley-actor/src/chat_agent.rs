// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The default conversational agent.
//!
//! Decision order: explicit `@`-mention, private chat, plain (non-persona)
//! 1:1 sessions, peer-agent silence, then a small LLM intent classification
//! biased by whether the message reads as a question.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, error};

use parley_model::{ChatMessage, ChatRequest, ModelProvider, ProviderFactory};
use parley_store::{MessageRecord, SenderType, SessionType};

use crate::actions::{ActionStep, DecisionAction, ResponseDecision};
use crate::behavior::AgentBehavior;
use crate::context::IterationContext;
use crate::engine::ActorCore;

/// Interrogative markers: a full- or half-width question mark, or any of the
/// common Chinese question words.
const QUESTION_KEYWORDS: &[&str] = &[
    "为什么", "怎么", "如何", "能否", "是否", "吗", "么", "多少", "哪", "哪里", "哪个",
];

const INTENT_SYSTEM_PROMPT: &str = "你是一个多智能体话题中的单个Agent。你需要决定是否要参与发言，以保持会话收敛。\n\
可选动作(action)：reply / like / oppose / silent / ask_human / delegate。\n\
规则：\n\
- 如果需要人类确认或执行操作，用 ask_human。\n\
- 如果需要其他Agent更合适处理，用 delegate，并选择一个 agent_id。\n\
- 点赞不是消息内容改变，只返回 like。\n\
- 反对要简短有证据，返回 oppose。\n\
- 如果不确定且无必要，选择 silent。\n\
输出必须是严格JSON：{\"action\":\"reply|like|oppose|silent|ask_human|delegate\",\"agent_id\":\"(delegate时必填)\"}";

#[derive(Default)]
pub struct ChatAgent;

impl ChatAgent {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AgentBehavior for ChatAgent {
    async fn should_respond(
        &self,
        core: &ActorCore,
        topic_id: &str,
        msg: &MessageRecord,
    ) -> ResponseDecision {
        let content = msg.content.as_str();

        // 1. Mentions override everything.
        if msg.mentions.iter().any(|m| m == &core.agent_id) {
            return ResponseDecision::reply("被 @ 提及，必须回复");
        }

        let session_type = core
            .deps
            .topics
            .get_topic(topic_id)
            .await
            .ok()
            .flatten()
            .map(|t| t.session_type);

        // 2. Private chats always get a reply.
        if session_type == Some(SessionType::PrivateChat) {
            return ResponseDecision::reply_quick("私聊模式");
        }

        // 3. 1:1 agent sessions reply directly unless the agent runs in
        //    persona mode, which falls through to the group rules.
        if session_type == Some(SessionType::Agent) {
            let response_mode = core
                .profile
                .as_ref()
                .map(|p| p.response_mode().to_string())
                .unwrap_or_else(|| "normal".into());
            if response_mode == "normal" {
                return ResponseDecision::reply_quick("Agent 普通模式");
            }
        }

        // 4. Peer-agent chatter stays silent.
        if msg.sender_type == SenderType::Agent {
            if content.contains("@human") {
                return ResponseDecision::silent("对方在请求人类协助");
            }
            return ResponseDecision::silent("其他 Agent 的消息");
        }

        // 5/6. User messages: classify, biased towards replying to questions.
        let default_action = if is_question(content) {
            DecisionAction::Reply
        } else {
            DecisionAction::Silent
        };
        self.llm_intent_decision(core, msg, default_action).await
    }

    /// Plan one `AG_USE_MCP` per user-selected MCP server (at most three),
    /// leaving tool selection to the executor (`tool_name = "auto"`).  With
    /// no explicit selection, a skill pack whose trigger keyword matches the
    /// message contributes its `mcp_call` steps instead.
    async fn plan_actions(&self, core: &ActorCore, ctx: &IterationContext) -> Vec<ActionStep> {
        let servers = ctx.original_message.ext.mcp_servers();
        if !servers.is_empty() {
            return servers
                .into_iter()
                .take(3)
                .map(|server_id| {
                    let mut params = Map::new();
                    params.insert("input".into(), json!(ctx.original_message.content));
                    ActionStep::mcp(server_id, "auto", params)
                })
                .collect();
        }

        let Some(skill) = core
            .capabilities
            .find_skill_by_keyword(&ctx.original_message.content)
        else {
            return Vec::new();
        };
        skill
            .steps
            .iter()
            .filter(|step| step.get("type").and_then(Value::as_str) == Some("mcp_call"))
            .take(3)
            .filter_map(|step| {
                let server_id = step
                    .get("mcpServer")
                    .or_else(|| step.get("mcp_server"))
                    .and_then(Value::as_str)?;
                let tool_name = step
                    .get("toolName")
                    .or_else(|| step.get("tool_name"))
                    .and_then(Value::as_str)
                    .unwrap_or("auto");
                let mut params = step
                    .get("arguments")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                params
                    .entry("input".to_string())
                    .or_insert_with(|| json!(ctx.original_message.content));
                Some(ActionStep::mcp(server_id, tool_name, params))
            })
            .collect()
    }
}

impl ChatAgent {
    async fn llm_intent_decision(
        &self,
        core: &ActorCore,
        msg: &MessageRecord,
        default_action: DecisionAction,
    ) -> ResponseDecision {
        match self.try_intent_decision(core, msg, default_action).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(agent_id = %core.agent_id, error = %e, "intent decision failed");
                ResponseDecision::of(default_action, "")
            }
        }
    }

    async fn try_intent_decision(
        &self,
        core: &ActorCore,
        msg: &MessageRecord,
        default_action: DecisionAction,
    ) -> anyhow::Result<ResponseDecision> {
        let agents: Vec<_> = core
            .state
            .participants
            .iter()
            .filter(|p| p.participant_type == SenderType::Agent)
            .collect();

        let agent_lines: Vec<String> = agents
            .iter()
            .map(|p| {
                let name = p.name.as_deref().unwrap_or(&p.participant_id);
                let ability = core
                    .state
                    .agent_abilities
                    .get(&p.participant_id)
                    .map(String::as_str)
                    .unwrap_or("");
                format!("- {} (id={}): {}", name, p.participant_id, ability)
            })
            .collect();
        let agents_desc = if agent_lines.is_empty() {
            "(无其他agent)".to_string()
        } else {
            agent_lines.join("\n")
        };

        let me_name = core.agent_name();
        let persona: String = core.persona_prompt().chars().take(800).collect();
        let user_text = msg.content.trim();

        let user = format!(
            "我的名字：{me_name}\n\
             我的人设：{persona}\n\
             Topic中的其他Agent与能力概览：\n{agents_desc}\n\n\
             用户消息：{user_text}\n\n\
             默认倾向：{}\n\
             请基于人设与能力分工做出动作决策。",
            default_action.as_str(),
        );

        let Some(config_id) = core.default_llm_config_id() else {
            return Ok(ResponseDecision::of(default_action, ""));
        };
        let config = core.load_llm_config(config_id).await?;
        let provider = core.deps.providers.create(&config, true)?;
        let resp = provider
            .chat(ChatRequest::from_messages(vec![
                ChatMessage::system(INTENT_SYSTEM_PROMPT),
                ChatMessage::user(user),
            ]))
            .await?;

        let Some((action, agent_id)) = parse_intent(&resp.content) else {
            debug!(agent_id = %core.agent_id, "unparseable intent reply, using default");
            return Ok(ResponseDecision::of(default_action, ""));
        };

        Ok(match action {
            DecisionAction::Delegate => {
                // A delegation target must be a present participant.
                let valid = agent_id.as_deref().filter(|id| {
                    agents.iter().any(|p| p.participant_id == *id)
                });
                match valid {
                    Some(id) => ResponseDecision::delegate(id, format!("委派给 {id}")),
                    None => ResponseDecision::of(default_action, ""),
                }
            }
            DecisionAction::Reply => ResponseDecision::reply("LLM 决策回复"),
            DecisionAction::Like => ResponseDecision::of(DecisionAction::Like, "LLM 决策点赞"),
            DecisionAction::Oppose => ResponseDecision::of(DecisionAction::Oppose, "LLM 决策反对"),
            DecisionAction::AskHuman => {
                ResponseDecision::of(DecisionAction::AskHuman, "LLM 决策请求人类")
            }
            DecisionAction::Silent => ResponseDecision::silent("LLM 决策沉默"),
        })
    }
}

/// A message is a question when it carries a question mark (either width) or
/// any interrogative keyword.
pub(crate) fn is_question(text: &str) -> bool {
    let t = text.trim();
    if t.is_empty() {
        return false;
    }
    if t.contains('？') || t.contains('?') {
        return true;
    }
    QUESTION_KEYWORDS.iter().any(|k| t.contains(k))
}

/// Locate the first `{…}` substring in the classifier output and parse it as
/// strict JSON `{action, agent_id?}`.  Any failure yields `None` (callers
/// fall back to the default action).
pub(crate) fn parse_intent(raw: &str) -> Option<(DecisionAction, Option<String>)> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    let obj: Value = serde_json::from_str(&raw[start..=end]).ok()?;
    let action = DecisionAction::parse(obj.get("action")?.as_str()?)?;
    let agent_id = obj
        .get("agent_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Some((action, agent_id))
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── is_question ───────────────────────────────────────────────────────────

    #[test]
    fn question_marks_both_widths() {
        assert!(is_question("今天天气如何？"));
        assert!(is_question("what now?"));
    }

    #[test]
    fn interrogative_keywords_detected() {
        assert!(is_question("为什么会这样"));
        assert!(is_question("这个多少钱"));
        assert!(is_question("去哪里吃饭"));
    }

    #[test]
    fn statements_are_not_questions() {
        assert!(!is_question("今天天气不错"));
        assert!(!is_question(""));
        assert!(!is_question("   "));
    }

    // ── parse_intent ──────────────────────────────────────────────────────────

    #[test]
    fn parses_bare_json() {
        let (action, agent) = parse_intent(r#"{"action":"reply"}"#).unwrap();
        assert_eq!(action, DecisionAction::Reply);
        assert!(agent.is_none());
    }

    #[test]
    fn parses_json_wrapped_in_prose() {
        let raw = "好的，我的决定是：\n```json\n{\"action\":\"delegate\",\"agent_id\":\"a2\"}\n```";
        let (action, agent) = parse_intent(raw).unwrap();
        assert_eq!(action, DecisionAction::Delegate);
        assert_eq!(agent.as_deref(), Some("a2"));
    }

    #[test]
    fn rejects_unknown_action() {
        assert!(parse_intent(r#"{"action":"shout"}"#).is_none());
    }

    #[test]
    fn rejects_missing_braces() {
        assert!(parse_intent("reply").is_none());
        assert!(parse_intent("}{").is_none());
    }

    #[test]
    fn empty_agent_id_is_none() {
        let (_, agent) = parse_intent(r#"{"action":"delegate","agent_id":""}"#).unwrap();
        assert!(agent.is_none());
    }
}
