// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Final-response generation: prompt assembly, LLM streaming, persistence,
//! and the compensating error path.

use futures::StreamExt;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use parley_bus::EventType;
use parley_model::{
    normalize_media, ChatMessage, ChatRequest, ModelProvider, ProviderFactory, StreamEvent,
};
use parley_store::{AgentDirectory, MessageExt, MessageStore, NewMessage, SessionType};
use parley_topic::ProcessPhase;

use crate::actions::StepStatus;
use crate::context::IterationContext;
use crate::engine::{is_thinking_model, ActorEngine};
use crate::state::HistoryEntry;
use crate::summarize::summarize_memory;

/// How many recent history messages may re-attach their stored media.
const MEDIA_LOAD_LIMIT: usize = 3;

impl ActorEngine {
    // ─── Prompt assembly ─────────────────────────────────────────────────────

    /// Persona + capability catalogue + optional topic SOP + history usage
    /// guidance + tool-result hint.
    pub(crate) async fn build_system_prompt(&self, ctx: &IterationContext) -> String {
        let mut system_prompt = self.core.persona_prompt().to_string();

        let cap_desc = self.core.capabilities.get_capability_description();
        if !cap_desc.is_empty() {
            system_prompt.push_str("\n\n");
            system_prompt.push_str(&cap_desc);
        }

        if let Some(sop_text) = self.topic_sop_text(&ctx.topic_id).await {
            system_prompt.push_str(&format!(
                "\n\n【当前话题SOP（标准作业流程）】\n请严格按照以下流程处理用户请求：\n{sop_text}"
            ));
            info!(agent_id = %self.core.agent_id, "topic SOP injected into system prompt");
        }

        let history_count = self.core.state.history.len();
        if history_count > 0 {
            system_prompt.push_str(&format!(
                "\n\n[对话历史] 你与用户已有 {history_count} 条对话记录。请注意：\n\
                 1. 仔细阅读历史消息，理解对话的上下文和背景\n\
                 2. 用户可能引用之前的内容，请结合历史回答\n\
                 3. 历史中可能包含重要信息，请充分利用\n\
                 4. 保持对话的连贯性，避免重复已经提供过的信息"
            ));
        }

        if !ctx.tool_results_text.is_empty() {
            system_prompt.push_str(
                "\n\n【工具执行】工具已自动执行完毕，结果会在对话中提供。\
                 请仔细阅读工具执行结果，然后用自然语言直接回答用户。",
            );
        }

        system_prompt
    }

    /// Pinned SOP of a group topic, formatted for prompt injection.
    async fn topic_sop_text(&self, topic_id: &str) -> Option<String> {
        let topic = self.core.deps.topics.get_topic(topic_id).await.ok()??;
        if topic.session_type != SessionType::TopicGeneral {
            return None;
        }
        let sop_id = topic.current_sop_skill_pack_id()?.to_string();
        let pack = self
            .core
            .deps
            .agents
            .find_skill_pack(&sop_id)
            .await
            .ok()??;

        let mut lines = vec![format!("【{}】", pack.name)];
        if !pack.summary.is_empty() {
            lines.push(format!("说明: {}", pack.summary));
        }
        if !pack.steps.is_empty() {
            lines.push("\n执行流程:".to_string());
            for (i, step) in pack.steps.iter().enumerate() {
                let name = step
                    .get("name")
                    .or_else(|| step.get("title"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("步骤{}", i + 1));
                let mut line = format!("  {}. {}", i + 1, name);
                if let Some(desc) = step
                    .get("description")
                    .or_else(|| step.get("content"))
                    .and_then(Value::as_str)
                {
                    line.push_str(&format!("\n     描述: {desc}"));
                }
                if let Some(tool) = step
                    .get("tool")
                    .or_else(|| step.get("mcp_server"))
                    .and_then(Value::as_str)
                {
                    line.push_str(&format!("\n     工具: {tool}"));
                }
                lines.push(line);
            }
        }
        Some(lines.join("\n"))
    }

    /// System prompt, optional summary block, trimmed history (with lazily
    /// re-attached media), tool results, and the current user turn.
    pub(crate) async fn build_llm_messages(
        &self,
        ctx: &IterationContext,
        system_prompt: &str,
    ) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(system_prompt)];

        if let Some(summary) = &self.core.state.summary {
            messages.push(ChatMessage::system(format!(
                "【对话摘要（自动生成）】\n{summary}"
            )));
        }

        let recent = self.core.state.get_recent_history(10, 8000, 2400, false);

        // Re-attach stored media for the most recent media-bearing turns.
        // Switching the thought-signature flag off also disables re-attachment
        // (fresh image generation must not see historical media).
        let use_sig = ctx.original_message.ext.use_thought_signature();
        let media_limit = if use_sig { MEDIA_LOAD_LIMIT } else { 0 };
        let mut media_by_id: std::collections::HashMap<String, Vec<parley_model::MediaItem>> =
            std::collections::HashMap::new();
        if media_limit > 0 {
            let store = self.core.deps.topics.message_store();
            let mut loaded = 0usize;
            for msg in recent.iter().rev() {
                if loaded >= media_limit {
                    break;
                }
                let (Some(id), true) = (&msg.message_id, msg.has_media) else { continue };
                if let Ok(Some(record)) = store.get_message(&ctx.topic_id, id).await {
                    if let Some(raw) = record.ext.media_raw() {
                        let media = normalize_media(raw);
                        if !media.is_empty() {
                            media_by_id.insert(id.clone(), media);
                            loaded += 1;
                        }
                    }
                }
            }
        }

        for msg in recent {
            let media = msg
                .message_id
                .as_ref()
                .and_then(|id| media_by_id.remove(id));
            let mut chat = msg.into_chat_message();
            if let Some(media) = media {
                chat = chat.with_media(media);
            }
            messages.push(chat);
        }

        if !ctx.tool_results_text.is_empty() {
            let mcp_failures: Vec<String> = ctx
                .executed_results
                .iter()
                .filter(|r| r.is_mcp() && !r.success)
                .map(|r| {
                    format!(
                        "MCP服务器 {} 调用失败: {}",
                        r.mcp_server_id.as_deref().unwrap_or("未知服务器"),
                        r.error.as_deref().unwrap_or("未知错误"),
                    )
                })
                .collect();
            let content = if mcp_failures.is_empty() {
                format!(
                    "【工具执行结果】\n{}\n\n我已经执行了上述工具调用。现在我将根据工具返回的结果来回答你的问题。",
                    ctx.tool_results_text
                )
            } else {
                // The model must report the failure, not invent an answer.
                format!(
                    "【工具执行失败】\n\n{}\n\n⚠️ 重要提示：上述工具调用已失败，无法获取所需信息。\
                     请明确告诉用户工具调用失败，并说明可能的原因（如MCP服务不可用、网络问题等）。\
                     不要基于错误信息猜测或生成虚假的回答。",
                    mcp_failures.join("\n")
                )
            };
            messages.push(ChatMessage::assistant(content));
        }

        let user_content = ctx.original_message.content.clone();
        let mut user_msg = ChatMessage::user(user_content.clone());
        if let Some(raw) = ctx.original_message.ext.media_raw() {
            user_msg = user_msg.with_media(normalize_media(raw));
        } else if use_sig && self.core.state.should_attach_last_media(&user_content) {
            if let Some(raw) = self.core.state.get_last_media() {
                user_msg = user_msg.with_media(normalize_media(raw));
            }
        }
        messages.push(user_msg);

        messages
    }

    // ─── Streaming ───────────────────────────────────────────────────────────

    pub(crate) async fn generate_final_response(
        &mut self,
        ctx: &mut IterationContext,
    ) -> anyhow::Result<()> {
        let topic_id = ctx.topic_id.clone();

        // Interrupted during iteration: close out with whatever partial
        // content exists instead of starting a fresh generation.
        if ctx.is_interrupted {
            self.flush_interrupted_done(ctx).await;
            return Ok(());
        }

        self.publish_phase(ProcessPhase::LoadLlmTool, "running", ctx.to_event_data())
            .await;
        let config_id = self.core.resolve_llm_config_id(ctx).await?;
        let config = self.core.load_llm_config(&config_id).await?;
        self.publish_phase(
            ProcessPhase::LoadLlmTool,
            "completed",
            json!({
                "llm_config_id": config_id,
                "llm_provider": config.provider,
                "llm_model": config.model,
            }),
        )
        .await;

        self.publish_phase(ProcessPhase::PrepareContext, "running", ctx.to_event_data())
            .await;
        // Last-chance budget gate before the prompt is assembled; keeps only
        // a short tail verbatim.  Skipped when a summary already exists —
        // the new-message path summarised this pass.
        if self.core.state.summary.is_none()
            && self
                .core
                .state
                .check_memory_budget(&config.model, self.core.config.memory_budget_threshold)
        {
            let default_config = self.core.default_llm_config_id().map(str::to_string);
            summarize_memory(
                &mut self.core.state,
                &self.core.deps,
                &self.core.agent_id,
                default_config.as_deref(),
                5,
                5,
            )
            .await;
        }
        let system_prompt = self.build_system_prompt(ctx).await;
        let messages = self.build_llm_messages(ctx, &system_prompt).await;
        self.publish_phase(
            ProcessPhase::PrepareContext,
            "completed",
            json!({
                "history_count": messages.len(),
                "has_summary": self.core.state.summary.is_some(),
                "model": config.model,
            }),
        )
        .await;

        let thinking_model = is_thinking_model(&config.provider, &config.model);
        let mut fields = Map::new();
        fields.insert("llm_provider".into(), json!(config.provider));
        fields.insert("llm_model".into(), json!(config.model));
        fields.insert("is_thinking_model".into(), json!(thinking_model));
        fields.insert("iteration".into(), json!(ctx.iteration));
        let phase_label = if thinking_model { "思考中..." } else { "生成中..." };
        ctx.add_step(
            "llm_generating",
            Some(&format!("使用 {}/{} {}", config.provider, config.model, phase_label)),
            fields,
        );

        // One more interrupt checkpoint before tokens start flowing.
        if self.check_interruption(ctx).await {
            ctx.mark_interrupted("用户中断");
            self.flush_interrupted_done(ctx).await;
            return Ok(());
        }

        self.publish_phase(ProcessPhase::MsgDeal, "running", ctx.to_event_data())
            .await;

        let use_sig = ctx.original_message.ext.use_thought_signature();
        let provider = self.core.deps.providers.create(&config, use_sig)?;
        let mut stream = provider
            .chat_stream(ChatRequest::from_messages(messages))
            .await?;

        let mut full_content = String::new();
        let mut thinking_buffer = String::new();
        let mut stream_end = None;

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Thinking(delta) => {
                    thinking_buffer.push_str(&delta);
                    // Reasoning trace goes out as logs, never into content.
                    // The id is stable so clients replace the entry instead
                    // of appending one per delta.
                    let mut fields = Map::new();
                    fields.insert(
                        "data".into(),
                        json!({
                            "id": format!("log-think-{}", ctx.reply_message_id),
                            "timestamp": chrono::Utc::now().timestamp_millis(),
                            "type": "thinking",
                            "message": "思考中...",
                            "detail": thinking_buffer,
                            "agent_id": self.core.agent_id,
                            "agent_name": self.core.agent_name(),
                        }),
                    );
                    self.core
                        .deps
                        .topics
                        .publish_event(&topic_id, EventType::ExecutionLog, fields)
                        .await;
                }
                StreamEvent::TextDelta(chunk) => {
                    full_content.push_str(&chunk);
                    let mut fields = self.agent_event_fields();
                    fields.insert("message_id".into(), json!(ctx.reply_message_id));
                    fields.insert("chunk".into(), json!(chunk));
                    fields.insert("accumulated".into(), json!(full_content));
                    fields.insert("processSteps".into(), ctx.process_steps_value());
                    self.core
                        .deps
                        .topics
                        .publish_event(&topic_id, EventType::AgentStreamChunk, fields)
                        .await;
                }
                StreamEvent::Done(end) => {
                    stream_end = Some(end);
                }
            }
        }

        let end = stream_end.unwrap_or_default();
        ctx.final_media = end.media;

        let final_thinking = end
            .thinking
            .filter(|t| !t.trim().is_empty())
            .or_else(|| {
                if thinking_buffer.trim().is_empty() {
                    None
                } else {
                    Some(thinking_buffer)
                }
            });
        if let Some(thinking) = final_thinking {
            let mut extra = Map::new();
            extra.insert("thinking".into(), json!(thinking));
            ctx.update_last_step(None, extra);
            let entry =
                ctx.add_execution_log("思考完成", "thinking", Some(thinking), None);
            self.send_execution_log(&topic_id, &entry).await;
        }
        if end.usage.is_some() || end.finish_reason.is_some() {
            ctx.final_ext.insert(
                "llmResponse".into(),
                json!({ "usage": end.usage, "finish_reason": end.finish_reason }),
            );
        }

        let mut extra = Map::new();
        extra.insert("is_final_iteration".into(), json!(true));
        ctx.update_last_step(Some(StepStatus::Completed), extra);
        ctx.final_content = full_content.clone();

        let entry = ctx.add_execution_log("执行完成", "success", None, None);
        self.send_execution_log(&topic_id, &entry).await;

        let mut ext_data = ctx.build_ext_data();
        ext_data.insert(
            "llmInfo".into(),
            json!({
                "provider": config.provider,
                "model": config.model,
                "configId": config_id,
            }),
        );
        let media_mirror = ext_data.get("media").cloned();

        self.core
            .deps
            .topics
            .send_message(
                NewMessage {
                    sender_name: Some(self.core.agent_name().to_string()),
                    sender_avatar: self.core.agent_avatar().map(str::to_string),
                    ..NewMessage::agent(topic_id.as_str(), self.core.agent_id.as_str(), full_content.clone())
                }
                .with_id(ctx.reply_message_id.as_str())
                .with_ext(MessageExt(ext_data)),
            )
            .await?;

        self.core.state.append_entry(HistoryEntry {
            message_id: Some(ctx.reply_message_id.clone()),
            role: parley_model::Role::Assistant,
            content: full_content.clone(),
            created_at: chrono::Utc::now(),
            sender_id: self.core.agent_id.clone(),
            sender_type: parley_store::SenderType::Agent,
            has_media: media_mirror.as_ref().map(|m| !m.is_null()).unwrap_or(false),
        });

        let mut fields = self.agent_event_fields();
        fields.insert("message_id".into(), json!(ctx.reply_message_id));
        fields.insert("content".into(), json!(full_content));
        fields.insert("processSteps".into(), ctx.process_steps_value());
        fields.insert("processMessages".into(), ctx.to_process_messages());
        fields.insert(
            "execution_logs".into(),
            serde_json::to_value(&ctx.execution_logs).unwrap_or(Value::Null),
        );
        if let Some(media) = media_mirror {
            fields.insert("media".into(), media);
        }
        self.core
            .deps
            .topics
            .publish_event(&topic_id, EventType::AgentStreamDone, fields)
            .await;

        self.publish_phase(ProcessPhase::MsgDeal, "completed", ctx.to_event_data())
            .await;
        self.publish_phase(ProcessPhase::PostMsgDeal, "completed", ctx.to_event_data())
            .await;
        Ok(())
    }

    /// Close out an interrupted pass: a terminal `agent_stream_done` with the
    /// partial content gathered so far, nothing persisted.
    async fn flush_interrupted_done(&self, ctx: &IterationContext) {
        let mut fields = self.agent_event_fields();
        fields.insert("message_id".into(), json!(ctx.reply_message_id));
        fields.insert("content".into(), json!(ctx.plan_accumulated_content));
        fields.insert("processSteps".into(), ctx.process_steps_value());
        fields.insert("interrupted".into(), json!(true));
        self.core
            .deps
            .topics
            .publish_event(&ctx.topic_id, EventType::AgentStreamDone, fields)
            .await;
    }

    // ─── Error compensation ──────────────────────────────────────────────────

    /// Every failure inside processing funnels here: a terminal
    /// `agent_stream_done{error}` plus a persisted `[错误]` reply carrying the
    /// step trace, so clients are never left hanging.
    pub(crate) async fn handle_process_error(&mut self, ctx: &mut IterationContext) {
        let error = ctx.error.clone().unwrap_or_else(|| "unknown".into());
        let topic_id = ctx.topic_id.clone();

        let mut fields = self.agent_event_fields();
        fields.insert("message_id".into(), json!(ctx.reply_message_id));
        fields.insert("content".into(), json!(""));
        fields.insert("processSteps".into(), ctx.process_steps_value());
        fields.insert("error".into(), json!(error));
        self.core
            .deps
            .topics
            .publish_event(&topic_id, EventType::AgentStreamDone, fields)
            .await;

        let error_content = format!("[错误] {} 无法产生回复: {}", self.core.agent_name(), error);
        let ext = MessageExt::new()
            .with("processSteps", ctx.process_steps_value())
            .with("error", json!(error));
        let sent = self
            .core
            .deps
            .topics
            .send_message(
                NewMessage {
                    sender_name: Some(self.core.agent_name().to_string()),
                    sender_avatar: self.core.agent_avatar().map(str::to_string),
                    ..NewMessage::agent(topic_id.as_str(), self.core.agent_id.as_str(), error_content.clone())
                }
                .with_id(ctx.reply_message_id.as_str())
                .with_ext(ext),
            )
            .await;
        match sent {
            Ok(record) => self.core.state.append_record(&record),
            Err(e) => {
                warn!(agent_id = %self.core.agent_id, error = %e, "error reply persist failed")
            }
        }
    }
}
