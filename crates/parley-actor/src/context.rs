// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-message processing state: the ReAct plan/result lists, the UI step
//! trace, execution logs, and the ext envelope built for the final reply.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use parley_model::{normalize_media, MediaItem};
use parley_store::MessageRecord;

use crate::actions::{ActionResult, ActionStep, StepStatus};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ─── Execution logs ───────────────────────────────────────────────────────────

/// One granular log line, streamed to clients as `execution_log` events and
/// persisted in the reply ext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: String,
    pub timestamp: i64,
    /// info | step | tool | llm | success | error | thinking
    #[serde(rename = "type")]
    pub log_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
}

impl ExecutionLogEntry {
    pub fn new(message: impl Into<String>, log_type: impl Into<String>) -> Self {
        let ts = now_ms();
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("log-{ts}-{}", &hex[..8]),
            timestamp: ts,
            log_type: log_type.into(),
            message: message.into(),
            detail: None,
            duration: None,
        }
    }
}

// ─── Process steps ────────────────────────────────────────────────────────────

/// One node of the UI step trace.  Typed common fields plus a flattened map
/// for the step-kind-specific extras (`mcpServer`, `toolName`, `arguments`,
/// `result`, `iteration`, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStep {
    pub step_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: i64,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ProcessStep {
    fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

// ─── Iteration context ────────────────────────────────────────────────────────

pub struct IterationContext {
    pub max_iterations: usize,
    pub iteration: usize,

    pub original_message: MessageRecord,
    pub topic_id: String,
    pub reply_message_id: String,

    /// Per-turn model override; only populated for `agent` sessions.
    pub user_selected_model: Option<String>,
    pub user_selected_llm_config_id: Option<String>,

    pub planned_actions: Vec<ActionStep>,
    pub executed_results: Vec<ActionResult>,

    pub process_steps: Vec<ProcessStep>,
    pub execution_logs: Vec<ExecutionLogEntry>,

    pub is_complete: bool,
    pub is_interrupted: bool,

    pub final_content: String,
    pub final_media: Vec<MediaItem>,
    pub final_ext: Map<String, Value>,

    /// Accumulated tool output injected into the final LLM prompt.
    pub tool_results_text: String,
    /// Raw media returned by MCP tools (normalised when the ext is built).
    pub mcp_media: Vec<Value>,

    pub error: Option<String>,

    /// Chained multi-step plan carried across self-appended messages.
    pub action_plan: Option<Vec<Value>>,
    pub plan_index: usize,
    pub plan_accumulated_content: String,

    pub action_chain_id: Option<String>,
    pub inherited_chain: bool,
    pub chain_step_index: usize,
}

impl IterationContext {
    pub fn new(
        original_message: MessageRecord,
        topic_id: impl Into<String>,
        reply_message_id: impl Into<String>,
        max_iterations: usize,
    ) -> Self {
        Self {
            max_iterations,
            iteration: 0,
            original_message,
            topic_id: topic_id.into(),
            reply_message_id: reply_message_id.into(),
            user_selected_model: None,
            user_selected_llm_config_id: None,
            planned_actions: Vec::new(),
            executed_results: Vec::new(),
            process_steps: Vec::new(),
            execution_logs: Vec::new(),
            is_complete: false,
            is_interrupted: false,
            final_content: String::new(),
            final_media: Vec::new(),
            final_ext: Map::new(),
            tool_results_text: String::new(),
            mcp_media: Vec::new(),
            error: None,
            action_plan: None,
            plan_index: 0,
            plan_accumulated_content: String::new(),
            action_chain_id: None,
            inherited_chain: false,
            chain_step_index: 0,
        }
    }

    // ─── Steps & logs ────────────────────────────────────────────────────────

    pub fn add_step(
        &mut self,
        kind: &str,
        thinking: Option<&str>,
        fields: Map<String, Value>,
    ) -> &ProcessStep {
        let step = ProcessStep {
            step_id: uuid::Uuid::new_v4().simple().to_string(),
            kind: kind.to_string(),
            timestamp: now_ms(),
            status: StepStatus::Running,
            thinking: thinking.map(str::to_string),
            duration: None,
            error: None,
            fields,
        };
        self.process_steps.push(step);
        self.process_steps.last().unwrap()
    }

    /// Update the most recent step; completion states record the duration.
    pub fn update_last_step(&mut self, status: Option<StepStatus>, extra: Map<String, Value>) {
        let Some(step) = self.process_steps.last_mut() else { return };
        if let Some(status) = status {
            if matches!(status, StepStatus::Completed | StepStatus::Error) {
                step.duration = Some(now_ms() - step.timestamp);
            }
            step.status = status;
        }
        for (k, v) in extra {
            match k.as_str() {
                "thinking" => step.thinking = v.as_str().map(str::to_string),
                "error" => step.error = v.as_str().map(str::to_string),
                _ => {
                    step.fields.insert(k, v);
                }
            }
        }
    }

    pub fn add_execution_log(
        &mut self,
        message: impl Into<String>,
        log_type: &str,
        detail: Option<String>,
        duration: Option<i64>,
    ) -> ExecutionLogEntry {
        let mut entry = ExecutionLogEntry::new(message, log_type);
        entry.detail = detail;
        entry.duration = duration;
        self.execution_logs.push(entry.clone());
        entry
    }

    // ─── Plan bookkeeping ────────────────────────────────────────────────────

    pub fn has_pending_actions(&self) -> bool {
        self.executed_results.len() < self.planned_actions.len()
    }

    pub fn next_action(&self) -> Option<&ActionStep> {
        self.planned_actions.get(self.executed_results.len())
    }

    /// Append a tool's text output under its heading.
    pub fn append_tool_result(&mut self, tool_name: &str, result_text: &str) {
        if result_text.is_empty() {
            return;
        }
        if !self.tool_results_text.is_empty() {
            self.tool_results_text.push_str("\n\n");
        }
        self.tool_results_text
            .push_str(&format!("[{tool_name}]\n{result_text}"));
    }

    // ─── Completion states ───────────────────────────────────────────────────

    pub fn mark_complete(&mut self) {
        self.is_complete = true;
    }

    pub fn mark_interrupted(&mut self, reason: &str) {
        self.is_interrupted = true;
        self.add_step("interrupted", Some(reason), Map::new());
        self.update_last_step(Some(StepStatus::Completed), Map::new());
    }

    pub fn mark_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.is_complete = true;
        self.error = Some(error.clone());
        let mut fields = Map::new();
        fields.insert("error".into(), json!(error.clone()));
        self.add_step("error", Some(&format!("处理失败: {error}")), Map::new());
        self.update_last_step(Some(StepStatus::Error), fields);
    }

    // ─── Serialisation for events ────────────────────────────────────────────

    pub fn process_steps_value(&self) -> Value {
        serde_json::to_value(&self.process_steps).unwrap_or(Value::Array(Vec::new()))
    }

    /// Flat `processMessages` list (legacy UI protocol).
    pub fn to_process_messages(&self) -> Value {
        let messages: Vec<Value> = self
            .process_steps
            .iter()
            .map(|step| {
                let title = step
                    .field_str("toolName")
                    .or_else(|| {
                        step.fields
                            .get("workflowInfo")
                            .and_then(|w| w.get("name"))
                            .and_then(Value::as_str)
                    })
                    .or_else(|| step.field_str("action"))
                    .unwrap_or(&step.kind)
                    .to_string();
                let images = extract_result_images(step.fields.get("result"));
                let (content_type, image, images_field) = match images.len() {
                    0 => ("text", Value::Null, Value::Null),
                    1 => ("image", images[0].clone(), Value::Null),
                    _ => ("images", Value::Null, Value::Array(images.clone())),
                };
                let content = step
                    .thinking
                    .clone()
                    .or_else(|| step.error.clone())
                    .map(Value::String)
                    .unwrap_or(Value::Null);
                json!({
                    "type": step.kind,
                    "contentType": content_type,
                    "timestamp": step.timestamp,
                    "title": title,
                    "content": content,
                    "image": image,
                    "images": images_field,
                    "meta": serde_json::to_value(step).unwrap_or(Value::Null),
                })
            })
            .collect();
        Value::Array(messages)
    }

    /// Payload for `topic_process_event` phases.
    pub fn to_event_data(&self) -> Value {
        json!({
            "topic_id": self.topic_id,
            "message_id": self.original_message.message_id,
            "reply_message_id": self.reply_message_id,
            "iteration": self.iteration,
            "is_complete": self.is_complete,
            "error": self.error,
        })
    }

    // ─── Reply ext envelope ──────────────────────────────────────────────────

    /// Build the four-category ext envelope for the persisted reply, plus the
    /// legacy compatibility fields.
    pub fn build_ext_data(&self) -> Map<String, Value> {
        let mut all_media: Vec<MediaItem> = self.final_media.clone();
        all_media.extend(normalize_media(&self.mcp_media));

        let mind_nodes = self.build_mind_nodes();

        let mut agent_ext_content = Map::new();
        if !all_media.is_empty() {
            agent_ext_content.insert(
                "media".into(),
                serde_json::to_value(&all_media).unwrap_or(Value::Null),
            );
        }
        let mcp_results = self.extract_mcp_results();
        if !mcp_results.is_empty() {
            agent_ext_content.insert("mcpResults".into(), Value::Array(mcp_results));
        }

        let logs = serde_json::to_value(&self.execution_logs).unwrap_or(Value::Array(Vec::new()));

        let mut ext = Map::new();
        ext.insert("agent_log".into(), logs.clone());
        ext.insert("agent_mind".into(), json!({ "nodes": mind_nodes }));
        ext.insert(
            "agent_ext_content".into(),
            if agent_ext_content.is_empty() {
                Value::Null
            } else {
                Value::Object(agent_ext_content)
            },
        );
        ext.insert("processMessages".into(), self.to_process_messages());
        ext.insert("log".into(), logs);
        for (k, v) in &self.final_ext {
            ext.insert(k.clone(), v.clone());
        }
        if !all_media.is_empty() {
            ext.insert(
                "media".into(),
                serde_json::to_value(&all_media).unwrap_or(Value::Null),
            );
        }
        if let Some(error) = &self.error {
            ext.insert("error".into(), json!(error));
        }
        ext
    }

    /// Thought-chain nodes derived from the step trace.
    fn build_mind_nodes(&self) -> Vec<Value> {
        self.process_steps
            .iter()
            .map(|step| {
                let mind_type = map_step_to_mind_type(&step.kind);
                let title = step
                    .field_str("toolName")
                    .or_else(|| step.field_str("action"))
                    .unwrap_or(&step.kind);
                let mut node = json!({
                    "id": step.step_id,
                    "type": mind_type,
                    "timestamp": step.timestamp,
                    "status": step.status,
                    "title": title,
                    "content": step.thinking,
                    "duration": step.duration,
                });
                if step.fields.contains_key("mcpServer") || step.fields.contains_key("toolName") {
                    // Full results stay out of the thought chain.
                    node["mcp"] = json!({
                        "server": step.fields.get("mcpServer"),
                        "serverName": step.fields.get("mcpServerName"),
                        "toolName": step.fields.get("toolName"),
                        "arguments": step.fields.get("arguments"),
                    });
                }
                if let Some(round) = step.fields.get("iteration") {
                    node["iteration"] = json!({
                        "round": round,
                        "maxRounds": step
                            .fields
                            .get("max_iterations")
                            .cloned()
                            .unwrap_or_else(|| json!(self.max_iterations)),
                        "isFinal": step
                            .fields
                            .get("is_final_iteration")
                            .cloned()
                            .unwrap_or(json!(false)),
                    });
                }
                if let Some(action) = step.field_str("action") {
                    node["decision"] = json!({ "action": action, "reason": step.thinking });
                }
                if let Some(error) = &step.error {
                    node["error"] = json!(error);
                }
                node
            })
            .collect()
    }

    /// Pull MCP call outcomes out of the step trace for
    /// `agent_ext_content.mcpResults`.
    fn extract_mcp_results(&self) -> Vec<Value> {
        self.process_steps
            .iter()
            .filter(|s| matches!(s.kind.as_str(), "mcp_call" | "mcp_selection" | "tool_call"))
            .filter(|s| s.fields.contains_key("mcpServer") || s.fields.contains_key("toolName"))
            .map(|step| {
                let result = step.fields.get("result").cloned().unwrap_or(Value::Null);
                let mut entry = json!({
                    "serverId": step.field_str("mcpServer").unwrap_or(""),
                    "serverName": step.field_str("mcpServerName").unwrap_or(""),
                    "toolName": step.field_str("toolName").unwrap_or(""),
                    "arguments": step.fields.get("arguments"),
                    "result": result,
                    "status": step.status,
                    "duration": step.duration,
                });
                if let Some(error) = &step.error {
                    entry["errorMessage"] = json!(error);
                }
                let media = extract_result_media(step.fields.get("result"));
                if !media.is_empty() {
                    entry["extractedMedia"] = Value::Array(media);
                }
                entry
            })
            .collect()
    }
}

fn map_step_to_mind_type(kind: &str) -> &str {
    match kind {
        "thinking" => "thinking",
        "mcp_call" | "mcp_selection" | "tool_call" => "mcp_selection",
        "iteration" => "iteration",
        "agent_decision" => "decision",
        "planning" => "planning",
        "reflection" => "reflection",
        "llm_generating" | "llm_call" => "thinking",
        other => other,
    }
}

/// MCP results wrap tool content as `{result: {content: [...]}}` or
/// `{content: [...]}`.
fn result_content_list(result: Option<&Value>) -> Option<&Vec<Value>> {
    let result = result?;
    result
        .get("result")
        .and_then(|r| r.get("content"))
        .or_else(|| result.get("content"))
        .and_then(Value::as_array)
}

/// Images only (for `processMessages` rendering).
fn extract_result_images(result: Option<&Value>) -> Vec<Value> {
    let Some(content) = result_content_list(result) else { return Vec::new() };
    content
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("image"))
        .filter_map(|item| {
            let data = item.get("data").and_then(Value::as_str)?;
            if data.is_empty() {
                return None;
            }
            let mime = item
                .get("mimeType")
                .or_else(|| item.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            Some(json!({ "mimeType": mime, "data": data }))
        })
        .collect()
}

/// All media kinds (for `mcpResults.extractedMedia`).
fn extract_result_media(result: Option<&Value>) -> Vec<Value> {
    let Some(content) = result_content_list(result) else { return Vec::new() };
    content
        .iter()
        .filter_map(|item| {
            let kind = item.get("type").and_then(Value::as_str)?;
            let mime = item
                .get("mimeType")
                .or_else(|| item.get("mime_type"))
                .and_then(Value::as_str);
            match kind {
                "image" => {
                    let data = item.get("data").and_then(Value::as_str)?;
                    if data.is_empty() {
                        return None;
                    }
                    Some(json!({
                        "type": "image",
                        "mimeType": mime.unwrap_or("image/png"),
                        "data": data,
                    }))
                }
                "video" | "audio" => {
                    let data = item
                        .get("data")
                        .or_else(|| item.get("url"))
                        .and_then(Value::as_str)?;
                    Some(json!({ "type": kind, "mimeType": mime, "data": data }))
                }
                _ => None,
            }
        })
        .collect()
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_store::{MessageExt, SenderType};
    use parley_model::Role;

    fn record() -> MessageRecord {
        MessageRecord {
            message_id: "m1".into(),
            topic_id: "t1".into(),
            sender_id: "u1".into(),
            sender_type: SenderType::User,
            sender_name: None,
            sender_avatar: None,
            role: Role::User,
            content: "你好".into(),
            created_at: Utc::now(),
            mentions: vec![],
            ext: MessageExt::new(),
        }
    }

    fn ctx() -> IterationContext {
        IterationContext::new(record(), "t1", "msg_reply01", 10)
    }

    #[test]
    fn pending_actions_tracks_execution() {
        let mut c = ctx();
        c.planned_actions = vec![ActionStep::accept(), ActionStep::accept()];
        assert!(c.has_pending_actions());
        c.executed_results.push(ActionResult::ok("AG_ACCEPT", Value::Null));
        assert!(c.has_pending_actions());
        assert_eq!(
            c.next_action().unwrap().action_type,
            crate::actions::ActionKind::Accept
        );
        c.executed_results.push(ActionResult::ok("AG_ACCEPT", Value::Null));
        assert!(!c.has_pending_actions());
        assert!(c.next_action().is_none());
    }

    #[test]
    fn tool_results_accumulate_under_headings() {
        let mut c = ctx();
        c.append_tool_result("MCP:srv1", "第一个结果");
        c.append_tool_result("MCP:srv2", "第二个结果");
        assert!(c.tool_results_text.starts_with("[MCP:srv1]\n第一个结果"));
        assert!(c.tool_results_text.contains("\n\n[MCP:srv2]\n第二个结果"));
        c.append_tool_result("MCP:srv3", "");
        assert!(!c.tool_results_text.contains("srv3"));
    }

    #[test]
    fn update_last_step_records_duration() {
        let mut c = ctx();
        c.add_step("mcp_call", Some("调用中"), Map::new());
        c.update_last_step(Some(StepStatus::Completed), Map::new());
        let step = c.process_steps.last().unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.duration.is_some());
    }

    #[test]
    fn step_serialises_with_flat_fields() {
        let mut c = ctx();
        let mut fields = Map::new();
        fields.insert("mcpServer".into(), json!("srv1"));
        fields.insert("toolName".into(), json!("send_post"));
        c.add_step("mcp_call", Some("调用 MCP"), fields);
        let v = c.process_steps_value();
        assert_eq!(v[0]["type"], "mcp_call");
        assert_eq!(v[0]["mcpServer"], "srv1");
        assert_eq!(v[0]["status"], "running");
    }

    #[test]
    fn mark_error_appends_error_step() {
        let mut c = ctx();
        c.mark_error("连接失败");
        assert!(c.is_complete);
        assert_eq!(c.error.as_deref(), Some("连接失败"));
        let step = c.process_steps.last().unwrap();
        assert_eq!(step.kind, "error");
        assert_eq!(step.error.as_deref(), Some("连接失败"));
    }

    #[test]
    fn mind_nodes_map_step_kinds() {
        let mut c = ctx();
        c.add_step("llm_generating", Some("生成中"), Map::new());
        let mut fields = Map::new();
        fields.insert("mcpServer".into(), json!("srv1"));
        fields.insert("toolName".into(), json!("send_post"));
        c.add_step("mcp_call", Some("调用"), fields);
        let ext = c.build_ext_data();
        let nodes = ext["agent_mind"]["nodes"].as_array().unwrap();
        assert_eq!(nodes[0]["type"], "thinking");
        assert_eq!(nodes[1]["type"], "mcp_selection");
        assert_eq!(nodes[1]["mcp"]["server"], "srv1");
    }

    #[test]
    fn ext_carries_media_mirror_with_signature() {
        let mut c = ctx();
        c.final_media =
            vec![MediaItem::image_base64("image/png", "AAAA").with_thought_signature("sig-7")];
        let ext = c.build_ext_data();
        assert_eq!(ext["media"][0]["thoughtSignature"], "sig-7");
        assert_eq!(ext["agent_ext_content"]["media"][0]["thoughtSignature"], "sig-7");
    }

    #[test]
    fn ext_mcp_media_is_normalised_into_mirror() {
        let mut c = ctx();
        c.mcp_media = vec![json!({
            "type": "image",
            "data": "data:image/png;base64,BBBB"
        })];
        let ext = c.build_ext_data();
        assert_eq!(ext["media"][0]["data"], "BBBB");
        assert_eq!(ext["media"][0]["mimeType"], "image/png");
    }

    #[test]
    fn ext_without_media_has_null_ext_content() {
        let c = ctx();
        let ext = c.build_ext_data();
        assert!(ext["agent_ext_content"].is_null());
        assert!(!ext.contains_key("media"));
    }

    #[test]
    fn mcp_results_extracted_from_steps() {
        let mut c = ctx();
        let mut fields = Map::new();
        fields.insert("mcpServer".into(), json!("srv1"));
        fields.insert("mcpServerName".into(), json!("帖子服务"));
        fields.insert("toolName".into(), json!("send_post"));
        fields.insert(
            "result".into(),
            json!({ "content": [{ "type": "image", "mimeType": "image/png", "data": "CCCC" }] }),
        );
        c.add_step("mcp_call", Some("调用"), fields);
        c.update_last_step(Some(StepStatus::Completed), Map::new());
        let ext = c.build_ext_data();
        let results = ext["agent_ext_content"]["mcpResults"].as_array().unwrap();
        assert_eq!(results[0]["serverId"], "srv1");
        assert_eq!(results[0]["extractedMedia"][0]["data"], "CCCC");
    }

    #[test]
    fn process_messages_single_image_uses_image_field() {
        let mut c = ctx();
        let mut fields = Map::new();
        fields.insert("toolName".into(), json!("draw"));
        fields.insert(
            "result".into(),
            json!({ "content": [{ "type": "image", "mimeType": "image/png", "data": "DD" }] }),
        );
        c.add_step("mcp_call", Some("画图"), fields);
        let msgs = c.to_process_messages();
        assert_eq!(msgs[0]["contentType"], "image");
        assert_eq!(msgs[0]["image"]["data"], "DD");
        assert_eq!(msgs[0]["title"], "draw");
    }

    #[test]
    fn execution_log_ids_are_unique() {
        let mut c = ctx();
        let a = c.add_execution_log("一", "info", None, None);
        let b = c.add_execution_log("二", "info", None, None);
        assert_ne!(a.id, b.id);
        assert_eq!(c.execution_logs.len(), 2);
    }
}
