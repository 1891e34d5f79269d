// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Memory summarisation: condense the older part of an actor's history into
//! a running summary so the prompt stays inside the model's context window.
//!
//! The summary always uses the agent's default LLM config — never a per-turn
//! user override — to keep cost and latency predictable.

use tracing::{debug, info, warn};

use parley_model::{ChatMessage, ChatRequest, ModelProvider, ProviderFactory, Role};
use parley_store::LlmConfigRepository;

use crate::behavior::ActorDeps;
use crate::state::ActorState;

/// Fixed summariser system prompt.
pub const SUMMARY_SYSTEM_PROMPT: &str = "你是一个对话摘要器。请把以下对话浓缩成可供后续继续对话的「记忆摘要」。\n\
要求：\n\
- 保留关键事实、用户偏好、已做决定、待办事项等。\n\
- 去掉寒暄与重复。\n\
- 输出中文，控制在 400~800 字。\n\
- 只输出摘要正文，不要标题。";

/// At most this many history lines go into one summarisation call.
const MAX_SUMMARY_LINES: usize = 80;
/// Per-line content cap, in characters.
const MAX_LINE_CHARS: usize = 1200;

/// Input to one summarisation pass: the formatted lines and the id of the
/// last message they cover.
pub(crate) struct SummaryInput {
    pub lines: Vec<String>,
    pub last_id: Option<String>,
}

/// Format the older history block (everything except the `keep_recent` tail)
/// into `role: content` lines.  Returns `None` when there is not enough
/// older material to be worth condensing.
pub(crate) fn build_summary_input(
    state: &ActorState,
    keep_recent: usize,
    min_older: usize,
) -> Option<SummaryInput> {
    if state.history.len() <= keep_recent {
        return None;
    }
    let older = &state.history[..state.history.len() - keep_recent];
    if older.len() < min_older {
        return None;
    }

    let start = older.len().saturating_sub(MAX_SUMMARY_LINES);
    let mut lines = Vec::new();
    let mut last_id = None;
    for m in &older[start..] {
        if !matches!(m.role, Role::User | Role::Assistant) {
            continue;
        }
        let content = m.content.trim();
        if content.is_empty() {
            continue;
        }
        let content = if content.chars().count() > MAX_LINE_CHARS {
            let mut cut: String = content.chars().take(MAX_LINE_CHARS).collect();
            cut.push('…');
            cut
        } else {
            content.to_string()
        };
        lines.push(format!("{}: {}", m.role.as_str(), content));
        if let Some(id) = &m.message_id {
            last_id = Some(id.clone());
        }
    }

    if lines.is_empty() {
        return None;
    }
    Some(SummaryInput { lines, last_id })
}

/// Run one summarisation pass, keeping the `keep_recent` tail verbatim.
///
/// Returns true when a summary was produced and installed.  Failures are
/// logged and swallowed — a missed summary only costs context room, it must
/// never fail the message being processed.
pub(crate) async fn summarize_memory(
    state: &mut ActorState,
    deps: &ActorDeps,
    agent_id: &str,
    llm_config_id: Option<&str>,
    keep_recent: usize,
    min_older: usize,
) -> bool {
    let Some(config_id) = llm_config_id else {
        debug!(agent_id, "no default LLM config, skipping summarisation");
        return false;
    };
    let config = match deps.configs.find_by_id(config_id).await {
        Ok(Some(config)) => config,
        Ok(None) => {
            warn!(agent_id, config_id, "summary LLM config not found");
            return false;
        }
        Err(e) => {
            warn!(agent_id, config_id, error = %e, "summary LLM config lookup failed");
            return false;
        }
    };

    let Some(input) = build_summary_input(state, keep_recent, min_older) else {
        return false;
    };

    let provider = match deps.providers.create(&config, true) {
        Ok(p) => p,
        Err(e) => {
            warn!(agent_id, error = %e, "summary provider creation failed");
            return false;
        }
    };

    let request = ChatRequest::from_messages(vec![
        ChatMessage::system(SUMMARY_SYSTEM_PROMPT),
        ChatMessage::user(input.lines.join("\n")),
    ]);

    match provider.chat(request).await {
        Ok(resp) => {
            let summary = resp.content.trim().to_string();
            if summary.is_empty() {
                warn!(agent_id, "summariser returned empty content");
                return false;
            }
            info!(agent_id, chars = summary.chars().count(), "memory summarized");
            state.summary = Some(summary);
            state.summary_until = input.last_id;
            true
        }
        Err(e) => {
            warn!(agent_id, error = %e, "summarisation call failed");
            false
        }
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::HistoryEntry;
    use chrono::DateTime;
    use parley_store::SenderType;

    fn seeded_state(n: usize) -> ActorState {
        let mut st = ActorState::new();
        for i in 0..n {
            st.append_entry(HistoryEntry {
                message_id: Some(format!("m{i}")),
                role: if i % 2 == 0 { Role::User } else { Role::Assistant },
                content: format!("第 {i} 条消息"),
                created_at: DateTime::from_timestamp_millis(i as i64).unwrap(),
                sender_id: "u1".into(),
                sender_type: SenderType::User,
                has_media: false,
            });
        }
        st
    }

    #[test]
    fn too_little_history_yields_no_input() {
        let st = seeded_state(10);
        assert!(build_summary_input(&st, 24, 12).is_none());
    }

    #[test]
    fn older_block_excludes_kept_tail() {
        let st = seeded_state(40);
        let input = build_summary_input(&st, 24, 12).unwrap();
        // 40 - 24 kept = 16 older messages
        assert_eq!(input.lines.len(), 16);
        assert_eq!(input.last_id.as_deref(), Some("m15"));
        assert!(input.lines[0].starts_with("user: "));
        assert!(input.lines[1].starts_with("assistant: "));
    }

    #[test]
    fn older_block_capped_at_eighty_lines() {
        let st = seeded_state(200);
        let input = build_summary_input(&st, 24, 12).unwrap();
        assert_eq!(input.lines.len(), MAX_SUMMARY_LINES);
        // Lines come from the newest part of the older block.
        assert_eq!(input.last_id.as_deref(), Some("m175"));
    }

    #[test]
    fn long_lines_are_truncated() {
        let mut st = seeded_state(30);
        st.history[0].content = "长".repeat(5000);
        let input = build_summary_input(&st, 5, 5).unwrap();
        let first = &input.lines[0];
        assert!(first.chars().count() < 1300, "line not truncated: {} chars", first.chars().count());
        assert!(first.ends_with('…'));
    }

    #[test]
    fn keep_five_variant_needs_five_older() {
        let st = seeded_state(9);
        assert!(build_summary_input(&st, 5, 5).is_none());
        let st = seeded_state(10);
        assert!(build_summary_input(&st, 5, 5).is_some());
    }
}
