// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model context-window lookup and token estimation.
//!
//! The actor runtime only needs an order-of-magnitude token count to drive
//! memory budgeting, so the estimator uses the 4-bytes-per-token heuristic
//! throughout.  The window table matches on model-name substrings, most
//! specific first; unknown models fall back to a conservative default.

use crate::types::ChatMessage;

/// Fallback context window for models missing from the table.
pub const DEFAULT_MAX_TOKENS: usize = 8192;

/// `(model-name substring, context window)` — ordered most specific first.
const MODEL_WINDOWS: &[(&str, usize)] = &[
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4.1", 1_000_000),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo-16k", 16_384),
    ("gpt-3.5", 16_384),
    ("o1", 128_000),
    ("o3", 200_000),
    ("claude", 200_000),
    ("gemini-1.5", 1_000_000),
    ("gemini", 128_000),
    ("deepseek", 64_000),
    ("qwen", 32_768),
    ("glm", 128_000),
];

/// Context window for `model`, with a default fallback for unknown names.
pub fn model_max_tokens(model: &str) -> usize {
    let lower = model.to_lowercase();
    for (needle, window) in MODEL_WINDOWS {
        if lower.contains(needle) {
            return *window;
        }
    }
    DEFAULT_MAX_TOKENS
}

/// Approximate token count of a text: 4 bytes per token, minimum 1 for
/// non-empty input.
pub fn estimate_text_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.len() / 4).max(1)
}

/// Approximate token count of a message list, including a small per-message
/// framing overhead.
pub fn estimate_messages_tokens(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .map(|m| estimate_text_tokens(&m.content) + 4)
        .sum()
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_uses_table_window() {
        assert_eq!(model_max_tokens("gpt-4"), 8_192);
        assert_eq!(model_max_tokens("gpt-4o-mini"), 128_000);
        assert_eq!(model_max_tokens("claude-sonnet-4"), 200_000);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(model_max_tokens("GPT-4"), 8_192);
    }

    #[test]
    fn unknown_model_falls_back_to_default() {
        assert_eq!(model_max_tokens("my-local-llm"), DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn more_specific_prefix_wins() {
        // "gpt-4-turbo" must not match the bare "gpt-4" entry first
        assert_eq!(model_max_tokens("gpt-4-turbo-2024"), 128_000);
    }

    #[test]
    fn empty_text_is_zero_tokens() {
        assert_eq!(estimate_text_tokens(""), 0);
    }

    #[test]
    fn short_text_is_at_least_one_token() {
        assert_eq!(estimate_text_tokens("ab"), 1);
    }

    #[test]
    fn messages_estimate_includes_framing_overhead() {
        let msgs = vec![ChatMessage::user("12345678")]; // 2 tokens + 4 framing
        assert_eq!(estimate_messages_tokens(&msgs), 6);
    }
}
