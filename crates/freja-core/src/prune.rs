// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! Context pruning: the two-tier shrink applied to the working message
//! list just before a model call.
//!
//! Phase 1 (soft-trim) squeezes oversized tool results down to a head and
//! tail excerpt. If the estimate still sits above the hard-clear ratio,
//! phase 2 replaces old tool results outright, oldest first, until the
//! list fits. Both phases are pure: the stored history is never touched,
//! and the last `keep_last_assistants` turns plus everything before the
//! first user message (bootstrap reads) are untouchable.

use std::collections::HashMap;

use freja_model::{estimate_total_chars, Block, ChatMessage, MessageContent, Role};

/// Replacement text for a hard-cleared tool result.
pub const CLEARED_TEXT: &str = "[Tool result cleared — context pruning]";

/// Note appended after a soft-trimmed excerpt.
const TRIMMED_NOTE: &str = "[Tool result trimmed — context pruning]";

// ─── Settings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SoftTrim {
    pub max_chars: usize,
    pub head_chars: usize,
    pub tail_chars: usize,
}

#[derive(Debug, Clone)]
pub struct PruneSettings {
    /// Prune only when estimate / window exceeds this.
    pub soft_trim_ratio: f64,
    /// Phase 2 runs until the estimate drops below this.
    pub hard_clear_ratio: f64,
    /// The most recent N assistant turns (and everything after) are untouchable.
    pub keep_last_assistants: usize,
    pub soft_trim: SoftTrim,
    /// When set, only results of these tools are prunable.
    pub allow_tools: Option<Vec<String>>,
    /// Results of these tools are never pruned.
    pub deny_tools: Vec<String>,
}

impl Default for PruneSettings {
    fn default() -> Self {
        Self {
            soft_trim_ratio: 0.30,
            hard_clear_ratio: 0.50,
            keep_last_assistants: 3,
            soft_trim: SoftTrim { max_chars: 4_000, head_chars: 1_500, tail_chars: 1_500 },
            allow_tools: None,
            deny_tools: Vec::new(),
        }
    }
}

impl From<&freja_config::PruneConfig> for PruneSettings {
    fn from(cfg: &freja_config::PruneConfig) -> Self {
        Self {
            soft_trim_ratio: cfg.soft_trim_ratio,
            hard_clear_ratio: cfg.hard_clear_ratio,
            keep_last_assistants: cfg.keep_last_assistants,
            soft_trim: SoftTrim {
                max_chars: cfg.soft_trim_max_chars,
                head_chars: cfg.soft_trim_head_chars,
                tail_chars: cfg.soft_trim_tail_chars,
            },
            allow_tools: None,
            deny_tools: Vec::new(),
        }
    }
}

// ─── Engine ───────────────────────────────────────────────────────────────────

/// Prune `messages` to fit `context_window` (tokens; 4 chars ≈ 1 token,
/// images a flat 8 000 chars). Returns the list unchanged when the
/// estimate is already under the soft-trim ratio or the window is zero.
pub fn prune_context(
    messages: Vec<ChatMessage>,
    settings: &PruneSettings,
    context_window: usize,
) -> Vec<ChatMessage> {
    if context_window == 0 || messages.is_empty() {
        return messages;
    }
    let budget_chars = (context_window * 4) as f64;
    let ratio = |msgs: &[ChatMessage]| estimate_total_chars(msgs) as f64 / budget_chars;

    if ratio(&messages) < settings.soft_trim_ratio {
        return messages;
    }

    let prunable = prunable_indices(&messages, settings);
    if prunable.is_empty() {
        return messages;
    }

    // Phase 1: soft-trim oversized text results.
    let mut messages = messages;
    for &idx in &prunable {
        soft_trim_message(&mut messages[idx], &settings.soft_trim);
    }
    if ratio(&messages) < settings.hard_clear_ratio {
        return messages;
    }

    // Phase 2: clear, oldest first, until under the hard ratio.
    for &idx in &prunable {
        clear_message(&mut messages[idx]);
        if ratio(&messages) < settings.hard_clear_ratio {
            break;
        }
    }
    messages
}

/// Indices eligible for pruning: tool results between the first user
/// message and the keep-cutoff whose tool passes the allow/deny filter and
/// whose content carries no image.
fn prunable_indices(messages: &[ChatMessage], settings: &PruneSettings) -> Vec<usize> {
    let cutoff = keep_cutoff(messages, settings.keep_last_assistants);
    let prune_start = match messages.iter().position(|m| m.role == Role::User) {
        Some(i) => i,
        None => return Vec::new(),
    };

    // Resolve each result's tool name via the pairing assistant calls.
    let mut names: HashMap<String, String> = HashMap::new();
    for msg in messages {
        for call in msg.tool_calls() {
            names.insert(call.id, call.name);
        }
    }

    (prune_start..cutoff)
        .filter(|&i| {
            let msg = &messages[i];
            msg.role == Role::ToolResult
                && !msg.has_image()
                && msg
                    .tool_result_ids()
                    .iter()
                    .all(|id| tool_passes(names.get(*id).map(String::as_str), settings))
        })
        .collect()
}

/// Position of the n-th-most-recent assistant message. Everything at or
/// after it is untouchable. With fewer assistants than `n`, all of them
/// are protected; with none, nothing is.
fn keep_cutoff(messages: &[ChatMessage], keep_last_assistants: usize) -> usize {
    let assistant_positions: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::Assistant)
        .map(|(i, _)| i)
        .collect();
    if assistant_positions.is_empty() {
        return messages.len();
    }
    let n = keep_last_assistants.min(assistant_positions.len());
    if n == 0 {
        return messages.len();
    }
    assistant_positions[assistant_positions.len() - n]
}

fn tool_passes(name: Option<&str>, settings: &PruneSettings) -> bool {
    if let Some(name) = name {
        if settings.deny_tools.iter().any(|d| d == name) {
            return false;
        }
        if let Some(allow) = &settings.allow_tools {
            return allow.iter().any(|a| a == name);
        }
        return true;
    }
    // Unknown tool (no pairing call in range): only prunable when no
    // allow-list narrows the field.
    settings.allow_tools.is_none()
}

// ─── Rewrites ─────────────────────────────────────────────────────────────────

fn soft_trim_message(msg: &mut ChatMessage, trim: &SoftTrim) {
    rewrite_tool_results(msg, |text| {
        if text.len() <= trim.max_chars {
            return None;
        }
        let head = head_str(&text, trim.head_chars);
        let tail = tail_str(&text, trim.tail_chars);
        Some(format!("{head}\n...\n{tail}\n{TRIMMED_NOTE}"))
    });
}

fn clear_message(msg: &mut ChatMessage) {
    rewrite_tool_results(msg, |_| Some(CLEARED_TEXT.to_string()));
}

/// Apply `f` to the joined text of each tool-result block; `Some` replaces
/// the block content with a single text block, preserving the pairing id
/// and the error flag.
fn rewrite_tool_results(msg: &mut ChatMessage, f: impl Fn(String) -> Option<String>) {
    let blocks = msg.content.to_blocks();
    let rewritten: Vec<Block> = blocks
        .into_iter()
        .map(|b| match b {
            Block::ToolResult { tool_call_id, content, is_error } => {
                let text = content
                    .iter()
                    .filter_map(|inner| match inner {
                        Block::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                match f(text) {
                    Some(replacement) => Block::ToolResult {
                        tool_call_id,
                        content: vec![Block::text(replacement)],
                        is_error,
                    },
                    None => Block::ToolResult { tool_call_id, content, is_error },
                }
            }
            other => other,
        })
        .collect();
    msg.content = MessageContent::Blocks(rewritten);
}

fn head_str(s: &str, n: usize) -> &str {
    if s.len() <= n {
        return s;
    }
    let mut cut = n;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}

fn tail_str(s: &str, n: usize) -> &str {
    if s.len() <= n {
        return s;
    }
    let mut cut = s.len() - n;
    while !s.is_char_boundary(cut) {
        cut += 1;
    }
    &s[cut..]
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_result(name_hint: &str, text: String) -> ChatMessage {
        // The id doubles as a name hint when no assistant call pairs it.
        ChatMessage::tool_result(name_hint, text, false)
    }

    fn scenario_settings() -> PruneSettings {
        PruneSettings {
            soft_trim_ratio: 0.3,
            hard_clear_ratio: 0.5,
            keep_last_assistants: 1,
            soft_trim: SoftTrim { max_chars: 20, head_chars: 5, tail_chars: 5 },
            allow_tools: None,
            deny_tools: Vec::new(),
        }
    }

    // ── Gates ─────────────────────────────────────────────────────────────────

    #[test]
    fn zero_window_returns_input_unchanged() {
        let msgs = vec![
            ChatMessage::user("q"),
            tool_result("read", "X".repeat(500)),
        ];
        let out = prune_context(msgs.clone(), &scenario_settings(), 0);
        assert_eq!(out, msgs);
    }

    #[test]
    fn under_soft_ratio_returns_input_unchanged() {
        let msgs = vec![
            ChatMessage::user("q"),
            tool_result("read", "tiny".into()),
            ChatMessage::assistant("done"),
        ];
        let out = prune_context(msgs.clone(), &PruneSettings::default(), 200_000);
        assert_eq!(out, msgs);
    }

    // ── Soft-trim then hard-clear (window 50 tokens = 200 chars) ──────────────

    #[test]
    fn oversized_results_are_cleared_when_still_over_hard_ratio() {
        let msgs = vec![
            ChatMessage::user("q"),
            tool_result("read", "X".repeat(500)),
            tool_result("write", "Y".repeat(500)),
            ChatMessage::assistant("done"),
        ];
        let out = prune_context(msgs, &scenario_settings(), 50);

        assert_eq!(out.len(), 4);
        assert_eq!(out[0].visible_text(), "q");
        assert_eq!(out[3].visible_text(), "done");
        for idx in [1, 2] {
            match &out[idx].content.to_blocks()[0] {
                Block::ToolResult { content, .. } => {
                    assert_eq!(content, &vec![Block::text(CLEARED_TEXT)]);
                }
                other => panic!("expected tool result, got {other:?}"),
            }
        }
    }

    #[test]
    fn soft_trim_alone_suffices_for_mild_overflow() {
        // A window big enough that trimming drops us under the hard ratio.
        let msgs = vec![
            ChatMessage::user("q"),
            tool_result("read", "A".repeat(600)),
            ChatMessage::assistant("done"),
        ];
        let settings = PruneSettings {
            soft_trim_ratio: 0.3,
            hard_clear_ratio: 0.5,
            keep_last_assistants: 1,
            soft_trim: SoftTrim { max_chars: 100, head_chars: 40, tail_chars: 40 },
            allow_tools: None,
            deny_tools: Vec::new(),
        };
        // 600 chars in a 250-token (1000-char) window: ratio 0.6 ≥ 0.3.
        let out = prune_context(msgs, &settings, 250);
        match &out[1].content.to_blocks()[0] {
            Block::ToolResult { content, .. } => match &content[0] {
                Block::Text { text } => {
                    assert!(text.contains("..."));
                    assert!(text.starts_with(&"A".repeat(40)));
                    assert!(text.contains(TRIMMED_NOTE));
                    assert_ne!(text, CLEARED_TEXT, "soft trim must not hard-clear");
                }
                other => panic!("expected text, got {other:?}"),
            },
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    // ── Protected regions ─────────────────────────────────────────────────────

    #[test]
    fn recent_assistant_turns_are_untouchable() {
        let msgs = vec![
            ChatMessage::user("q"),
            ChatMessage::assistant("old"),
            tool_result("read", "Z".repeat(500)),
            ChatMessage::assistant("latest"),
        ];
        // keep_last_assistants = 2 protects from "old" onward, so the tool
        // result after it survives even under pressure.
        let settings = PruneSettings {
            keep_last_assistants: 2,
            ..scenario_settings()
        };
        let out = prune_context(msgs.clone(), &settings, 50);
        assert_eq!(out[2], msgs[2], "result inside the keep window must survive");
    }

    #[test]
    fn bootstrap_content_before_first_user_is_never_touched() {
        let msgs = vec![
            tool_result("bootstrap", "B".repeat(500)),
            ChatMessage::user("q"),
            tool_result("read", "X".repeat(500)),
            ChatMessage::assistant("done"),
        ];
        let out = prune_context(msgs.clone(), &scenario_settings(), 50);
        assert_eq!(out[0], msgs[0], "pre-user bootstrap reads are protected");
    }

    // ── Filters ───────────────────────────────────────────────────────────────

    #[test]
    fn results_with_images_are_never_mutated() {
        let image_result = ChatMessage::new(
            Role::ToolResult,
            MessageContent::Blocks(vec![Block::ToolResult {
                tool_call_id: "shot".into(),
                content: vec![Block::Image { data: "AAAA".into(), mime_type: "image/png".into() }],
                is_error: false,
            }]),
        );
        let msgs = vec![
            ChatMessage::user("q"),
            image_result.clone(),
            ChatMessage::assistant("done"),
        ];
        let out = prune_context(msgs, &scenario_settings(), 50);
        assert_eq!(out[1], image_result);
    }

    #[test]
    fn deny_listed_tools_are_protected() {
        let msgs = vec![
            ChatMessage::user("q"),
            ChatMessage::assistant_blocks(vec![Block::ToolCall {
                id: "c1".into(),
                name: "memory_get".into(),
                arguments: json!({}),
            }]),
            ChatMessage::tool_result("c1", "M".repeat(500), false),
            ChatMessage::assistant("done"),
        ];
        let settings = PruneSettings {
            deny_tools: vec!["memory_get".into()],
            ..scenario_settings()
        };
        let out = prune_context(msgs.clone(), &settings, 50);
        assert_eq!(out[2], msgs[2]);
    }

    #[test]
    fn allow_list_restricts_pruning_to_named_tools() {
        let msgs = vec![
            ChatMessage::user("q"),
            ChatMessage::assistant_blocks(vec![
                Block::ToolCall { id: "c1".into(), name: "read".into(), arguments: json!({}) },
                Block::ToolCall { id: "c2".into(), name: "exec".into(), arguments: json!({}) },
            ]),
            ChatMessage::tool_result("c1", "R".repeat(500), false),
            ChatMessage::tool_result("c2", "E".repeat(500), false),
            ChatMessage::assistant("done"),
        ];
        let settings = PruneSettings {
            allow_tools: Some(vec!["read".into()]),
            ..scenario_settings()
        };
        let out = prune_context(msgs.clone(), &settings, 50);
        // read (c1) pruned, exec (c2) untouched.
        assert_ne!(out[2], msgs[2]);
        assert_eq!(out[3], msgs[3]);
    }
}
