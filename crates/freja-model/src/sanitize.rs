// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! History hygiene: the pure passes that make a stored session history
//! acceptable to a model provider.
//!
//! Providers enforce two invariants the append-only log cannot guarantee on
//! its own: every tool call must be answered by a matching tool result
//! before the next assistant turn, and adjacent messages must not share a
//! role (tool results excepted, they are keyed by call id). Compaction and
//! crash recovery can violate both; [`sanitize_history`] repairs the list
//! before every model call without ever touching the stored log.

use crate::types::{Block, ChatMessage, MessageContent, Role};

/// Text substituted for a tool result that was lost (typically summarized
/// away during compaction).
pub const LOST_RESULT_TEXT: &str = "[result lost during session compaction]";

/// Session kinds that count as messaging channels for history limiting.
const CHANNEL_KINDS: &[&str] = &[
    "whatsapp", "telegram", "discord", "signal", "matrix", "irc", "slack",
];

// ─── History limit ────────────────────────────────────────────────────────────

/// User-turn limits per session kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLimits {
    pub cron_turns: usize,
    pub channel_turns: usize,
    pub default_turns: usize,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self { cron_turns: 10, channel_turns: 30, default_turns: 50 }
    }
}

/// Number of user turns to keep for a session key, by kind prefix, with
/// the default limits.
///
/// Subagent keys inherit the limit of their root session (the part before
/// `:subagent:`).
pub fn history_limit_for_key(key: &str) -> usize {
    history_limit_for_key_with(key, &HistoryLimits::default())
}

/// Like [`history_limit_for_key`] with operator-tuned limits.
pub fn history_limit_for_key_with(key: &str, limits: &HistoryLimits) -> usize {
    let root = match key.find(":subagent:") {
        Some(pos) => &key[..pos],
        None => key,
    };
    let kind = root.split(':').next().unwrap_or(root);
    if kind == "cron" {
        limits.cron_turns
    } else if CHANNEL_KINDS.contains(&kind) {
        limits.channel_turns
    } else {
        limits.default_turns
    }
}

/// Trim to the last `n` user turns: everything from the n-th-last user
/// message onward is kept. `n == 0` disables the limit.
pub fn limit_history_turns(messages: Vec<ChatMessage>, n: usize) -> Vec<ChatMessage> {
    if n == 0 || messages.is_empty() {
        return messages;
    }
    let user_positions: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::User)
        .map(|(i, _)| i)
        .collect();
    if user_positions.len() <= n {
        return messages;
    }
    let cutoff = user_positions[user_positions.len() - n];
    messages.into_iter().skip(cutoff).collect()
}

// ─── Tool-call / tool-result pairing ──────────────────────────────────────────

/// Re-pair tool calls with their results.
///
/// Walks forward tracking the open tool-call ids contributed by the most
/// recent assistant turn. Tool results answering an open id are kept (and
/// close it); orphan results are dropped. Any id still open when the next
/// non-tool-result message arrives (or at end of history) is padded with
/// a synthetic error result so the provider sees a complete pairing.
pub fn repair_tool_pairing(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    let mut open: Vec<String> = Vec::new();

    for msg in messages {
        if msg.role == Role::ToolResult {
            let kept = retain_open_results(msg, &mut open);
            if let Some(kept) = kept {
                out.push(kept);
            }
            continue;
        }
        pad_open(&mut out, &mut open);
        if msg.role == Role::Assistant {
            open = msg.tool_calls().into_iter().map(|c| c.id).collect();
        }
        out.push(msg);
    }
    pad_open(&mut out, &mut open);
    out
}

/// Keep only the tool-result blocks that answer an open id; drop the
/// message entirely when none survive.
fn retain_open_results(msg: ChatMessage, open: &mut Vec<String>) -> Option<ChatMessage> {
    let blocks = msg.content.to_blocks();
    let kept: Vec<Block> = blocks
        .into_iter()
        .filter(|b| match b {
            Block::ToolResult { tool_call_id, .. } => {
                match open.iter().position(|id| id == tool_call_id) {
                    Some(pos) => {
                        open.remove(pos);
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        })
        .collect();
    if kept.is_empty() {
        return None;
    }
    Some(ChatMessage {
        content: MessageContent::Blocks(kept),
        ..msg
    })
}

fn pad_open(out: &mut Vec<ChatMessage>, open: &mut Vec<String>) {
    for id in open.drain(..) {
        out.push(ChatMessage::tool_result(id, LOST_RESULT_TEXT, true));
    }
}

// ─── Consecutive-role merge ───────────────────────────────────────────────────

/// Merge adjacent messages that share a role, except tool results (keyed
/// by call id, they must stay separate). Content arrays are concatenated
/// into the earlier message.
pub fn merge_consecutive_roles(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        match out.last_mut() {
            Some(prev) if prev.role == msg.role && msg.role != Role::ToolResult => {
                let mut blocks = prev.content.to_blocks();
                blocks.extend(msg.content.to_blocks());
                prev.content = MessageContent::Blocks(blocks);
            }
            _ => out.push(msg),
        }
    }
    out
}

// ─── Combined pass ────────────────────────────────────────────────────────────

/// The full hygiene pass in the order the runtime applies it:
/// limit by session kind → repair pairing → merge roles.
pub fn sanitize_history(session_key: &str, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    sanitize_history_with(session_key, messages, &HistoryLimits::default())
}

/// [`sanitize_history`] with operator-tuned turn limits.
pub fn sanitize_history_with(
    session_key: &str,
    messages: Vec<ChatMessage>,
    limits: &HistoryLimits,
) -> Vec<ChatMessage> {
    let limit = history_limit_for_key_with(session_key, limits);
    let limited = limit_history_turns(messages, limit);
    merge_consecutive_roles(repair_tool_pairing(limited))
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
