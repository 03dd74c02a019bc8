// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: Apache-2.0
//! Hierarchical compaction: replace older turns with a short summary so
//! the conversation keeps fitting the model window.
//!
//! The engine is the single summarization path in the platform. It folds
//! history through the model in token-bounded chunks, stages the work into
//! near-equal partitions merged at the end, peels off the oldest half when
//! the history alone would crowd the window, excludes single messages too
//! large to summarize, and degrades to a deterministic fallback when the
//! model is unavailable. Tool failures seen in the summarized range are
//! carried into the summary as structured metadata.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use freja_model::{Block, ChatMessage, CompletionRequest, MessageContent, ModelProvider, Role};

/// Returned when the model could not produce any summary.
pub const FALLBACK_SUMMARY: &str =
    "Summary unavailable due to context limits. Older messages were truncated.";

const FAILURE_HEADING: &str = "## Tool Failures";
const MAX_FAILURE_LINES: usize = 8;
const FAILURE_CHARS: usize = 240;

// ─── Prompts ──────────────────────────────────────────────────────────────────

const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve technical details, decisions, file names, \
     and tool outcomes that future turns may rely on. The summary replaces the original \
     history.";

const FOLD_PROMPT: &str =
    "You are a context compaction assistant. Below is the summary so far, followed by the \
     next span of conversation history. Produce an updated summary that folds the new span \
     into the existing one without losing established facts.";

const MERGE_PROMPT: &str =
    "You are a context compaction assistant. Merge the following partial summaries into one. \
     Preserve decisions, TODOs, open questions, and constraints.";

// ─── Interfaces ───────────────────────────────────────────────────────────────

/// The single model call shape compaction needs.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Adapter driving a [`ModelProvider`] as a summarizer: one tool-free
/// user turn, visible text out.
pub struct ProviderSummarizer {
    provider: Arc<dyn ModelProvider>,
}

impl ProviderSummarizer {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Summarizer for ProviderSummarizer {
    async fn summarize(&self, prompt: &str) -> anyhow::Result<String> {
        let response = self
            .provider
            .complete(CompletionRequest {
                system: None,
                messages: vec![ChatMessage::user(prompt)],
                tools: vec![],
            })
            .await?;
        let text = ChatMessage::new(Role::Assistant, MessageContent::Blocks(response.blocks))
            .visible_text();
        if text.trim().is_empty() {
            anyhow::bail!("summarizer returned no text");
        }
        Ok(text)
    }
}

// ─── Settings / request / outcome ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CompactionSettings {
    /// Starting chunk size as a fraction of the context window.
    pub chunk_ratio: f64,
    /// Floor the adaptive ratio never shrinks below.
    pub min_chunk_ratio: f64,
    /// Number of near-equal partitions summarized independently.
    pub parts: usize,
    /// Fraction of the window history may occupy before the oldest half is
    /// peeled into its own pass.
    pub max_history_share: f64,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            chunk_ratio: 0.40,
            min_chunk_ratio: 0.15,
            parts: 2,
            max_history_share: 0.5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompactionRequest {
    /// The range being folded into the summary.
    pub messages: Vec<ChatMessage>,
    /// The turn currently in progress (kept verbatim; informs nothing yet
    /// beyond accounting, but callers pass it for the boundary).
    pub turn_prefix: Vec<ChatMessage>,
    pub previous_summary: Option<String>,
    /// Context window in tokens.
    pub context_window: usize,
}

#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub summary: String,
    /// Boundary: how many of `messages` the summary replaces. Entries from
    /// this index on are kept verbatim by the caller.
    pub first_kept_index: usize,
}

// ─── Engine ───────────────────────────────────────────────────────────────────

pub struct CompactionEngine {
    summarizer: Arc<dyn Summarizer>,
    settings: CompactionSettings,
}

impl CompactionEngine {
    pub fn new(summarizer: Arc<dyn Summarizer>, settings: CompactionSettings) -> Self {
        Self { summarizer, settings }
    }

    /// Compact `request.messages` into a replacement summary string.
    ///
    /// Never fails: when the model is unreachable at every stage the
    /// outcome carries [`FALLBACK_SUMMARY`] plus the tool-failure block.
    pub async fn compact(&self, request: CompactionRequest) -> CompactionOutcome {
        let failure_lines = tool_failure_lines(&request.messages);
        let boundary = request.messages.len();

        if request.messages.is_empty() {
            return CompactionOutcome {
                summary: append_failures(
                    request.previous_summary.unwrap_or_default(),
                    &failure_lines,
                ),
                first_kept_index: 0,
            };
        }
        let window = request.context_window.max(1);

        // Exclude messages too large to summarize at all.
        let mut omitted_notes: Vec<String> = Vec::new();
        let mut messages: Vec<ChatMessage> = Vec::with_capacity(request.messages.len());
        for msg in &request.messages {
            let tokens = msg.estimate_tokens();
            if tokens as f64 * 1.2 > window as f64 * 0.5 {
                omitted_notes.push(format!(
                    "[Large {} (~{}K tokens) omitted from summary]",
                    role_name(msg.role),
                    (tokens + 500) / 1000
                ));
            } else {
                messages.push(msg.clone());
            }
        }

        let max_chunk = self.adaptive_max_chunk(&messages, window);

        // History-share guard: peel the oldest half into its own pass so
        // the main pass never has to swallow more than the window allows.
        let mut previous = request.previous_summary.clone();
        let mut partial_note: Option<&str> = None;
        let total_tokens: usize = messages.iter().map(ChatMessage::estimate_tokens).sum();
        if total_tokens as f64 > window as f64 * self.settings.max_history_share * 1.2
            && messages.len() >= 2
        {
            let dropped: Vec<ChatMessage> = messages.drain(..messages.len() / 2).collect();
            match self.summarize_stage(&dropped, previous.as_deref(), max_chunk).await {
                Ok(summary) => previous = Some(summary),
                Err(e) => {
                    warn!("dropped-partition summary failed: {e}");
                    partial_note =
                        Some("[An earlier portion of the history could not be summarized and was dropped.]");
                }
            }
        }

        let body = match self.summarize_staged(&messages, previous.as_deref(), max_chunk).await {
            Ok(summary) => Some(summary),
            Err(first) => {
                warn!("compaction pass failed, retrying once: {first}");
                match self.summarize_staged(&messages, previous.as_deref(), max_chunk).await {
                    Ok(summary) => Some(summary),
                    Err(second) => {
                        warn!("compaction retry failed: {second}");
                        None
                    }
                }
            }
        };

        let mut summary = body.unwrap_or_else(|| FALLBACK_SUMMARY.to_string());
        for note in &omitted_notes {
            summary.push_str("\n\n");
            summary.push_str(note);
        }
        if let Some(note) = partial_note {
            summary.push_str("\n\n");
            summary.push_str(note);
        }

        CompactionOutcome {
            summary: append_failures(summary, &failure_lines),
            first_kept_index: boundary,
        }
    }

    /// Shrink the chunk ratio from its default toward the floor when the
    /// average message is large relative to the window, then convert to a
    /// token cap.
    fn adaptive_max_chunk(&self, messages: &[ChatMessage], window: usize) -> usize {
        let count = messages.len().max(1);
        let total: usize = messages.iter().map(ChatMessage::estimate_tokens).sum();
        let avg = (total / count) as f64;
        let mut ratio = self.settings.chunk_ratio;
        let per_chunk_budget = 0.1 * window as f64;
        if avg * 1.2 > per_chunk_budget && avg > 0.0 {
            let factor = per_chunk_budget / (avg * 1.2);
            ratio = (self.settings.chunk_ratio * factor)
                .clamp(self.settings.min_chunk_ratio, self.settings.chunk_ratio);
        }
        ((window as f64 * ratio) as usize).max(1)
    }

    /// Staged pass: split into near-equal token-weighted partitions,
    /// summarize each (the first continues `previous`), then merge.
    async fn summarize_staged(
        &self,
        messages: &[ChatMessage],
        previous: Option<&str>,
        max_chunk: usize,
    ) -> anyhow::Result<String> {
        if messages.is_empty() {
            return Ok(previous.unwrap_or_default().to_string());
        }
        let partitions = split_by_tokens(messages, self.settings.parts.max(1));
        let mut partials = Vec::with_capacity(partitions.len());
        for (i, part) in partitions.iter().enumerate() {
            let prev = if i == 0 { previous } else { None };
            partials.push(self.summarize_stage(part, prev, max_chunk).await?);
        }
        if partials.len() == 1 {
            return Ok(partials.pop().unwrap_or_default());
        }

        let merge_input = partials
            .iter()
            .enumerate()
            .map(|(i, p)| format!("### Part {}\n{p}", i + 1))
            .collect::<Vec<_>>()
            .join("\n\n");
        match self.summarizer.summarize(&format!("{MERGE_PROMPT}\n\n{merge_input}")).await {
            Ok(merged) if !merged.trim().is_empty() => Ok(merged),
            Ok(_) | Err(_) => {
                // Merge is best-effort; the partials are already summaries.
                Ok(partials.join("\n\n"))
            }
        }
    }

    /// One stage: fold consecutive token-bounded chunks through the model,
    /// each call seeing the prior summary plus the next span.
    async fn summarize_stage(
        &self,
        messages: &[ChatMessage],
        previous: Option<&str>,
        max_chunk: usize,
    ) -> anyhow::Result<String> {
        let mut summary: Option<String> = previous.map(str::to_string);
        for chunk in chunk_by_tokens(messages, max_chunk) {
            let history = render_history(chunk);
            let prompt = match &summary {
                Some(prior) => format!(
                    "{FOLD_PROMPT}\n\n## Summary so far\n{prior}\n\n## Next span\n{history}"
                ),
                None => format!("{SUMMARIZE_PROMPT}\n\n---\n\n{history}"),
            };
            let folded = self.summarizer.summarize(&prompt).await?;
            if folded.trim().is_empty() {
                anyhow::bail!("summarizer returned an empty summary");
            }
            summary = Some(folded);
        }
        Ok(summary.unwrap_or_default())
    }
}

// ─── Partitioning ─────────────────────────────────────────────────────────────

/// Split into at most `parts` partitions of near-equal token weight.
fn split_by_tokens(messages: &[ChatMessage], parts: usize) -> Vec<Vec<ChatMessage>> {
    if messages.is_empty() {
        return Vec::new();
    }
    let total: usize = messages.iter().map(ChatMessage::estimate_tokens).sum();
    let target = (total / parts).max(1);
    let mut partitions: Vec<Vec<ChatMessage>> = vec![Vec::new()];
    let mut current = 0usize;
    for msg in messages {
        let tokens = msg.estimate_tokens();
        let last_partition = partitions.len() == parts;
        if current >= target && !last_partition && !partitions.last().unwrap().is_empty() {
            partitions.push(Vec::new());
            current = 0;
        }
        current += tokens;
        partitions.last_mut().unwrap().push(msg.clone());
    }
    partitions.retain(|p| !p.is_empty());
    partitions
}

/// Consecutive chunks each at most `max_tokens` (a single message larger
/// than the cap still forms its own chunk).
fn chunk_by_tokens(messages: &[ChatMessage], max_tokens: usize) -> Vec<&[ChatMessage]> {
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut current = 0usize;
    for (i, msg) in messages.iter().enumerate() {
        let tokens = msg.estimate_tokens();
        if current > 0 && current + tokens > max_tokens {
            chunks.push(&messages[start..i]);
            start = i;
            current = 0;
        }
        current += tokens;
    }
    if start < messages.len() {
        chunks.push(&messages[start..]);
    }
    chunks
}

// ─── Rendering ────────────────────────────────────────────────────────────────

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user message",
        Role::Assistant => "assistant message",
        Role::System => "system message",
        Role::ToolResult => "tool result",
    }
}

/// Plain-text rendering of a history span for a compaction prompt.
fn render_history(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
                Role::ToolResult => "Tool",
            };
            let mut text = m.visible_text();
            for call in m.tool_calls() {
                text.push_str(&format!("\n[tool_call: {}({})]", call.name, call.arguments));
            }
            if m.role == Role::ToolResult {
                let inner = tool_result_text(m);
                text = format!("[tool_result: {inner}]");
            }
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn tool_result_text(msg: &ChatMessage) -> String {
    msg.content
        .to_blocks()
        .iter()
        .filter_map(|b| match b {
            Block::ToolResult { content, .. } => Some(
                content
                    .iter()
                    .filter_map(|inner| match inner {
                        Block::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Tool-failure metadata ────────────────────────────────────────────────────

/// Render every errored tool result in `messages` as a metadata line,
/// deduplicated by call id, capped at [`MAX_FAILURE_LINES`] with an
/// overflow marker.
fn tool_failure_lines(messages: &[ChatMessage]) -> Vec<String> {
    let mut names: HashMap<String, String> = HashMap::new();
    for msg in messages {
        for call in msg.tool_calls() {
            names.insert(call.id, call.name);
        }
    }

    let mut seen: Vec<String> = Vec::new();
    let mut lines: Vec<String> = Vec::new();
    for msg in messages {
        for block in msg.content.to_blocks() {
            let Block::ToolResult { tool_call_id, content, is_error } = block else {
                continue;
            };
            if !is_error || seen.contains(&tool_call_id) {
                continue;
            }
            seen.push(tool_call_id.clone());
            let name = names
                .get(&tool_call_id)
                .map(String::as_str)
                .unwrap_or("tool");
            let raw = content
                .iter()
                .filter_map(|b| match b {
                    Block::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(" ");
            lines.push(format!("- {name}: {}", clip_single_spaced(&raw, FAILURE_CHARS)));
        }
    }

    if lines.len() > MAX_FAILURE_LINES {
        let extra = lines.len() - MAX_FAILURE_LINES;
        lines.truncate(MAX_FAILURE_LINES);
        lines.push(format!("...and {extra} more"));
    }
    lines
}

fn append_failures(body: String, lines: &[String]) -> String {
    if lines.is_empty() {
        return body;
    }
    format!("{body}\n\n{FAILURE_HEADING}\n{}", lines.join("\n"))
}

/// Collapse whitespace runs to single spaces, then keep the first `max`
/// characters.
fn clip_single_spaced(text: &str, max: usize) -> String {
    let spaced = text.split_whitespace().collect::<Vec<_>>().join(" ");
    spaced.chars().take(max).collect()
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
