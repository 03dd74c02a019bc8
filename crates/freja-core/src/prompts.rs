// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: Apache-2.0
//! System prompt assembly.
//!
//! Built once per session (the first run); later runs ride on the stored
//! history and only append the task. Sections with no input are skipped
//! entirely so the prompt never carries empty headings.

use chrono::{DateTime, Utc};

/// Cap applied to each injected project file.
const PROJECT_FILE_CAP: usize = 20_000;

/// Everything the prompt builder may use. All fields optional except the
/// identity; absent inputs skip their section.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    /// Allowed tools: (name, one-line description).
    pub tools: Vec<(String, String)>,
    pub workspace_dir: Option<String>,
    /// Injected on the first run only.
    pub codebase_context: Option<String>,
    /// Advertise the recall tools over the memory index.
    pub memory_recall: bool,
    /// Inject the heartbeat protocol for heartbeat cron sessions.
    pub heartbeat: bool,
    /// Workspace markdown files: (file name, content).
    pub project_files: Vec<(String, String)>,
    pub channel: Option<String>,
    pub now: Option<DateTime<Utc>>,
    pub timezone: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub extra_system_prompt: Option<String>,
}

/// The literal token a heartbeat run answers with when nothing needs
/// attention. Replies consisting only of this token are not delivered.
pub const HEARTBEAT_TOKEN: &str = "HEARTBEAT_OK";

pub fn build_system_prompt(ctx: &PromptContext) -> String {
    let mut sections: Vec<String> = Vec::new();

    sections.push(
        "You are Freja, an autonomous assistant operating inside a multi-session \
         orchestration platform. You complete the task you are given, using tools \
         where they help, and reply with the result."
            .to_string(),
    );

    if !ctx.tools.is_empty() {
        let mut s = String::from("## Tooling\nAvailable tools:\n");
        for (name, description) in &ctx.tools {
            s.push_str(&format!("- {name}: {description}\n"));
        }
        sections.push(s.trim_end().to_string());
    }

    if let Some(dir) = &ctx.workspace_dir {
        sections.push(format!("## Workspace\nWorking directory: {dir}"));
    }

    if let Some(codebase) = &ctx.codebase_context {
        sections.push(format!("## Codebase context\n{codebase}"));
    }

    if ctx.memory_recall {
        sections.push(
            "## Memory recall\nUse the memory search tool to recall notes and prior \
             conversations before asking the user for information they have already given."
                .to_string(),
        );
    }

    if ctx.heartbeat {
        sections.push(format!(
            "## Heartbeat protocol\nThis is a scheduled heartbeat check. If nothing \
             requires attention, reply with exactly `{HEARTBEAT_TOKEN}` and nothing else."
        ));
    }

    for (name, content) in &ctx.project_files {
        let body = head_tail_truncate(content, PROJECT_FILE_CAP);
        sections.push(format!("## Project context: {name}\n{body}"));
    }

    if let Some(channel) = &ctx.channel {
        sections.push(format!(
            "## Channel\nThis conversation arrives via {channel}. Keep replies suited \
             to that medium."
        ));
    }

    if let Some(now) = ctx.now {
        let tz = ctx.timezone.as_deref().unwrap_or("UTC");
        sections.push(format!(
            "## Current date/time\n{} ({tz})",
            now.format("%Y-%m-%d %H:%M:%S")
        ));
    }

    if let (Some(provider), Some(model)) = (&ctx.provider, &ctx.model) {
        sections.push(format!("## Runtime\nProvider: {provider}\nModel: {model}"));
    }

    if let Some(extra) = &ctx.extra_system_prompt {
        sections.push(extra.clone());
    }

    sections.join("\n\n")
}

/// 70/20 head-tail truncation: when `content` exceeds `cap`, keep the
/// leading 70 % and trailing 20 % of the cap with an omission marker
/// between them.
pub fn head_tail_truncate(content: &str, cap: usize) -> String {
    if content.len() <= cap {
        return content.to_string();
    }
    let head_len = cap * 7 / 10;
    let tail_len = cap * 2 / 10;
    let head = floor_boundary(content, head_len);
    let tail = ceil_boundary(content, content.len() - tail_len);
    let omitted = content.len() - head.len() - tail.len();
    format!("{head}\n[... {omitted} chars omitted ...]\n{tail}")
}

fn floor_boundary(s: &str, mut cut: usize) -> &str {
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}

fn ceil_boundary(s: &str, mut cut: usize) -> &str {
    while !s.is_char_boundary(cut) {
        cut += 1;
    }
    &s[cut..]
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_context_yields_identity_only() {
        let prompt = build_system_prompt(&PromptContext::default());
        assert!(prompt.starts_with("You are Freja"));
        assert!(!prompt.contains("## Tooling"));
        assert!(!prompt.contains("## Workspace"));
    }

    #[test]
    fn sections_appear_in_documented_order() {
        let ctx = PromptContext {
            tools: vec![("read_file".into(), "read a file".into())],
            workspace_dir: Some("/work".into()),
            memory_recall: true,
            channel: Some("whatsapp".into()),
            provider: Some("mock".into()),
            model: Some("mock-model".into()),
            ..Default::default()
        };
        let prompt = build_system_prompt(&ctx);
        let tooling = prompt.find("## Tooling").unwrap();
        let workspace = prompt.find("## Workspace").unwrap();
        let memory = prompt.find("## Memory recall").unwrap();
        let channel = prompt.find("## Channel").unwrap();
        let runtime = prompt.find("## Runtime").unwrap();
        assert!(tooling < workspace);
        assert!(workspace < memory);
        assert!(memory < channel);
        assert!(channel < runtime);
    }

    #[test]
    fn heartbeat_section_names_the_token() {
        let ctx = PromptContext { heartbeat: true, ..Default::default() };
        let prompt = build_system_prompt(&ctx);
        assert!(prompt.contains("HEARTBEAT_OK"));
    }

    #[test]
    fn project_files_are_injected_with_their_names() {
        let ctx = PromptContext {
            project_files: vec![("AGENTS.md".into(), "follow the checklist".into())],
            ..Default::default()
        };
        let prompt = build_system_prompt(&ctx);
        assert!(prompt.contains("## Project context: AGENTS.md"));
        assert!(prompt.contains("follow the checklist"));
    }

    #[test]
    fn extra_system_prompt_lands_last() {
        let ctx = PromptContext {
            workspace_dir: Some("/w".into()),
            extra_system_prompt: Some("ALWAYS SAY PLEASE".into()),
            ..Default::default()
        };
        let prompt = build_system_prompt(&ctx);
        assert!(prompt.trim_end().ends_with("ALWAYS SAY PLEASE"));
    }

    // ── head/tail truncation ──────────────────────────────────────────────────

    #[test]
    fn short_content_is_untouched() {
        assert_eq!(head_tail_truncate("short", 100), "short");
    }

    #[test]
    fn long_content_keeps_head_and_tail() {
        let content = format!("{}{}{}", "H".repeat(15_000), "M".repeat(15_000), "T".repeat(5_000));
        let out = head_tail_truncate(&content, 20_000);
        assert!(out.starts_with(&"H".repeat(1_000)));
        assert!(out.ends_with(&"T".repeat(1_000)));
        assert!(out.contains("chars omitted"));
        // 70/20 of the cap: 14k head + 4k tail plus the marker line.
        assert!(out.len() < 19_000);
    }
}
