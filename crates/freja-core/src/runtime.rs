// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: Apache-2.0
//! The agent runtime loop: one inbound task in, one delivered reply out.
//!
//! For every run the loop serializes on the session queue, sanitizes the
//! stored history, prunes it to fit the window, drives the model ↔ tool
//! cycle, auto-compacts when the conversation outgrows its budget, and
//! persists every turn append-only. Lifecycle events stream over a single
//! broadcast; consumers self-filter by run id.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use async_trait::async_trait;
use freja_model::{
    sanitize::{sanitize_history_with, HistoryLimits},
    Block, ChatMessage, CompletionRequest, MessageContent, ModelProvider, Role, ToolSpec,
};
use freja_store::{ensure_session, GetMessages, SessionStore};

use crate::compact::{
    CompactionEngine, CompactionRequest, CompactionSettings, ProviderSummarizer,
};
use crate::errors::classify_model_error;
use crate::events::{LifecyclePhase, RunEvent, ToolPhase};
use crate::prompts::{build_system_prompt, PromptContext};
use crate::prune::{prune_context, PruneSettings};
use crate::queue::{QueueError, SessionQueue};

/// Task used when a session carries no message tagged `metadata.type=task`.
pub const DEFAULT_TASK: &str = "Complete your assigned task.";

/// Tools withheld from subagent sessions.
const SUBAGENT_DENIED_TOOLS: &[&str] = &[
    "sessions_list",
    "sessions_history",
    "sessions_send",
    "sessions_spawn",
];

/// Subagent sessions: key contains `:subagent:` or starts with `agent:`.
pub fn is_subagent_key(key: &str) -> bool {
    key.contains(":subagent:") || key.starts_with("agent:")
}

// ─── Tool dispatch boundary ───────────────────────────────────────────────────

/// What a tool invocation gets to know about its caller.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub session_key: String,
    pub workspace_dir: Option<String>,
}

/// The structured result of a tool body.
#[derive(Debug, Clone)]
pub struct ToolResultPayload {
    pub content: Vec<Block>,
    pub is_error: bool,
}

impl ToolResultPayload {
    pub fn text(text: impl Into<String>, is_error: bool) -> Self {
        Self { content: vec![Block::text(text)], is_error }
    }
}

/// The dispatch contract the runtime uses to reach tool bodies. In the
/// assembled platform this is backed by a gateway call to the tools
/// service, which breaks the runtime ↔ tools ↔ services cycle.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn list(&self) -> anyhow::Result<Vec<ToolSpec>>;
    async fn execute(
        &self,
        name: &str,
        arguments: Value,
        invocation: ToolInvocation,
    ) -> anyhow::Result<ToolResultPayload>;
}

// ─── Run configuration & outcome ──────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub session_key: String,
    pub workspace_dir: Option<String>,
    pub channel: Option<String>,
    /// Inbound images attached to the task turn.
    pub images: Vec<Block>,
    /// Workspace markdown files injected into the first-run system prompt.
    pub project_files: Vec<(String, String)>,
    pub extra_system_prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub reply: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The queued task was discarded before it started.
    #[error("QUEUE_CLEARED")]
    QueueCleared,
    /// Provider failure, already classified into a user-facing sentence.
    #[error("{0}")]
    Model(String),
    #[error("The model produced no user-facing reply.")]
    EmptyResponse,
    #[error("The run was aborted: {0}")]
    Aborted(String),
    /// Store or bus failure; the run cannot continue.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl RunError {
    /// The sentence the agent service puts in front of users.
    pub fn user_message(&self) -> String {
        match self {
            Self::Fatal(e) => format!("An internal error interrupted the run: {e}"),
            other => other.to_string(),
        }
    }
}

// ─── Runtime ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub prune: PruneSettings,
    pub history: HistoryLimits,
    pub compaction: CompactionSettings,
    /// Fraction of the window that triggers auto-compaction.
    pub compaction_threshold: f64,
    /// Recent messages kept verbatim through a compaction.
    pub compaction_keep_recent: usize,
    pub max_tool_rounds: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            prune: PruneSettings::default(),
            history: HistoryLimits::default(),
            compaction: CompactionSettings::default(),
            compaction_threshold: 0.8,
            compaction_keep_recent: 8,
            max_tool_rounds: 32,
        }
    }
}

pub struct Runtime {
    store: Arc<dyn SessionStore>,
    provider: Arc<dyn ModelProvider>,
    tools: Arc<dyn ToolDispatcher>,
    queue: Arc<SessionQueue>,
    engine: CompactionEngine,
    settings: RuntimeSettings,
    events: broadcast::Sender<RunEvent>,
    aborts: Mutex<HashMap<String, CancellationToken>>,
    abort_reasons: Mutex<HashMap<String, String>>,
}

impl Runtime {
    pub fn new(
        store: Arc<dyn SessionStore>,
        provider: Arc<dyn ModelProvider>,
        tools: Arc<dyn ToolDispatcher>,
        settings: RuntimeSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let engine = CompactionEngine::new(
            Arc::new(ProviderSummarizer::new(Arc::clone(&provider))),
            settings.compaction.clone(),
        );
        Self {
            store,
            provider,
            tools,
            queue: Arc::new(SessionQueue::new()),
            engine,
            settings,
            events,
            aborts: Mutex::new(HashMap::new()),
            abort_reasons: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue(&self) -> &Arc<SessionQueue> {
        &self.queue
    }

    /// Subscribe to the lifecycle fan-out for all runs.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Cancel an in-flight run. Propagates into the model call and any
    /// in-flight tool; the loop then emits `lifecycle{phase:abort}`.
    pub async fn abort_run(&self, run_id: &str, reason: &str) -> bool {
        self.abort_reasons
            .lock()
            .await
            .insert(run_id.to_string(), reason.to_string());
        match self.aborts.lock().await.get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run one inbound task to completion, serialized per session key.
    pub async fn run(&self, config: RunConfig) -> Result<RunOutcome, RunError> {
        let run_id = new_run_id();
        let token = CancellationToken::new();
        self.aborts
            .lock()
            .await
            .insert(run_id.clone(), token.clone());

        let session_key = config.session_key.clone();
        let result = self
            .queue
            .run(&session_key, async {
                self.execute(&run_id, &config, &token)
                    .await
                    .map_err(anyhow::Error::from)
            })
            .await;

        self.aborts.lock().await.remove(&run_id);
        self.abort_reasons.lock().await.remove(&run_id);

        match result {
            Ok(outcome) => Ok(outcome),
            Err(QueueError::Cleared) => Err(RunError::QueueCleared),
            Err(QueueError::Task(e)) => Err(match e.downcast::<RunError>() {
                Ok(run_error) => run_error,
                Err(other) => RunError::Fatal(other),
            }),
        }
    }

    /// Run a child session on behalf of `parent_key`, then append the
    /// completion note to the parent history.
    pub async fn spawn_subagent(
        &self,
        parent_key: &str,
        task: &str,
    ) -> Result<RunOutcome, RunError> {
        let child_key = format!("{parent_key}:subagent:{}", Utc::now().timestamp_millis());
        ensure_session(self.store.as_ref(), &child_key, None)
            .await
            .context("creating subagent session")?;
        self.store
            .add_message(
                &child_key,
                ChatMessage::user(task).with_metadata(json!({"type": "task"})),
            )
            .await
            .context("seeding subagent task")?;

        let result = self
            .run(RunConfig { session_key: child_key.clone(), ..Default::default() })
            .await;

        let (status, text) = match &result {
            Ok(outcome) => ("completed", outcome.reply.clone()),
            Err(e) => ("failed", e.user_message()),
        };
        let snippet: String = text.chars().take(500).collect();
        let note = format!(
            "## Sub-agent Complete\n**Session:** {child_key}\n**Status:** {status}\n**Result:** {snippet}"
        );
        if let Err(e) = self.store.add_message(parent_key, ChatMessage::system(note)).await {
            warn!(parent = %parent_key, "could not record subagent completion: {e}");
        }
        result
    }

    // ── The loop ──────────────────────────────────────────────────────────────

    async fn execute(
        &self,
        run_id: &str,
        config: &RunConfig,
        token: &CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        let key = &config.session_key;
        self.emit(RunEvent::lifecycle(run_id, key, LifecyclePhase::Start, None, None));
        info!(run = %run_id, session = %key, "run started");

        let stored = self
            .store
            .get_messages(key, GetMessages::default())
            .await
            .context("reading session history")?;
        let first_run = !stored.iter().any(|m| m.role == Role::Assistant);
        let task = stored
            .iter()
            .rev()
            .find(|m| m.metadata_type() == Some("task"))
            .map(|m| m.visible_text())
            .unwrap_or_else(|| DEFAULT_TASK.to_string());

        let mut working = sanitize_history_with(key, stored, &self.settings.history);
        if working.is_empty() {
            working.push(ChatMessage::user(task.clone()));
        }
        if !config.images.is_empty() {
            attach_images(&mut working, &config.images);
        }

        let subagent = is_subagent_key(key);
        let mut specs = self.tools.list().await.context("listing tools")?;
        if subagent {
            specs.retain(|s| !SUBAGENT_DENIED_TOOLS.contains(&s.name.as_str()));
        }

        let system = if first_run {
            Some(build_system_prompt(&PromptContext {
                tools: specs
                    .iter()
                    .map(|s| (s.name.clone(), s.description.clone()))
                    .collect(),
                workspace_dir: config.workspace_dir.clone(),
                codebase_context: None,
                memory_recall: specs.iter().any(|s| s.name.starts_with("memory_")),
                heartbeat: key.starts_with("cron:") && task.contains(crate::prompts::HEARTBEAT_TOKEN),
                project_files: config.project_files.clone(),
                channel: config.channel.clone(),
                now: Some(Utc::now()),
                timezone: None,
                provider: Some(self.provider.name().to_string()),
                model: Some(self.provider.model().to_string()),
                extra_system_prompt: config.extra_system_prompt.clone(),
            }))
        } else {
            None
        };

        let window = self.provider.context_window();
        let mut input_tokens = 0u32;
        let mut output_tokens = 0u32;

        for _round in 0..self.settings.max_tool_rounds {
            self.maybe_compact(&mut working, run_id, key, window).await;
            working = prune_context(working, &self.settings.prune, window);

            let request = CompletionRequest {
                system: system.clone(),
                messages: working.clone(),
                tools: specs.clone(),
            };
            let response = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(self.aborted(run_id, key).await),
                r = self.provider.complete(request) => r,
            }
            .map_err(|e| {
                let friendly = classify_model_error(&e.to_string());
                self.emit(RunEvent::lifecycle(
                    run_id,
                    key,
                    LifecyclePhase::Error,
                    Some(friendly.clone()),
                    None,
                ));
                RunError::Model(friendly)
            })?;
            input_tokens += response.usage.input_tokens;
            output_tokens += response.usage.output_tokens;

            let assistant =
                ChatMessage::new(Role::Assistant, MessageContent::Blocks(response.blocks));
            self.store
                .add_message(key, assistant.clone())
                .await
                .context("persisting assistant turn")?;
            working.push(assistant.clone());

            let calls = assistant.tool_calls();
            if calls.is_empty() {
                let reply = assistant.visible_text();
                if reply.trim().is_empty() {
                    self.emit(RunEvent::lifecycle(
                        run_id,
                        key,
                        LifecyclePhase::Error,
                        Some(RunError::EmptyResponse.to_string()),
                        None,
                    ));
                    return Err(RunError::EmptyResponse);
                }
                self.emit(RunEvent::Assistant {
                    run_id: run_id.to_string(),
                    session_key: key.to_string(),
                    text: reply.clone(),
                    timestamp: Utc::now(),
                });
                self.emit(RunEvent::lifecycle(
                    run_id,
                    key,
                    LifecyclePhase::End,
                    None,
                    Some(u64::from(input_tokens + output_tokens)),
                ));
                info!(run = %run_id, session = %key, "run complete");
                return Ok(RunOutcome {
                    run_id: run_id.to_string(),
                    reply,
                    input_tokens,
                    output_tokens,
                });
            }

            for call in calls {
                self.emit(RunEvent::Tool {
                    run_id: run_id.to_string(),
                    session_key: key.to_string(),
                    tool: call.name.clone(),
                    call_id: call.id.clone(),
                    phase: ToolPhase::Start,
                    is_error: None,
                    timestamp: Utc::now(),
                });

                let payload = if subagent && SUBAGENT_DENIED_TOOLS.contains(&call.name.as_str())
                {
                    ToolResultPayload::text(
                        format!("Permission denied: {} is not available to subagents", call.name),
                        true,
                    )
                } else {
                    let invocation = ToolInvocation {
                        session_key: key.clone(),
                        workspace_dir: config.workspace_dir.clone(),
                    };
                    let executed = tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(self.aborted(run_id, key).await),
                        r = self.tools.execute(&call.name, call.arguments.clone(), invocation) => r,
                    };
                    // A failing tool stays in history as an error result so
                    // the model can react; it never fails the run.
                    executed.unwrap_or_else(|e| {
                        ToolResultPayload::text(format!("tool error: {e}"), true)
                    })
                };

                self.emit(RunEvent::Tool {
                    run_id: run_id.to_string(),
                    session_key: key.to_string(),
                    tool: call.name.clone(),
                    call_id: call.id.clone(),
                    phase: ToolPhase::End,
                    is_error: Some(payload.is_error),
                    timestamp: Utc::now(),
                });

                let result_msg = ChatMessage::new(
                    Role::ToolResult,
                    MessageContent::Blocks(vec![Block::ToolResult {
                        tool_call_id: call.id.clone(),
                        content: payload.content,
                        is_error: payload.is_error,
                    }]),
                );
                self.store
                    .add_message(key, result_msg.clone())
                    .await
                    .context("persisting tool result")?;
                working.push(result_msg);
            }
        }

        let budget = RunError::Model(
            "The run exceeded its tool budget without producing a reply.".to_string(),
        );
        self.emit(RunEvent::lifecycle(
            run_id,
            key,
            LifecyclePhase::Error,
            Some(budget.to_string()),
            None,
        ));
        Err(budget)
    }

    /// Fold older working history into a summary when the estimate crosses
    /// the threshold. Only the in-memory copy is rewritten; the stored log
    /// keeps every original message.
    async fn maybe_compact(
        &self,
        working: &mut Vec<ChatMessage>,
        run_id: &str,
        key: &str,
        window: usize,
    ) {
        if window == 0 || working.len() <= self.settings.compaction_keep_recent {
            return;
        }
        let tokens_before: usize = working.iter().map(ChatMessage::estimate_tokens).sum();
        if (tokens_before as f64) <= self.settings.compaction_threshold * window as f64 {
            return;
        }

        let mut split = working.len() - self.settings.compaction_keep_recent;
        // Never split inside a tool interaction: stepping back over tool
        // results keeps each call paired with its results in the kept tail.
        while split > 0 && working[split].role == Role::ToolResult {
            split -= 1;
        }
        if split == 0 {
            return;
        }

        let kept = working.split_off(split);
        let outcome = self
            .engine
            .compact(CompactionRequest {
                messages: std::mem::take(working),
                turn_prefix: kept.clone(),
                previous_summary: None,
                context_window: window,
            })
            .await;

        *working = Vec::with_capacity(kept.len() + 1);
        working.push(ChatMessage::assistant(outcome.summary));
        working.extend(kept);

        self.emit(RunEvent::Compaction {
            run_id: run_id.to_string(),
            session_key: key.to_string(),
            tokens_before,
            timestamp: Utc::now(),
        });
        info!(run = %run_id, tokens_before, "working history compacted");
    }

    async fn aborted(&self, run_id: &str, key: &str) -> RunError {
        let reason = self
            .abort_reasons
            .lock()
            .await
            .get(run_id)
            .cloned()
            .unwrap_or_else(|| "cancelled".to_string());
        self.emit(RunEvent::lifecycle(
            run_id,
            key,
            LifecyclePhase::Abort,
            Some(reason.clone()),
            None,
        ));
        RunError::Aborted(reason)
    }

    fn emit(&self, event: RunEvent) {
        let _ = self.events.send(event);
    }
}

fn attach_images(working: &mut [ChatMessage], images: &[Block]) {
    if let Some(last_user) = working.iter_mut().rev().find(|m| m.role == Role::User) {
        let mut blocks = last_user.content.to_blocks();
        blocks.extend(images.iter().cloned());
        last_user.content = MessageContent::Blocks(blocks);
    }
}

fn new_run_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();
    format!("run-{}-{}", Utc::now().timestamp(), suffix)
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
