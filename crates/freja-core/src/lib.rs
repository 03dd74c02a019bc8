// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: Apache-2.0
//! Agent runtime core: the per-session queue, the context pruning and
//! compaction engines, and the model ↔ tool loop that turns one queued
//! task into one delivered reply.

pub mod compact;
pub mod errors;
pub mod events;
pub mod prompts;
pub mod prune;
pub mod queue;
pub mod runtime;

pub use compact::{
    CompactionEngine, CompactionOutcome, CompactionRequest, CompactionSettings,
    ProviderSummarizer, Summarizer, FALLBACK_SUMMARY,
};
pub use errors::classify_model_error;
pub use events::{LifecyclePhase, RunEvent, ToolPhase};
pub use prompts::{build_system_prompt, PromptContext, HEARTBEAT_TOKEN};
pub use prune::{prune_context, PruneSettings, SoftTrim, CLEARED_TEXT};
pub use queue::{QueueError, QueueEvent, QueuePhase, SessionQueue};
pub use runtime::{
    is_subagent_key, RunConfig, RunError, RunOutcome, Runtime, RuntimeSettings,
    ToolDispatcher, ToolInvocation, ToolResultPayload, DEFAULT_TASK,
};
