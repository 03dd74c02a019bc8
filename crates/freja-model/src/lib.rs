// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! Conversation data model shared by the store, the runtime, and the model
//! provider boundary, plus the history-hygiene pass that runs before every
//! model call.

mod mock;
mod provider;
pub mod sanitize;
mod types;

pub use mock::{FailingProvider, ScriptedProvider};
pub use provider::{
    CompletionRequest, ModelProvider, ModelResponse, StopReason, ToolSpec, Usage,
};
pub use types::{estimate_total_chars, Block, ChatMessage, MessageContent, Role, ToolCallView};
