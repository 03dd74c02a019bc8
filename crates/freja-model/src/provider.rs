// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! The consumed model-provider interface.
//!
//! Freja does not ship a provider SDK; the runtime talks to whatever
//! implements [`ModelProvider`]. Tests use the scripted mock, deployments
//! wire in a real adapter.

use async_trait::async_trait;
use serde_json::Value;

use crate::types::{Block, ChatMessage};

/// Tool description handed to the model alongside the conversation.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

/// One completion request: system prompt, working history, available tools.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
}

/// Why the model stopped emitting blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// Token usage reported by the provider for one completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// The assistant turn a completion produced.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub blocks: Vec<Block>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl ModelResponse {
    /// True when the response requests at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        self.blocks.iter().any(|b| matches!(b, Block::ToolCall { .. }))
    }
}

/// A model backend. Implementations must be cheap to share behind an `Arc`.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name for logs and the system prompt's runtime section.
    fn name(&self) -> &str;

    /// The model identifier requests are issued against.
    fn model(&self) -> &str;

    /// Context window in tokens for the configured model.
    fn context_window(&self) -> usize;

    /// Run one completion. Errors surface verbatim so the runtime can
    /// classify them into user-facing messages.
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<ModelResponse>;
}
