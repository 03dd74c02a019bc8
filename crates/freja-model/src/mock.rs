// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::provider::{CompletionRequest, ModelProvider, ModelResponse, StopReason, Usage};
use crate::types::Block;

/// A pre-scripted provider. Each `complete` call pops the next response
/// from the front of the queue, so tests can specify exact block
/// sequences (including tool calls) without network access.
pub struct ScriptedProvider {
    responses: Mutex<Vec<ModelResponse>>,
    window: usize,
    /// Every request seen, in order, so tests can inspect what was sent.
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ModelResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            window: 200_000,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_context_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Convenience: a provider that answers every call with the same text.
    pub fn always_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(vec![ModelResponse {
            blocks: vec![Block::text(text)],
            stop_reason: StopReason::EndTurn,
            usage: Usage { input_tokens: 5, output_tokens: 5 },
        }])
    }

    /// Convenience response: plain text end-of-turn.
    pub fn text_response(text: impl Into<String>) -> ModelResponse {
        ModelResponse {
            blocks: vec![Block::text(text)],
            stop_reason: StopReason::EndTurn,
            usage: Usage { input_tokens: 5, output_tokens: 5 },
        }
    }

    /// Convenience response: one tool call.
    pub fn tool_call_response(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: Value,
    ) -> ModelResponse {
        ModelResponse {
            blocks: vec![Block::ToolCall {
                id: id.into(),
                name: name.into(),
                arguments,
            }],
            stop_reason: StopReason::ToolUse,
            usage: Usage { input_tokens: 5, output_tokens: 5 },
        }
    }

    /// Convenience response: thinking only, no user-facing text.
    pub fn thinking_only_response(text: impl Into<String>) -> ModelResponse {
        ModelResponse {
            blocks: vec![Block::Thinking { text: text.into() }],
            stop_reason: StopReason::EndTurn,
            usage: Usage { input_tokens: 5, output_tokens: 5 },
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn context_window(&self) -> usize {
        self.window
    }

    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<ModelResponse> {
        self.requests.lock().unwrap().push(request);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            // Script exhausted: repeat a terminal text turn so loops end.
            return Ok(Self::text_response("done"));
        }
        Ok(responses.remove(0))
    }
}

/// A provider whose every call fails with the given message. Exercises the
/// compaction fallback and the runtime's error classification.
pub struct FailingProvider {
    message: String,
}

impl FailingProvider {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[async_trait]
impl ModelProvider for FailingProvider {
    fn name(&self) -> &str {
        "failing-mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn context_window(&self) -> usize {
        200_000
    }

    async fn complete(&self, _request: CompletionRequest) -> anyhow::Result<ModelResponse> {
        anyhow::bail!("{}", self.message)
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
