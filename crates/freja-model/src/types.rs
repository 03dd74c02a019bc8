// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Message blocks ───────────────────────────────────────────────────────────

/// A single content block inside an assistant or tool-result message.
///
/// Pruning, compaction, and text extraction are pattern matches over these
/// variants; keeping the union closed is what makes those passes total.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Block {
    Text {
        text: String,
    },
    /// Model reasoning. Never surfaced to users and never counted as
    /// user-facing text when deciding whether a response was empty.
    Thinking {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
    },
    ToolResult {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        content: Vec<Block>,
        #[serde(rename = "isError", default)]
        is_error: bool,
    },
    Image {
        /// Base64 payload without a data-URL prefix.
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

impl Block {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        text: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.into(),
            content: vec![Block::text(text)],
            is_error,
        }
    }
}

// ─── Message content ──────────────────────────────────────────────────────────

/// Either a plain string (most user/system turns) or a block list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<Block>),
}

impl MessageContent {
    /// Normalize to a block list, cloning plain text into a single block.
    pub fn to_blocks(&self) -> Vec<Block> {
        match self {
            Self::Text(t) => vec![Block::text(t.clone())],
            Self::Blocks(b) => b.clone(),
        }
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

// ─── Roles ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    User,
    Assistant,
    System,
    ToolResult,
}

// ─── Messages ─────────────────────────────────────────────────────────────────

/// One turn in a session history. Append-only once stored; the in-memory
/// working copy handed to the model may be trimmed and rewritten freely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

/// Borrowed view of one tool call inside an assistant message.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallView {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text.into())
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text.into())
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text.into())
    }

    pub fn assistant_blocks(blocks: Vec<Block>) -> Self {
        Self::new(Role::Assistant, MessageContent::Blocks(blocks))
    }

    /// A tool-result turn answering the tool call with `tool_call_id`.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        text: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::new(
            Role::ToolResult,
            MessageContent::Blocks(vec![Block::tool_result(tool_call_id, text, is_error)]),
        )
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// The `metadata.type` tag, if present (`"task"` marks inbound tasks).
    pub fn metadata_type(&self) -> Option<&str> {
        self.metadata.get("type").and_then(Value::as_str)
    }

    /// User-facing text: every `Text` block joined by newlines. `Thinking`
    /// blocks are excluded by definition.
    pub fn visible_text(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    Block::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// True when the message carries blocks and every block is `Thinking`.
    pub fn is_thinking_only(&self) -> bool {
        match &self.content {
            MessageContent::Text(_) => false,
            MessageContent::Blocks(blocks) => {
                !blocks.is_empty() && blocks.iter().all(|b| matches!(b, Block::Thinking { .. }))
            }
        }
    }

    /// All tool calls requested by this (assistant) message.
    pub fn tool_calls(&self) -> Vec<ToolCallView> {
        match &self.content {
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    Block::ToolCall { id, name, arguments } => Some(ToolCallView {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: arguments.clone(),
                    }),
                    _ => None,
                })
                .collect(),
            MessageContent::Text(_) => vec![],
        }
    }

    /// Tool-call ids answered by this (tool-result) message.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        match &self.content {
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    Block::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
                    _ => None,
                })
                .collect(),
            MessageContent::Text(_) => vec![],
        }
    }

    /// True when any block (including nested tool-result content) is an image.
    pub fn has_image(&self) -> bool {
        fn blocks_have_image(blocks: &[Block]) -> bool {
            blocks.iter().any(|b| match b {
                Block::Image { .. } => true,
                Block::ToolResult { content, .. } => blocks_have_image(content),
                _ => false,
            })
        }
        match &self.content {
            MessageContent::Text(_) => false,
            MessageContent::Blocks(blocks) => blocks_have_image(blocks),
        }
    }

    /// Character estimate for context budgeting: text characters as-is, a
    /// flat 8 000 characters per image block (4 chars ≈ 1 token).
    pub fn estimate_chars(&self) -> usize {
        fn block_chars(b: &Block) -> usize {
            match b {
                Block::Text { text } | Block::Thinking { text } => text.len(),
                Block::ToolCall { name, arguments, .. } => {
                    name.len() + arguments.to_string().len()
                }
                Block::ToolResult { content, .. } => content.iter().map(block_chars).sum(),
                Block::Image { .. } => 8_000,
            }
        }
        match &self.content {
            MessageContent::Text(t) => t.len(),
            MessageContent::Blocks(blocks) => blocks.iter().map(block_chars).sum(),
        }
    }

    /// Token estimate at 4 characters per token.
    pub fn estimate_tokens(&self) -> usize {
        (self.estimate_chars() / 4).max(1)
    }
}

/// Character estimate over a whole working history.
pub fn estimate_total_chars(messages: &[ChatMessage]) -> usize {
    messages.iter().map(ChatMessage::estimate_chars).sum()
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Construction ──────────────────────────────────────────────────────────

    #[test]
    fn user_message_has_role_and_text() {
        let m = ChatMessage::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.visible_text(), "hello");
    }

    #[test]
    fn tool_result_message_answers_call_id() {
        let m = ChatMessage::tool_result("tc-1", "output", false);
        assert_eq!(m.role, Role::ToolResult);
        assert_eq!(m.tool_result_ids(), vec!["tc-1"]);
    }

    #[test]
    fn metadata_type_reads_task_tag() {
        let m = ChatMessage::user("do it").with_metadata(json!({"type": "task"}));
        assert_eq!(m.metadata_type(), Some("task"));
        assert_eq!(ChatMessage::user("x").metadata_type(), None);
    }

    // ── Text extraction ───────────────────────────────────────────────────────

    #[test]
    fn visible_text_skips_thinking_blocks() {
        let m = ChatMessage::assistant_blocks(vec![
            Block::Thinking { text: "mull it over".into() },
            Block::text("the answer"),
        ]);
        assert_eq!(m.visible_text(), "the answer");
    }

    #[test]
    fn thinking_only_detection() {
        let m = ChatMessage::assistant_blocks(vec![Block::Thinking { text: "hmm".into() }]);
        assert!(m.is_thinking_only());
        assert!(!ChatMessage::assistant("hi").is_thinking_only());
    }

    #[test]
    fn tool_calls_are_collected_in_order() {
        let m = ChatMessage::assistant_blocks(vec![
            Block::ToolCall { id: "a".into(), name: "read".into(), arguments: json!({}) },
            Block::text("and"),
            Block::ToolCall { id: "b".into(), name: "write".into(), arguments: json!({}) },
        ]);
        let calls = m.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "a");
        assert_eq!(calls[1].name, "write");
    }

    // ── Estimation ────────────────────────────────────────────────────────────

    #[test]
    fn estimate_counts_text_chars() {
        let m = ChatMessage::user("12345678");
        assert_eq!(m.estimate_chars(), 8);
        assert_eq!(m.estimate_tokens(), 2);
    }

    #[test]
    fn estimate_charges_flat_rate_per_image() {
        let m = ChatMessage::new(
            Role::User,
            MessageContent::Blocks(vec![Block::Image {
                data: "AAAA".into(),
                mime_type: "image/png".into(),
            }]),
        );
        assert_eq!(m.estimate_chars(), 8_000);
    }

    #[test]
    fn estimate_recurses_into_tool_result_content() {
        let m = ChatMessage::new(
            Role::ToolResult,
            MessageContent::Blocks(vec![Block::ToolResult {
                tool_call_id: "t".into(),
                content: vec![
                    Block::text("1234"),
                    Block::Image { data: "x".into(), mime_type: "image/png".into() },
                ],
                is_error: false,
            }]),
        );
        assert_eq!(m.estimate_chars(), 4 + 8_000);
    }

    // ── Image detection ───────────────────────────────────────────────────────

    #[test]
    fn has_image_sees_nested_tool_result_images() {
        let m = ChatMessage::new(
            Role::ToolResult,
            MessageContent::Blocks(vec![Block::ToolResult {
                tool_call_id: "t".into(),
                content: vec![Block::Image { data: "x".into(), mime_type: "image/png".into() }],
                is_error: false,
            }]),
        );
        assert!(m.has_image());
        assert!(!ChatMessage::user("plain").has_image());
    }

    // ── Serialization ─────────────────────────────────────────────────────────

    #[test]
    fn block_tags_are_camel_case() {
        let b = Block::tool_result("id-1", "out", true);
        let json = serde_json::to_string(&b).unwrap();
        assert!(json.contains("\"type\":\"toolResult\""));
        assert!(json.contains("\"toolCallId\":\"id-1\""));
        assert!(json.contains("\"isError\":true"));
    }

    #[test]
    fn message_round_trips_through_json() {
        let m = ChatMessage::assistant_blocks(vec![
            Block::text("hi"),
            Block::ToolCall { id: "a".into(), name: "read".into(), arguments: json!({"p": 1}) },
        ]);
        let json = serde_json::to_string(&m).unwrap();
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn plain_text_content_round_trips_as_string() {
        let m = ChatMessage::user("just text");
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"content\":\"just text\""));
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.visible_text(), "just text");
    }
}
