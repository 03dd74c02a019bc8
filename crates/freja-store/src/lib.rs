// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! The session store: an append-only per-session message log.
//!
//! The store owns persistent history. Pruning and compaction never write
//! here; they only shape the in-memory working copy handed to the model,
//! so exports, audits, and the memory index always see the unvarnished
//! record.

mod jsonl;
mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use async_trait::async_trait;
use freja_model::ChatMessage;

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;

// ─── Types ────────────────────────────────────────────────────────────────────

/// Session kind, derived from the key's leading segment. Only informs
/// policy (history limits); key identity is the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Main,
    Webhook,
    Cron,
    Subagent,
}

impl SessionKind {
    /// Classify a session key by its conventional shape.
    pub fn from_key(key: &str) -> Self {
        if key.contains(":subagent:") || key.starts_with("agent:") {
            Self::Subagent
        } else if key.starts_with("cron:") {
            Self::Cron
        } else if key.starts_with("webhook:") {
            Self::Webhook
        } else {
            Self::Main
        }
    }
}

/// Header record for one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub key: String,
    pub kind: SessionKind,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// Filter for [`SessionStore::list`].
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub kind: Option<SessionKind>,
    pub key_prefix: Option<String>,
}

/// Options for [`SessionStore::get_messages`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetMessages {
    /// Keep only the last `limit` messages (after `before` filtering).
    pub limit: Option<usize>,
    /// Keep only messages strictly older than this instant.
    pub before: Option<DateTime<Utc>>,
}

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no such session: {0}")]
    NotFound(String),

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

// ─── Interface ────────────────────────────────────────────────────────────────

/// The consumed store interface. Messages are append-only;
/// [`get_messages`](SessionStore::get_messages) returns timestamp-ascending
/// order matching append order.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn list(&self, filter: SessionFilter) -> Result<Vec<SessionRecord>, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<SessionRecord>, StoreError>;

    async fn create(
        &self,
        key: &str,
        kind: SessionKind,
        label: Option<String>,
        metadata: Value,
    ) -> Result<SessionRecord, StoreError>;

    /// Returns `true` when a session was actually removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Append one message to an existing session's log.
    async fn add_message(
        &self,
        key: &str,
        message: ChatMessage,
    ) -> Result<ChatMessage, StoreError>;

    async fn get_messages(
        &self,
        key: &str,
        opts: GetMessages,
    ) -> Result<Vec<ChatMessage>, StoreError>;
}

/// Fetch an existing session or create it with the kind its key implies.
pub async fn ensure_session(
    store: &dyn SessionStore,
    key: &str,
    label: Option<String>,
) -> Result<SessionRecord, StoreError> {
    if let Some(existing) = store.get(key).await? {
        return Ok(existing);
    }
    store
        .create(key, SessionKind::from_key(key), label, Value::Null)
        .await
}

/// Apply [`GetMessages`] to an ascending message list.
pub(crate) fn apply_get_messages(
    mut messages: Vec<ChatMessage>,
    opts: GetMessages,
) -> Vec<ChatMessage> {
    if let Some(before) = opts.before {
        messages.retain(|m| m.timestamp < before);
    }
    if let Some(limit) = opts.limit {
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
    }
    messages
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
