// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use async_trait::async_trait;
use freja_model::ChatMessage;

use crate::{
    apply_get_messages, GetMessages, SessionFilter, SessionKind, SessionRecord, SessionStore,
    StoreError,
};

/// In-memory store: the default for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, (SessionRecord, Vec<ChatMessage>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn list(&self, filter: SessionFilter) -> Result<Vec<SessionRecord>, StoreError> {
        let sessions = self.sessions.lock().await;
        let mut records: Vec<SessionRecord> = sessions
            .values()
            .map(|(r, _)| r.clone())
            .filter(|r| filter.kind.map_or(true, |k| r.kind == k))
            .filter(|r| {
                filter
                    .key_prefix
                    .as_deref()
                    .map_or(true, |p| r.key.starts_with(p))
            })
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    async fn get(&self, key: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.lock().await.get(key).map(|(r, _)| r.clone()))
    }

    async fn create(
        &self,
        key: &str,
        kind: SessionKind,
        label: Option<String>,
        metadata: Value,
    ) -> Result<SessionRecord, StoreError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        let now = Utc::now();
        let record = SessionRecord {
            key: key.to_string(),
            kind,
            created_at: now,
            updated_at: now,
            label,
            metadata,
        };
        sessions.insert(key.to_string(), (record.clone(), Vec::new()));
        Ok(record)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.sessions.lock().await.remove(key).is_some())
    }

    async fn add_message(
        &self,
        key: &str,
        message: ChatMessage,
    ) -> Result<ChatMessage, StoreError> {
        let mut sessions = self.sessions.lock().await;
        let (record, messages) = sessions
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        record.updated_at = Utc::now();
        messages.push(message.clone());
        Ok(message)
    }

    async fn get_messages(
        &self,
        key: &str,
        opts: GetMessages,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let sessions = self.sessions.lock().await;
        let (_, messages) = sessions
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok(apply_get_messages(messages.clone(), opts))
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensure_session;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = MemoryStore::new();
        let created = store
            .create("main:default", SessionKind::Main, Some("Main".into()), Value::Null)
            .await
            .unwrap();
        let fetched = store.get("main:default").await.unwrap().unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = MemoryStore::new();
        store
            .create("k", SessionKind::Main, None, Value::Null)
            .await
            .unwrap();
        let err = store
            .create("k", SessionKind::Main, None, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn append_then_read_preserves_order() {
        let store = MemoryStore::new();
        store
            .create("s", SessionKind::Main, None, Value::Null)
            .await
            .unwrap();
        for text in ["one", "two", "three"] {
            store.add_message("s", ChatMessage::user(text)).await.unwrap();
        }
        let msgs = store.get_messages("s", GetMessages::default()).await.unwrap();
        let texts: Vec<String> = msgs.iter().map(|m| m.visible_text()).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
        assert!(msgs.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn add_message_to_missing_session_fails() {
        let store = MemoryStore::new();
        let err = store
            .add_message("ghost", ChatMessage::user("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_filters_by_kind_and_prefix() {
        let store = MemoryStore::new();
        store.create("cron:a:1", SessionKind::Cron, None, Value::Null).await.unwrap();
        store.create("whatsapp:+1", SessionKind::Main, None, Value::Null).await.unwrap();
        let crons = store
            .list(SessionFilter { kind: Some(SessionKind::Cron), key_prefix: None })
            .await
            .unwrap();
        assert_eq!(crons.len(), 1);
        let wa = store
            .list(SessionFilter { kind: None, key_prefix: Some("whatsapp:".into()) })
            .await
            .unwrap();
        assert_eq!(wa.len(), 1);
        assert_eq!(wa[0].key, "whatsapp:+1");
    }

    #[tokio::test]
    async fn ensure_session_creates_once() {
        let store = MemoryStore::new();
        let first = ensure_session(&store, "webhook:gh", None).await.unwrap();
        assert_eq!(first.kind, SessionKind::Webhook);
        let again = ensure_session(&store, "webhook:gh", None).await.unwrap();
        assert_eq!(again.created_at, first.created_at);
    }

    #[tokio::test]
    async fn delete_removes_session() {
        let store = MemoryStore::new();
        store.create("gone", SessionKind::Main, None, Value::Null).await.unwrap();
        assert!(store.delete("gone").await.unwrap());
        assert!(!store.delete("gone").await.unwrap());
        assert!(store.get("gone").await.unwrap().is_none());
    }
}
