// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! JSONL-backed session store.
//!
//! One `<escaped-key>.jsonl` file per session under the sessions root.
//! Line 0 is the session header record; every further line is one appended
//! message. This is exactly the transcript format the memory index reads,
//! so indexing session history needs no export step.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use async_trait::async_trait;
use freja_model::ChatMessage;

use crate::{
    apply_get_messages, GetMessages, SessionFilter, SessionKind, SessionRecord, SessionStore,
    StoreError,
};

pub struct JsonlStore {
    root: PathBuf,
    /// Serializes writes; reads go straight to the filesystem.
    write_lock: Mutex<()>,
}

impl JsonlStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root, write_lock: Mutex::new(()) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", escape_key(key)))
    }

    async fn read_lines(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn header(&self, key: &str) -> Result<SessionRecord, StoreError> {
        let lines = self.read_lines(key).await?;
        let first = lines
            .first()
            .ok_or_else(|| StoreError::Corrupt(format!("{key}: empty transcript")))?;
        let mut record: SessionRecord = serde_json::from_str(first)
            .map_err(|e| StoreError::Corrupt(format!("{key}: bad header: {e}")))?;
        // The header is written once; the file mtime tracks activity.
        if let Ok(meta) = tokio::fs::metadata(self.path_for(key)).await {
            if let Ok(mtime) = meta.modified() {
                record.updated_at = DateTime::<Utc>::from(mtime);
            }
        }
        Ok(record)
    }
}

#[async_trait]
impl SessionStore for JsonlStore {
    async fn list(&self, filter: SessionFilter) -> Result<Vec<SessionRecord>, StoreError> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let text = tokio::fs::read_to_string(&path).await?;
            let Some(first) = text.lines().next() else { continue };
            match serde_json::from_str::<SessionRecord>(first) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), "skipping transcript with bad header: {e}"),
            }
        }
        records.retain(|r| filter.kind.map_or(true, |k| r.kind == k));
        records.retain(|r| {
            filter
                .key_prefix
                .as_deref()
                .map_or(true, |p| r.key.starts_with(p))
        });
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    async fn get(&self, key: &str) -> Result<Option<SessionRecord>, StoreError> {
        match self.header(key).await {
            Ok(record) => Ok(Some(record)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create(
        &self,
        key: &str,
        kind: SessionKind,
        label: Option<String>,
        metadata: Value,
    ) -> Result<SessionRecord, StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(key);
        if tokio::fs::try_exists(&path).await? {
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
        let header = serde_json::to_string(&record)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        tokio::fs::write(&path, format!("{header}\n")).await?;
        Ok(record)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn add_message(
        &self,
        key: &str,
        message: ChatMessage,
    ) -> Result<ChatMessage, StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(key);
        if !tokio::fs::try_exists(&path).await? {
            return Err(StoreError::NotFound(key.to_string()));
        }
        let line = serde_json::to_string(&message)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await?;
        file.write_all(format!("{line}\n").as_bytes()).await?;
        file.flush().await?;
        Ok(message)
    }

    async fn get_messages(
        &self,
        key: &str,
        opts: GetMessages,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let lines = self.read_lines(key).await?;
        let mut messages = Vec::with_capacity(lines.len().saturating_sub(1));
        for line in lines.iter().skip(1) {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ChatMessage>(line) {
                Ok(m) => messages.push(m),
                Err(e) => warn!(session = %key, "skipping corrupt transcript line: {e}"),
            }
        }
        Ok(apply_get_messages(messages, opts))
    }
}

/// Map a session key onto a filesystem-safe file stem. Alphanumerics plus
/// `.`/`-`/`_` pass through; everything else becomes `_`. A short content
/// hash keeps distinct keys from colliding after escaping.
fn escape_key(key: &str) -> String {
    let safe: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}-{:08x}", fnv1a(key.as_bytes()))
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, JsonlStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_writes_header_line() {
        let (_dir, store) = store().await;
        store
            .create("whatsapp:+4917", SessionKind::Main, Some("Chat".into()), Value::Null)
            .await
            .unwrap();
        let record = store.get("whatsapp:+4917").await.unwrap().unwrap();
        assert_eq!(record.key, "whatsapp:+4917");
        assert_eq!(record.label.as_deref(), Some("Chat"));
    }

    #[tokio::test]
    async fn append_then_read_matches_append_order() {
        let (_dir, store) = store().await;
        store
            .create("s1", SessionKind::Main, None, Value::Null)
            .await
            .unwrap();
        store.add_message("s1", ChatMessage::user("first")).await.unwrap();
        store
            .add_message("s1", ChatMessage::assistant("second"))
            .await
            .unwrap();
        let msgs = store.get_messages("s1", GetMessages::default()).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].visible_text(), "first");
        assert_eq!(msgs[1].visible_text(), "second");
        assert!(msgs[0].timestamp <= msgs[1].timestamp);
    }

    #[tokio::test]
    async fn distinct_keys_map_to_distinct_files() {
        let (_dir, store) = store().await;
        store
            .create("whatsapp:+4917", SessionKind::Main, None, Value::Null)
            .await
            .unwrap();
        // Same escaped shape, different raw key.
        store
            .create("whatsapp: 4917", SessionKind::Main, None, Value::Null)
            .await
            .unwrap();
        let all = store.list(SessionFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn get_messages_limit_applies() {
        let (_dir, store) = store().await;
        store.create("s", SessionKind::Main, None, Value::Null).await.unwrap();
        for i in 0..5 {
            store
                .add_message("s", ChatMessage::user(format!("m{i}")))
                .await
                .unwrap();
        }
        let last_two = store
            .get_messages("s", GetMessages { limit: Some(2), before: None })
            .await
            .unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[1].visible_text(), "m4");
    }

    #[tokio::test]
    async fn missing_session_reads_fail_with_not_found() {
        let (_dir, store) = store().await;
        let err = store
            .get_messages("nope", GetMessages::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_the_transcript() {
        let (_dir, store) = store().await;
        store.create("bye", SessionKind::Main, None, Value::Null).await.unwrap();
        assert!(store.delete("bye").await.unwrap());
        assert!(store.get("bye").await.unwrap().is_none());
    }

    #[test]
    fn escape_key_is_stable_and_collision_free() {
        assert_eq!(escape_key("a:b"), escape_key("a:b"));
        assert_ne!(escape_key("a:b"), escape_key("a b"));
    }
}
