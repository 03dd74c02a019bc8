// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! Filesystem watcher: re-indexes individual files as they change.
//!
//! Events are debounced per path (500 ms) so an editor's write-rename
//! dance triggers one re-index, not five.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::index::MemoryIndex;

/// Per-path debounce window.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Keeps the watcher (and its backing thread) alive; dropping it stops
/// the watch.
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Watch the index's memory root and re-index changed `.md` / `.jsonl`
/// files after the debounce window closes.
pub fn spawn_watcher(index: Arc<MemoryIndex>) -> anyhow::Result<WatcherHandle> {
    let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                for path in event.paths {
                    let relevant = matches!(
                        path.extension().and_then(|e| e.to_str()),
                        Some("md") | Some("jsonl")
                    );
                    if relevant {
                        let _ = tx.send(path);
                    }
                }
            }
            Err(e) => warn!("file watch error: {e}"),
        }
    })?;

    watcher.watch(index.memory_root(), RecursiveMode::Recursive)?;
    if index.sessions_root().exists() {
        watcher.watch(index.sessions_root(), RecursiveMode::Recursive)?;
    }

    let task = tokio::spawn(debounce_loop(index, rx));
    Ok(WatcherHandle { _watcher: watcher, task })
}

/// Collect change notifications and fire a re-index once a path has been
/// quiet for the debounce window.
async fn debounce_loop(index: Arc<MemoryIndex>, mut rx: mpsc::UnboundedReceiver<PathBuf>) {
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        let next_deadline = pending.values().min().copied();
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(path) => {
                        pending.insert(path, Instant::now() + DEBOUNCE);
                    }
                    None => break,
                }
            }
            _ = sleep_until_or_forever(next_deadline) => {
                let now = Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in due {
                    pending.remove(&path);
                    debug!(path = %path.display(), "re-indexing changed file");
                    if let Err(e) = index.reindex_path(&path).await {
                        warn!(path = %path.display(), "re-index failed: {e}");
                    }
                }
            }
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn watcher_reindexes_after_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let memory = dir.path().join("memory");
        let sessions = dir.path().join("sessions");
        std::fs::create_dir_all(&memory).unwrap();
        std::fs::create_dir_all(&sessions).unwrap();

        let index = Arc::new(MemoryIndex::with_hash_embedder(&memory, &sessions));
        let _handle = spawn_watcher(Arc::clone(&index)).unwrap();

        std::fs::write(memory.join("fresh.md"), "watched content arrives").unwrap();

        // Give the notify backend + debounce window time to fire.
        let mut found = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if index.chunk_count().await > 0 {
                found = true;
                break;
            }
        }
        assert!(found, "watcher never indexed the new file");
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let memory = dir.path().join("memory");
        std::fs::create_dir_all(&memory).unwrap();
        let index = Arc::new(MemoryIndex::with_hash_embedder(
            &memory,
            dir.path().join("sessions"),
        ));
        let handle = spawn_watcher(Arc::clone(&index)).unwrap();
        drop(handle);
        // No assertion beyond "drop does not hang or panic".
    }
}
