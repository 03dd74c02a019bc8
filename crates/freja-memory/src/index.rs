// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! The memory index proper: mtime-driven incremental ingestion and hybrid
//! vector + lexical search with citations.
//!
//! The `.md` files under the memory root and the `.jsonl` transcripts under
//! the sessions root are the authoritative record; the index only ever
//! holds derived state and can be rebuilt from disk at any time.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::chunk::{chunk_markdown, chunk_transcript, Chunk, ChunkMetadata};
use crate::embed::{cosine, Embedder, HashEmbedder};

/// Minimum spacing between two non-forced sync passes.
const SYNC_THROTTLE: Duration = Duration::from_secs(5);

// ─── Settings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct IndexSettings {
    /// Target chunk size in tokens (4 chars ≈ 1 token).
    pub chunk_size: usize,
    /// Overlap seeded into the following chunk, in tokens.
    pub chunk_overlap: usize,
    pub vector_weight: f32,
    pub text_weight: f32,
    pub min_score: f32,
    pub max_results: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            chunk_size: 400,
            chunk_overlap: 80,
            vector_weight: 0.7,
            text_weight: 0.3,
            min_score: 0.3,
            max_results: 6,
        }
    }
}

/// One search hit: the chunk, its combined score, and a stable citation.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk: Chunk,
    pub score: f32,
    pub citation: String,
}

/// Outcome of a sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub indexed_files: usize,
    pub removed_files: usize,
}

// ─── Index ────────────────────────────────────────────────────────────────────

struct FileEntry {
    mtime: SystemTime,
    size: u64,
    chunks: Vec<Chunk>,
}

#[derive(Default)]
struct IndexState {
    files: HashMap<PathBuf, FileEntry>,
    last_sync: Option<std::time::Instant>,
}

pub struct MemoryIndex {
    memory_root: PathBuf,
    sessions_root: PathBuf,
    embedder: Arc<dyn Embedder>,
    settings: IndexSettings,
    /// Held only for in-memory map reads and single-file replacement,
    /// never across file I/O or an embedding call.
    state: Mutex<IndexState>,
}

impl MemoryIndex {
    pub fn new(
        memory_root: impl Into<PathBuf>,
        sessions_root: impl Into<PathBuf>,
        embedder: Arc<dyn Embedder>,
        settings: IndexSettings,
    ) -> Self {
        Self {
            memory_root: memory_root.into(),
            sessions_root: sessions_root.into(),
            embedder,
            settings,
            state: Mutex::new(IndexState::default()),
        }
    }

    /// Index with the deterministic hash embedder and default settings.
    pub fn with_hash_embedder(
        memory_root: impl Into<PathBuf>,
        sessions_root: impl Into<PathBuf>,
    ) -> Self {
        Self::new(
            memory_root,
            sessions_root,
            Arc::new(HashEmbedder),
            IndexSettings::default(),
        )
    }

    pub fn memory_root(&self) -> &Path {
        &self.memory_root
    }

    pub fn sessions_root(&self) -> &Path {
        &self.sessions_root
    }

    /// Number of indexed chunks (test/diagnostic aid).
    pub async fn chunk_count(&self) -> usize {
        let state = self.state.lock().await;
        state.files.values().map(|f| f.chunks.len()).sum()
    }

    // ── Ingestion ─────────────────────────────────────────────────────────────

    /// Incremental sync: re-chunk and re-embed every file whose
    /// (mtime, size) differs from the indexed record, drop entries for
    /// deleted files. No-ops when a successful pass ran under 5 s ago
    /// unless `force` is set.
    pub async fn sync(&self, force: bool) -> anyhow::Result<SyncReport> {
        {
            let state = self.state.lock().await;
            if !force {
                if let Some(last) = state.last_sync {
                    if last.elapsed() < SYNC_THROTTLE {
                        return Ok(SyncReport::default());
                    }
                }
            }
        }

        let mut report = SyncReport::default();
        let sources = self.enumerate_sources();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        for path in sources {
            seen.insert(path.clone());
            let Ok(meta) = std::fs::metadata(&path) else { continue };
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let size = meta.len();

            let unchanged = {
                let state = self.state.lock().await;
                state
                    .files
                    .get(&path)
                    .map(|e| e.mtime == mtime && e.size == size)
                    .unwrap_or(false)
            };
            if unchanged {
                continue;
            }

            match self.index_file(&path, mtime, size).await {
                Ok(()) => report.indexed_files += 1,
                Err(e) => warn!(path = %path.display(), "indexing failed: {e}"),
            }
        }

        let mut state = self.state.lock().await;
        let stale: Vec<PathBuf> = state
            .files
            .keys()
            .filter(|p| !seen.contains(*p))
            .cloned()
            .collect();
        for path in stale {
            state.files.remove(&path);
            report.removed_files += 1;
        }
        state.last_sync = Some(std::time::Instant::now());
        debug!(
            indexed = report.indexed_files,
            removed = report.removed_files,
            "memory sync complete"
        );
        Ok(report)
    }

    /// Re-index a single file (watcher entry point). Removes the entry when
    /// the file is gone.
    pub async fn reindex_path(&self, path: &Path) -> anyhow::Result<()> {
        match std::fs::metadata(path) {
            Ok(meta) => {
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                self.index_file(path, mtime, meta.len()).await
            }
            Err(_) => {
                self.state.lock().await.files.remove(path);
                Ok(())
            }
        }
    }

    async fn index_file(
        &self,
        path: &Path,
        mtime: SystemTime,
        size: u64,
    ) -> anyhow::Result<()> {
        let content = tokio::fs::read_to_string(path).await?;
        let metadata = ChunkMetadata {
            mtime_iso: DateTime::<Utc>::from(mtime).to_rfc3339(),
            size,
            ..Default::default()
        };

        let mut chunks = match path.extension().and_then(|e| e.to_str()) {
            Some("md") => chunk_markdown(
                &self.rel_path(path, &self.memory_root),
                &content,
                self.settings.chunk_size * 4,
                self.settings.chunk_overlap * 4,
                &metadata,
            ),
            Some("jsonl") => chunk_transcript(
                &self.rel_path(path, &self.sessions_root),
                &content,
                &metadata,
            ),
            _ => return Ok(()),
        };

        // Embed outside the lock; only the map swap happens under it.
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        for (chunk, vector) in chunks.iter_mut().zip(vectors) {
            chunk.embedding = Some(vector);
        }

        let mut state = self.state.lock().await;
        state
            .files
            .insert(path.to_path_buf(), FileEntry { mtime, size, chunks });
        Ok(())
    }

    fn enumerate_sources(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for (root, ext) in [(&self.memory_root, "md"), (&self.sessions_root, "jsonl")] {
            if !root.exists() {
                continue;
            }
            for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
                let path = entry.path();
                if entry.file_type().is_file()
                    && path.extension().and_then(|e| e.to_str()) == Some(ext)
                {
                    paths.push(path.to_path_buf());
                }
            }
        }
        paths.sort();
        paths
    }

    fn rel_path(&self, path: &Path, root: &Path) -> String {
        path.strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    // ── Search ────────────────────────────────────────────────────────────────

    /// Hybrid search over the indexed state. Pure with respect to the
    /// index: repeated calls with no intervening sync return identical
    /// results.
    pub async fn search(&self, query: &str) -> anyhow::Result<Vec<SearchResult>> {
        let query_vec = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();
        let terms = query_terms(query);

        let state = self.state.lock().await;
        let mut results: Vec<SearchResult> = Vec::new();
        for entry in state.files.values() {
            for chunk in &entry.chunks {
                let vector_score = chunk
                    .embedding
                    .as_deref()
                    .map(|e| cosine(&query_vec, e))
                    .unwrap_or(0.0);
                let score = self.settings.vector_weight * vector_score
                    + self.settings.text_weight * lexical_score(&terms, &chunk.content);
                if score >= self.settings.min_score {
                    results.push(SearchResult {
                        citation: chunk.citation(),
                        chunk: chunk.clone(),
                        score,
                    });
                }
            }
        }
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(self.settings.max_results);
        Ok(results)
    }
}

// ─── Lexical scoring ──────────────────────────────────────────────────────────

/// Query terms: lowercased alphanumeric tokens longer than two characters.
fn query_terms(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(str::to_string)
        .collect()
}

/// Fraction of query terms found in the lowercased chunk content.
fn lexical_score(terms: &[String], content: &str) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = content.to_lowercase();
    let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    hits as f32 / terms.len() as f32
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
