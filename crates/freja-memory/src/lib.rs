// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! Hybrid memory index over markdown notes and JSONL session transcripts.
//!
//! Files are chunked with line-range citations, embedded (hosted model or
//! a deterministic trigram fallback), and searched with a weighted
//! vector + lexical score. Ingestion is incremental: a file is re-chunked
//! only when its (mtime, size) changes, driven either by a `sync` pass or
//! by the filesystem watcher.

mod chunk;
mod embed;
mod index;
mod watcher;

pub use chunk::{Chunk, ChunkMetadata};
pub use embed::{cosine, Embedder, HashEmbedder, HostedEmbedder, HASH_DIMENSIONS};
pub use index::{IndexSettings, MemoryIndex, SearchResult, SyncReport};
pub use watcher::{spawn_watcher, WatcherHandle};
