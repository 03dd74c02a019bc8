// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! Chunking: turning source files into indexable spans with stable
//! line-range citations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata carried by every chunk; transcript chunks also record which
/// session and role the line came from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub mtime_iso: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// One indexed span of a source file. Immutable per indexed generation;
/// the whole set for a file is replaced when (mtime, size) changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// `<relPath>:<startLine>`, stable across re-indexes of unchanged content.
    pub id: String,
    pub path: String,
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// `"notes.md#L4"` for a single line, `"notes.md#L4-L12"` for a range.
    pub fn citation(&self) -> String {
        if self.start_line == self.end_line {
            format!("{}#L{}", self.path, self.start_line)
        } else {
            format!("{}#L{}-L{}", self.path, self.start_line, self.end_line)
        }
    }
}

// ─── Markdown ─────────────────────────────────────────────────────────────────

/// Fill chunks line by line until `chunk_chars` is reached, then seed the
/// next chunk with the trailing `overlap_chars` of the emitted one so no
/// statement loses its surrounding context. Lines are 1-based.
pub fn chunk_markdown(
    rel_path: &str,
    content: &str,
    chunk_chars: usize,
    overlap_chars: usize,
    metadata: &ChunkMetadata,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut buf = String::new();
    let mut start_line = 1usize;
    let mut fresh_lines = false;

    for (i, line) in content.lines().enumerate() {
        let line_no = i + 1;
        if !buf.is_empty() {
            buf.push('\n');
        }
        buf.push_str(line);
        fresh_lines = true;

        if buf.len() >= chunk_chars {
            chunks.push(make_chunk(rel_path, &buf, start_line, line_no, metadata));
            buf = tail_chars(&buf, overlap_chars).to_string();
            start_line = line_no + 1;
            fresh_lines = false;
        }
    }

    if fresh_lines && !buf.trim().is_empty() {
        let last_line = content.lines().count();
        chunks.push(make_chunk(rel_path, &buf, start_line, last_line, metadata));
    }
    chunks
}

// ─── Transcripts ──────────────────────────────────────────────────────────────

/// JSONL transcripts: line 1 is the session header, every further line is
/// one message and becomes one chunk, its content prefixed `[<role>] `.
pub fn chunk_transcript(rel_path: &str, content: &str, metadata: &ChunkMetadata) -> Vec<Chunk> {
    let mut lines = content.lines().enumerate();

    let header: Value = match lines.next() {
        Some((_, first)) => serde_json::from_str(first).unwrap_or(Value::Null),
        None => return Vec::new(),
    };
    let session_key = header.get("key").and_then(Value::as_str).map(str::to_string);
    let label = header.get("label").and_then(Value::as_str).map(str::to_string);

    let mut chunks = Vec::new();
    for (i, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let role = message
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let text = message_text(&message);
        if text.is_empty() {
            continue;
        }
        let line_no = i + 1;
        let meta = ChunkMetadata {
            session_key: session_key.clone(),
            label: label.clone(),
            role: Some(role.clone()),
            ..metadata.clone()
        };
        let mut chunk = make_chunk(
            rel_path,
            &format!("[{role}] {text}"),
            line_no,
            line_no,
            &meta,
        );
        chunk.metadata = meta;
        chunks.push(chunk);
    }
    chunks
}

/// Extract readable text from a stored message line: plain string content
/// or the text blocks of a block list.
fn message_text(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| {
                if b.get("type").and_then(Value::as_str) == Some("text") {
                    b.get("text").and_then(Value::as_str)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn make_chunk(
    rel_path: &str,
    content: &str,
    start_line: usize,
    end_line: usize,
    metadata: &ChunkMetadata,
) -> Chunk {
    Chunk {
        id: format!("{rel_path}:{start_line}"),
        path: rel_path.to_string(),
        content: content.to_string(),
        start_line,
        end_line,
        embedding: None,
        metadata: metadata.clone(),
    }
}

/// Last `n` bytes of `s`, snapped forward to a char boundary.
fn tail_chars(s: &str, n: usize) -> &str {
    if s.len() <= n {
        return s;
    }
    let mut cut = s.len() - n;
    while !s.is_char_boundary(cut) {
        cut += 1;
    }
    &s[cut..]
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
