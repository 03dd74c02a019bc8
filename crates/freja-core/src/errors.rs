// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! Provider error classification.
//!
//! Providers disagree wildly about error shapes, so classification matches
//! the error text against a fixed table and maps it to one user-friendly
//! sentence. The first matching row wins; anything unmatched falls back to
//! a generic sentence carrying the raw text.

/// One row: lowercase needles, user-facing sentence.
const CLASSIFICATION_TABLE: &[(&[&str], &str)] = &[
    (
        &["invalid api key", "unauthorized", "authentication", "401"],
        "Authentication with the model provider failed. Check the configured API key.",
    ),
    (
        &["quota", "billing", "insufficient credit"],
        "The model provider reports an exhausted quota or billing problem.",
    ),
    (
        &["rate limit", "too many requests", "429"],
        "The model is rate-limited right now. Try again in a moment.",
    ),
    (
        &["does not support image", "unsupported content type", "modality"],
        "The selected model does not support this kind of input (for example images).",
    ),
    (
        &["model not found", "unknown model", "no such model", "404"],
        "The configured model was not found at the provider.",
    ),
    (
        &["context length", "context window", "maximum context", "too many tokens"],
        "The conversation exceeds the model's context window even after compaction.",
    ),
    (
        &["timed out", "timeout", "deadline"],
        "The model request timed out.",
    ),
    (
        &["connection", "network", "dns", "unreachable"],
        "The model provider could not be reached (network error).",
    ),
    (
        &["content filter", "content_filter", "safety system", "blocked by"],
        "The provider's content filter blocked this request.",
    ),
];

/// Map a raw provider error onto a user-friendly sentence.
pub fn classify_model_error(raw: &str) -> String {
    let haystack = raw.to_lowercase();
    for (needles, sentence) in CLASSIFICATION_TABLE {
        if needles.iter().any(|n| haystack.contains(n)) {
            return (*sentence).to_string();
        }
    }
    format!("The model call failed: {raw}")
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
