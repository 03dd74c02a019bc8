// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events emitted by the runtime while a run is in flight.
///
/// Streaming is fan-out, not channel-per-consumer: a single broadcast
/// carries every run's events and subscribers self-filter by `run_id`.
/// Per run, ordering is start ≺ assistant/tool/compaction ≺ end/error/abort.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunEvent {
    Lifecycle {
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "sessionKey")]
        session_key: String,
        phase: LifecyclePhase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens: Option<u64>,
        timestamp: DateTime<Utc>,
    },
    /// A chunk of user-facing assistant text.
    Assistant {
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "sessionKey")]
        session_key: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
    Tool {
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "sessionKey")]
        session_key: String,
        tool: String,
        #[serde(rename = "callId")]
        call_id: String,
        phase: ToolPhase,
        #[serde(rename = "isError", default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
        timestamp: DateTime<Utc>,
    },
    Compaction {
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "sessionKey")]
        session_key: String,
        #[serde(rename = "tokensBefore")]
        tokens_before: usize,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    Start,
    End,
    Error,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPhase {
    Start,
    End,
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            Self::Lifecycle { run_id, .. }
            | Self::Assistant { run_id, .. }
            | Self::Tool { run_id, .. }
            | Self::Compaction { run_id, .. } => run_id,
        }
    }

    pub fn lifecycle(
        run_id: &str,
        session_key: &str,
        phase: LifecyclePhase,
        message: Option<String>,
        tokens: Option<u64>,
    ) -> Self {
        Self::Lifecycle {
            run_id: run_id.to_string(),
            session_key: session_key.to_string(),
            phase,
            message,
            tokens,
            timestamp: Utc::now(),
        }
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
