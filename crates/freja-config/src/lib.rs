// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! Platform configuration, read once at startup from `FREJA_*` environment
//! variables and injected into the `App`. Every knob has a default that
//! matches the documented behavior, so an empty environment boots a
//! loopback deployment.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

// ─── Config tree ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub webhook: WebhookConfig,
    pub storage: StorageConfig,
    pub model: ModelConfig,
    pub embeddings: EmbeddingsConfig,
    pub prune: PruneConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Loopback by default; the intra-process bus is not meant to be exposed.
    pub host: String,
    pub port: u16,
    /// Default RPC deadline in milliseconds.
    pub request_timeout_ms: u64,
    /// Keepalive ping interval in seconds.
    pub ping_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `"jsonl"` or `"memory"`.
    pub sessions_backend: String,
    pub sessions_root: PathBuf,
    pub memory_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub context_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    /// `"hash"` (deterministic fallback) or `"openai"`.
    pub provider: String,
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
}

/// User-turn history limits applied before sanitization, by session kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub cron_turns: usize,
    pub channel_turns: usize,
    pub default_turns: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { cron_turns: 10, channel_turns: 30, default_turns: 50 }
    }
}

/// Context-pruning knobs (see the pruning engine for semantics).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneConfig {
    pub soft_trim_ratio: f64,
    pub hard_clear_ratio: f64,
    pub keep_last_assistants: usize,
    pub soft_trim_max_chars: usize,
    pub soft_trim_head_chars: usize,
    pub soft_trim_tail_chars: usize,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            soft_trim_ratio: 0.30,
            hard_clear_ratio: 0.50,
            keep_last_assistants: 3,
            soft_trim_max_chars: 4_000,
            soft_trim_head_chars: 1_500,
            soft_trim_tail_chars: 1_500,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("freja");
        Self {
            gateway: GatewayConfig {
                host: "127.0.0.1".into(),
                port: 8600,
                request_timeout_ms: 30_000,
                ping_interval_secs: 60,
            },
            webhook: WebhookConfig { host: "127.0.0.1".into(), port: 8601 },
            storage: StorageConfig {
                sessions_backend: "jsonl".into(),
                sessions_root: data_root.join("sessions"),
                memory_root: data_root.join("memory"),
            },
            model: ModelConfig {
                provider: "mock".into(),
                model: "mock-model".into(),
                api_key: None,
                context_window: 200_000,
            },
            embeddings: EmbeddingsConfig { provider: "hash".into(), api_key: None, endpoint: None },
            prune: PruneConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

impl Config {
    /// Defaults overlaid with any `FREJA_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_str("FREJA_GATEWAY_HOST") {
            cfg.gateway.host = v;
        }
        if let Some(v) = env_parse::<u16>("FREJA_GATEWAY_PORT") {
            cfg.gateway.port = v;
        }
        if let Some(v) = env_parse::<u64>("FREJA_REQUEST_TIMEOUT_MS") {
            cfg.gateway.request_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u64>("FREJA_PING_INTERVAL_SECS") {
            cfg.gateway.ping_interval_secs = v;
        }
        if let Some(v) = env_str("FREJA_WEBHOOK_HOST") {
            cfg.webhook.host = v;
        }
        if let Some(v) = env_parse::<u16>("FREJA_WEBHOOK_PORT") {
            cfg.webhook.port = v;
        }
        if let Some(v) = env_str("FREJA_SESSIONS_BACKEND") {
            cfg.storage.sessions_backend = v;
        }
        if let Some(v) = env_path("FREJA_SESSIONS_ROOT") {
            cfg.storage.sessions_root = v;
        }
        if let Some(v) = env_path("FREJA_MEMORY_ROOT") {
            cfg.storage.memory_root = v;
        }
        if let Some(v) = env_str("FREJA_MODEL_PROVIDER") {
            cfg.model.provider = v;
        }
        if let Some(v) = env_str("FREJA_MODEL") {
            cfg.model.model = v;
        }
        if let Some(v) = env_str("FREJA_MODEL_API_KEY") {
            cfg.model.api_key = Some(v);
        }
        if let Some(v) = env_parse::<usize>("FREJA_CONTEXT_WINDOW") {
            cfg.model.context_window = v;
        }
        if let Some(v) = env_str("FREJA_EMBEDDINGS_PROVIDER") {
            cfg.embeddings.provider = v;
        }
        if let Some(v) = env_str("FREJA_EMBEDDINGS_API_KEY") {
            cfg.embeddings.api_key = Some(v);
        }
        if let Some(v) = env_str("FREJA_EMBEDDINGS_ENDPOINT") {
            cfg.embeddings.endpoint = Some(v);
        }
        if let Some(v) = env_parse::<f64>("FREJA_SOFT_TRIM_RATIO") {
            cfg.prune.soft_trim_ratio = v;
        }
        if let Some(v) = env_parse::<f64>("FREJA_HARD_CLEAR_RATIO") {
            cfg.prune.hard_clear_ratio = v;
        }
        if let Some(v) = env_parse::<usize>("FREJA_KEEP_LAST_ASSISTANTS") {
            cfg.prune.keep_last_assistants = v;
        }
        if let Some(v) = env_parse::<usize>("FREJA_SOFT_TRIM_MAX_CHARS") {
            cfg.prune.soft_trim_max_chars = v;
        }
        if let Some(v) = env_parse::<usize>("FREJA_HISTORY_TURNS_CRON") {
            cfg.history.cron_turns = v;
        }
        if let Some(v) = env_parse::<usize>("FREJA_HISTORY_TURNS_CHANNEL") {
            cfg.history.channel_turns = v;
        }
        if let Some(v) = env_parse::<usize>("FREJA_HISTORY_TURNS_DEFAULT") {
            cfg.history.default_turns = v;
        }
        cfg
    }

    /// `ws://host:port/ws` for service clients.
    pub fn gateway_url(&self) -> String {
        format!("ws://{}:{}/ws", self.gateway.host, self.gateway.port)
    }
}

// ─── Env helpers ──────────────────────────────────────────────────────────────

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_path(name: &str) -> Option<PathBuf> {
    env_str(name).map(|v| PathBuf::from(shellexpand::tilde(&v).into_owned()))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_str(name)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
