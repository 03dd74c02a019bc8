// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! The channel service: the seam between chat adapters and the bus.
//!
//! Inbound adapter events become session tasks plus a `message.received`
//! fan-out; outbound replies go through `channel.send`, which strips
//! heartbeat tokens and suppresses pure-heartbeat deliveries before the
//! adapter ever sees them. Concrete adapter SDKs stay outside; anything
//! implementing [`ChannelAdapter`] plugs in.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use freja_core::HEARTBEAT_TOKEN;
use freja_model::ChatMessage;
use freja_protocol::ServiceRegistration;
use freja_service::{MethodError, ServiceHandle, ServiceHandler};
use freja_store::{ensure_session, SessionStore};

// ─── Adapter boundary ─────────────────────────────────────────────────────────

/// One inbound message from a messaging platform.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: String,
    pub user_id: String,
    pub text: String,
}

/// A messaging platform backend. Outbound chunking is the adapter's
/// concern; the service hands it clean text.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, user_id: &str, text: &str) -> anyhow::Result<()>;
}

/// Adapter that logs outbound messages and records them for inspection.
/// Stands in for real platform SDKs in tests and local runs.
pub struct ConsoleAdapter {
    name: String,
    pub sent: Mutex<Vec<(String, String)>>,
}

impl ConsoleAdapter {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self { name: name.into(), sent: Mutex::new(Vec::new()) })
    }
}

#[async_trait]
impl ChannelAdapter for ConsoleAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, user_id: &str, text: &str) -> anyhow::Result<()> {
        info!(channel = %self.name, user = %user_id, "outbound: {text}");
        self.sent.lock().await.push((user_id.to_string(), text.to_string()));
        Ok(())
    }
}

// ─── Service ──────────────────────────────────────────────────────────────────

pub struct ChannelService {
    store: Arc<dyn SessionStore>,
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
    handle: OnceLock<ServiceHandle>,
}

impl ChannelService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        adapters: Vec<Arc<dyn ChannelAdapter>>,
    ) -> Arc<Self> {
        let adapters = adapters
            .into_iter()
            .map(|a| (a.name().to_string(), a))
            .collect();
        Arc::new(Self { store, adapters, handle: OnceLock::new() })
    }

    /// Entry point adapters feed. Ensures the session, appends the task,
    /// and announces `message.received` on the bus.
    pub async fn inbound(&self, message: InboundMessage) -> anyhow::Result<()> {
        let session_key = format!("{}:{}", message.channel, message.user_id);
        ensure_session(self.store.as_ref(), &session_key, Some(message.user_id.clone()))
            .await?;
        self.store
            .add_message(
                &session_key,
                ChatMessage::user(&message.text).with_metadata(json!({
                    "type": "task",
                    "channel": message.channel,
                    "userId": message.user_id,
                })),
            )
            .await?;

        match self.handle.get() {
            Some(handle) => handle.emit(
                "message.received",
                json!({
                    "channel": message.channel,
                    "userId": message.user_id,
                    "sessionKey": session_key,
                    "content": message.text,
                }),
            ),
            None => warn!("inbound message before gateway connection; event not emitted"),
        }
        Ok(())
    }

    async fn send(&self, params: Value) -> Result<Value, MethodError> {
        let channel = params
            .get("channel")
            .and_then(Value::as_str)
            .ok_or_else(|| MethodError::bad_request("missing channel"))?;
        let user_id = params
            .get("userId")
            .and_then(Value::as_str)
            .ok_or_else(|| MethodError::bad_request("missing userId"))?;
        let text = params
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| MethodError::bad_request("missing text"))?;

        let stripped = strip_heartbeat(text);
        if stripped.is_empty() {
            // A pure heartbeat acknowledgment is not a user-facing reply.
            return Ok(json!({ "delivered": false, "reason": "heartbeat" }));
        }

        let adapter = self
            .adapters
            .get(channel)
            .ok_or_else(|| MethodError::bad_request(format!("unknown channel: {channel}")))?;
        adapter
            .send(user_id, &stripped)
            .await
            .map_err(|e| MethodError::internal(format!("adapter send failed: {e}")))?;
        Ok(json!({ "delivered": true }))
    }
}

#[async_trait]
impl ServiceHandler for ChannelService {
    fn registration(&self) -> ServiceRegistration {
        ServiceRegistration {
            service: "channels".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            methods: vec!["channel.send".into()],
            events: vec!["message.received".into()],
            subscriptions: vec![],
        }
    }

    async fn handle_method(
        &self,
        method: &str,
        params: Value,
        _peer: &ServiceHandle,
    ) -> Result<Value, MethodError> {
        match method {
            "channel.send" => self.send(params).await,
            other => Err(MethodError::bad_request(format!("unknown method: {other}"))),
        }
    }

    async fn on_connected(&self, peer: &ServiceHandle) {
        let _ = self.handle.set(peer.clone());
    }
}

/// Remove heartbeat tokens and tidy the leftovers. Returns an empty
/// string for a pure-heartbeat reply.
pub fn strip_heartbeat(text: &str) -> String {
    text.replace(HEARTBEAT_TOKEN, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
