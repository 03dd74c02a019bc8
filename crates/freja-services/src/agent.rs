// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: Apache-2.0
//! The agent service: the subscriber that turns trigger events into runs.
//!
//! It listens for `message.received`, `cron.trigger`, and
//! `webhook.trigger`, hands each to the runtime (which serializes per
//! session), and delivers the reply back: to the originating user for
//! chat, to every configured notify address for cron and webhooks. On a
//! failed run, users get a short classified notice instead of silence.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use freja_core::{RunConfig, RunError, Runtime, HEARTBEAT_TOKEN};
use freja_model::ChatMessage;
use freja_protocol::ServiceRegistration;
use freja_service::{MethodError, ServiceHandle, ServiceHandler};
use freja_store::{ensure_session, SessionStore};

pub struct AgentService {
    runtime: Arc<Runtime>,
    store: Arc<dyn SessionStore>,
}

impl AgentService {
    pub fn new(runtime: Arc<Runtime>, store: Arc<dyn SessionStore>) -> Arc<Self> {
        Arc::new(Self { runtime, store })
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    // ── Event reactions ───────────────────────────────────────────────────────

    async fn on_message_received(&self, payload: Value, peer: &ServiceHandle) {
        let Some(session_key) = str_field(&payload, "sessionKey") else { return };
        let channel = str_field(&payload, "channel").unwrap_or_default();
        let user_id = str_field(&payload, "userId").unwrap_or_default();

        let result = self
            .runtime
            .run(RunConfig {
                session_key: session_key.clone(),
                channel: Some(channel.clone()),
                ..Default::default()
            })
            .await;

        let text = match result {
            Ok(outcome) => outcome.reply,
            Err(RunError::QueueCleared) => return,
            Err(e) => format!("Something went wrong: {}", e.user_message()),
        };
        deliver(peer, &channel, &user_id, &text).await;
    }

    /// Shared path for cron and webhook triggers: a fresh task session,
    /// a run, fan-out to notify addresses.
    async fn on_trigger(&self, payload: Value, peer: &ServiceHandle) {
        let Some(session_key) = str_field(&payload, "sessionKey") else { return };
        let Some(task) = str_field(&payload, "task") else { return };
        let notify: Vec<String> = payload
            .get("notify")
            .and_then(Value::as_array)
            .map(|addresses| {
                addresses
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if let Err(e) = self.seed_task_session(&session_key, &task).await {
            warn!(session = %session_key, "could not seed trigger session: {e}");
            return;
        }

        let result = self
            .runtime
            .run(RunConfig { session_key: session_key.clone(), ..Default::default() })
            .await;

        let text = match result {
            Ok(outcome) => outcome.reply,
            Err(RunError::QueueCleared) => return,
            Err(e) => format!("Something went wrong: {}", e.user_message()),
        };

        // A heartbeat answering "all quiet" is not forwarded anywhere.
        if text.trim() == HEARTBEAT_TOKEN {
            info!(session = %session_key, "heartbeat acknowledged, not forwarding");
            return;
        }
        for address in notify {
            match split_channel_address(&address) {
                Some((channel, user_id)) => deliver(peer, channel, user_id, &text).await,
                None => warn!(address = %address, "unparseable notify address"),
            }
        }
    }

    async fn seed_task_session(&self, session_key: &str, task: &str) -> anyhow::Result<()> {
        ensure_session(self.store.as_ref(), session_key, None).await?;
        self.store
            .add_message(
                session_key,
                ChatMessage::user(task).with_metadata(json!({"type": "task"})),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ServiceHandler for AgentService {
    fn registration(&self) -> ServiceRegistration {
        ServiceRegistration {
            service: "agent".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            methods: vec!["agent.run".into(), "agent.spawn".into(), "agent.abort".into()],
            events: vec![],
            subscriptions: vec![
                "message.received".into(),
                "cron.trigger".into(),
                "webhook.trigger".into(),
            ],
        }
    }

    async fn handle_method(
        &self,
        method: &str,
        params: Value,
        _peer: &ServiceHandle,
    ) -> Result<Value, MethodError> {
        match method {
            "agent.run" => {
                let session_key = str_field(&params, "sessionKey")
                    .ok_or_else(|| MethodError::bad_request("missing sessionKey"))?;
                if let Some(task) = str_field(&params, "task") {
                    self.seed_task_session(&session_key, &task)
                        .await
                        .map_err(|e| MethodError::internal(e.to_string()))?;
                }
                let outcome = self
                    .runtime
                    .run(RunConfig { session_key, ..Default::default() })
                    .await
                    .map_err(|e| MethodError::internal(e.user_message()))?;
                Ok(json!({
                    "runId": outcome.run_id,
                    "reply": outcome.reply,
                }))
            }
            "agent.spawn" => {
                let parent = str_field(&params, "parentKey")
                    .ok_or_else(|| MethodError::bad_request("missing parentKey"))?;
                let task = str_field(&params, "task")
                    .ok_or_else(|| MethodError::bad_request("missing task"))?;
                let outcome = self
                    .runtime
                    .spawn_subagent(&parent, &task)
                    .await
                    .map_err(|e| MethodError::internal(e.user_message()))?;
                Ok(json!({
                    "runId": outcome.run_id,
                    "reply": outcome.reply,
                }))
            }
            "agent.abort" => {
                let run_id = str_field(&params, "runId")
                    .ok_or_else(|| MethodError::bad_request("missing runId"))?;
                let reason = str_field(&params, "reason").unwrap_or_else(|| "aborted".into());
                let aborted = self.runtime.abort_run(&run_id, &reason).await;
                Ok(json!({ "aborted": aborted }))
            }
            other => Err(MethodError::bad_request(format!("unknown method: {other}"))),
        }
    }

    async fn handle_event(&self, event: &str, payload: Value, peer: &ServiceHandle) {
        match event {
            "message.received" => self.on_message_received(payload, peer).await,
            "cron.trigger" | "webhook.trigger" => self.on_trigger(payload, peer).await,
            other => warn!(event = other, "unexpected event delivery"),
        }
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

async fn deliver(peer: &ServiceHandle, channel: &str, user_id: &str, text: &str) {
    let outcome = peer
        .call(
            "channels",
            "channel.send",
            json!({ "channel": channel, "userId": user_id, "text": text }),
            None,
        )
        .await;
    if let Err(e) = outcome {
        warn!(channel, user = user_id, "reply delivery failed: {e}");
    }
}

/// `<channel>:<userId>` notify addresses; user ids may contain colons.
pub fn split_channel_address(address: &str) -> Option<(&str, &str)> {
    let (channel, user_id) = address.split_once(':')?;
    if channel.is_empty() || user_id.is_empty() {
        return None;
    }
    Some((channel, user_id))
}

fn str_field(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(str::to_string)
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
