// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use freja_protocol::{decode_frame, encode_frame, ErrorCode, Frame};

use crate::handler::ServiceHandler;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// The deadline elapsed before a response arrived.
    #[error("TIMEOUT")]
    Timeout,
    /// The connection dropped while the request was pending, or there was
    /// no connection to send on.
    #[error("DISCONNECTED")]
    Disconnected,
    /// The remote answered with a structured error.
    #[error("{code}: {message}")]
    Remote { code: ErrorCode, message: String },
}

// ─── Settings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub default_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(freja_protocol::DEFAULT_REQUEST_TIMEOUT_MS),
            reconnect_base: Duration::from_millis(200),
            reconnect_cap: Duration::from_secs(30),
            max_reconnect_attempts: 20,
        }
    }
}

/// Exponential backoff for reconnect attempt `n` (1-based), capped.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let delay = base.saturating_mul(1u32 << exp.min(16));
    delay.min(cap)
}

// ─── Client internals ─────────────────────────────────────────────────────────

struct ClientInner {
    url: String,
    name: String,
    handler: Arc<dyn ServiceHandler>,
    settings: ServiceSettings,
    /// Request id → resolver. Rejected wholesale on disconnect.
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value, CallError>>>>,
    /// The live connection's outbound queue; `None` while disconnected.
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl ClientInner {
    fn send_text(&self, text: String) -> bool {
        let guard = self.outbound.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx.try_send(text).is_ok(),
            None => false,
        }
    }

    fn reject_all_pending(&self, error: CallError) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

/// Cloneable face of a service connection: `call`, `emit`, and identity.
/// Handed to [`ServiceHandler`] hooks so handlers can reach peers.
#[derive(Clone)]
pub struct ServiceHandle {
    inner: Arc<ClientInner>,
}

impl ServiceHandle {
    pub fn service_name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_connected(&self) -> bool {
        self.inner.outbound.lock().unwrap().is_some()
    }

    /// RPC to another service. Resolves with the remote payload or fails
    /// with `TIMEOUT`, `DISCONNECTED`, or the remote's structured error.
    pub async fn call(
        &self,
        target: &str,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        let inner = &self.inner;
        if inner.outbound.lock().unwrap().is_none() {
            return Err(CallError::Disconnected);
        }

        let id = format!(
            "{}-{}",
            inner.name,
            inner.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let (tx, rx) = oneshot::channel();
        inner.pending.lock().unwrap().insert(id.clone(), tx);

        let frame = Frame::Req {
            id: id.clone(),
            target: target.to_string(),
            method: method.to_string(),
            params,
            timeout_ms: timeout.map(|d| d.as_millis() as u64),
        };
        let text = match encode_frame(&frame) {
            Ok(text) => text,
            Err(e) => {
                inner.pending.lock().unwrap().remove(&id);
                return Err(CallError::Remote {
                    code: ErrorCode::BadRequest,
                    message: format!("unencodable params: {e}"),
                });
            }
        };
        if !inner.send_text(text) {
            inner.pending.lock().unwrap().remove(&id);
            return Err(CallError::Disconnected);
        }

        // The broker resolves stranded requests with TIMEOUT; the local
        // deadline is a slightly-later backstop for a dead broker.
        let deadline =
            timeout.unwrap_or(inner.settings.default_timeout) + Duration::from_millis(500);
        match tokio::time::timeout(deadline, rx).await {
            Err(_) => {
                inner.pending.lock().unwrap().remove(&id);
                Err(CallError::Timeout)
            }
            Ok(Err(_)) => Err(CallError::Disconnected),
            Ok(Ok(result)) => result,
        }
    }

    /// Fire-and-forget event publication. Silently dropped when
    /// disconnected.
    pub fn emit(&self, event: &str, payload: Value) {
        let frame = Frame::Event {
            source: self.inner.name.clone(),
            event: event.to_string(),
            payload,
        };
        if let Ok(text) = encode_frame(&frame) {
            if !self.inner.send_text(text) {
                debug!(service = %self.inner.name, event, "emit dropped while disconnected");
            }
        }
    }
}

// ─── Client ───────────────────────────────────────────────────────────────────

/// Owns the connection task. Dropping the client tears the connection
/// down; clone the [`ServiceHandle`] for everything else.
pub struct ServiceClient {
    handle: ServiceHandle,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ServiceClient {
    /// Connect to the gateway at `url` and keep the service registered
    /// there until shutdown.
    pub fn spawn(
        url: impl Into<String>,
        handler: Arc<dyn ServiceHandler>,
        settings: ServiceSettings,
    ) -> Self {
        let name = handler.registration().service;
        let inner = Arc::new(ClientInner {
            url: url.into(),
            name,
            handler,
            settings,
            pending: Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });
        let handle = ServiceHandle { inner: Arc::clone(&inner) };
        let task = tokio::spawn(connection_loop(inner));
        Self { handle, task: Some(task) }
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    /// Wait until the registration handshake has completed (test aid;
    /// gives up after `deadline`).
    pub async fn wait_connected(&self, deadline: Duration) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            if self.handle.is_connected() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub async fn shutdown(mut self) {
        self.handle.inner.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ServiceClient {
    fn drop(&mut self) {
        self.handle.inner.shutdown.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ─── Connection pump ──────────────────────────────────────────────────────────

async fn connection_loop(inner: Arc<ClientInner>) {
    let mut attempts = 0u32;
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        match tokio_tungstenite::connect_async(inner.url.as_str()).await {
            Ok((ws, _)) => {
                info!(service = %inner.name, url = %inner.url, "connected to gateway");
                attempts = 0;
                run_connection(&inner, ws).await;
                *inner.outbound.lock().unwrap() = None;
                inner.reject_all_pending(CallError::Disconnected);
                debug!(service = %inner.name, "disconnected from gateway");
            }
            Err(e) => {
                debug!(service = %inner.name, "gateway connect failed: {e}");
            }
        }
        if inner.shutdown.is_cancelled() {
            break;
        }
        attempts += 1;
        if attempts > inner.settings.max_reconnect_attempts {
            warn!(service = %inner.name, attempts, "giving up on gateway reconnect");
            break;
        }
        let delay = backoff_delay(
            attempts,
            inner.settings.reconnect_base,
            inner.settings.reconnect_cap,
        );
        let jitter = Duration::from_millis(rand::Rng::gen_range(&mut rand::thread_rng(), 0..50));
        tokio::select! {
            _ = tokio::time::sleep(delay + jitter) => {}
            _ = inner.shutdown.cancelled() => break,
        }
    }
}

async fn run_connection(
    inner: &Arc<ClientInner>,
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    let (mut sink, mut stream) = ws.split();

    // Handshake: the registration (with declared subscriptions) goes first.
    let reg = Frame::Reg(inner.handler.registration());
    let Ok(text) = encode_frame(&reg) else { return };
    if sink.send(Message::Text(text)).await.is_err() {
        return;
    }

    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    *inner.outbound.lock().unwrap() = Some(out_tx);

    let handle = ServiceHandle { inner: Arc::clone(inner) };
    inner.handler.on_connected(&handle).await;

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(frame) = decode_frame(&text) {
                            dispatch_frame(inner, frame);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(service = %inner.name, "socket error: {e}");
                        return;
                    }
                }
            }
            queued = out_rx.recv() => {
                match queued {
                    Some(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
            _ = inner.shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
        }
    }
}

/// Requests and events run in their own tasks so a slow handler never
/// stalls the read pump; responses resolve the pending table inline.
fn dispatch_frame(inner: &Arc<ClientInner>, frame: Frame) {
    match frame {
        Frame::Res { id, ok, payload, error } => {
            let resolver = inner.pending.lock().unwrap().remove(&id);
            let Some(tx) = resolver else {
                // Response without a matching pending request: dropped.
                debug!(service = %inner.name, id, "dropping unmatched response");
                return;
            };
            let result = if ok {
                Ok(payload.unwrap_or(Value::Null))
            } else {
                let body = error.unwrap_or(freja_protocol::ErrorBody {
                    code: ErrorCode::HandlerError,
                    message: "malformed error response".into(),
                });
                Err(match body.code {
                    ErrorCode::Timeout => CallError::Timeout,
                    ErrorCode::Disconnected => CallError::Disconnected,
                    code => CallError::Remote { code, message: body.message },
                })
            };
            let _ = tx.send(result);
        }

        Frame::Req { id, method, params, timeout_ms, .. } => {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let handle = ServiceHandle { inner: Arc::clone(&inner) };
                let deadline = timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(inner.settings.default_timeout);
                let outcome = tokio::time::timeout(
                    deadline,
                    inner.handler.handle_method(&method, params, &handle),
                )
                .await;
                let response = match outcome {
                    Err(_) => Frame::err(id, ErrorCode::Timeout, "handler exceeded deadline"),
                    Ok(Ok(payload)) => Frame::ok(id, payload),
                    Ok(Err(e)) => Frame::err(id, e.code, e.message),
                };
                if let Ok(text) = encode_frame(&response) {
                    inner.send_text(text);
                }
            });
        }

        Frame::Event { event, payload, .. } => {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let handle = ServiceHandle { inner: Arc::clone(&inner) };
                inner.handler.handle_event(&event, payload, &handle).await;
            });
        }

        Frame::Reg(_) => {
            // The broker never sends registrations; drop.
        }
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_starts_at_base_and_doubles() {
        let base = Duration::from_millis(200);
        let cap = Duration::from_secs(30);
        assert_eq!(backoff_delay(1, base, cap), Duration::from_millis(200));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_millis(400));
        assert_eq!(backoff_delay(3, base, cap), Duration::from_millis(800));
    }

    #[test]
    fn backoff_caps_at_thirty_seconds() {
        let base = Duration::from_millis(200);
        let cap = Duration::from_secs(30);
        assert_eq!(backoff_delay(10, base, cap), cap);
        assert_eq!(backoff_delay(20, base, cap), cap);
    }

    #[test]
    fn call_errors_display_their_codes() {
        assert_eq!(CallError::Timeout.to_string(), "TIMEOUT");
        assert_eq!(CallError::Disconnected.to_string(), "DISCONNECTED");
        let remote = CallError::Remote {
            code: ErrorCode::NoService,
            message: "no such service".into(),
        };
        assert!(remote.to_string().starts_with("NO_SERVICE"));
    }
}
