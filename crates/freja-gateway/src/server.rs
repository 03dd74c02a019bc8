// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: Apache-2.0
//! WebSocket front of the broker.
//!
//! One receive loop per socket; sends go through a per-connection outbound
//! queue so fan-out never blocks on a slow peer's socket. Liveness: a ping
//! every interval, close after two silent intervals.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use freja_protocol::{decode_frame, encode_frame, Frame};

use crate::broker::{GatewayState, Outbound};

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,
    pub request_timeout: Duration,
    pub ping_interval: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            // Loopback only; the bus is not meant to leave the host.
            host: "127.0.0.1".into(),
            port: 8600,
            request_timeout: Duration::from_millis(
                freja_protocol::DEFAULT_REQUEST_TIMEOUT_MS,
            ),
            ping_interval: Duration::from_secs(freja_protocol::KEEPALIVE_INTERVAL_SECS),
        }
    }
}

/// A running gateway: its state handle plus the bound address.
pub struct Gateway {
    state: Arc<GatewayState>,
    local_addr: SocketAddr,
    server: tokio::task::JoinHandle<()>,
}

impl Gateway {
    /// Bind and start serving. Pass port 0 for an ephemeral port (tests).
    pub async fn bind(settings: GatewaySettings) -> anyhow::Result<Self> {
        let state = Arc::new(GatewayState::new(
            settings.request_timeout,
            settings.ping_interval,
        ));
        let router = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(Arc::clone(&state));

        let listener =
            tokio::net::TcpListener::bind((settings.host.as_str(), settings.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "gateway listening");

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!("gateway server stopped: {e}");
            }
        });

        Ok(Self { state, local_addr, server })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<GatewayState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One connection's lifetime: registration, then frame pumping until the
/// peer goes away or falls silent.
async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>) {
    let conn_id = state.allocate_conn_id();
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(64);

    let mut ping_timer = tokio::time::interval(state.ping_interval);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_timer.reset();
    let mut silent_intervals = 0u32;
    let mut service_name: Option<String> = None;

    debug!(conn = conn_id, "connection open");
    loop {
        tokio::select! {
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        silent_intervals = 0;
                        let Some(frame) = decode_frame(&text) else {
                            // Unrecognized frames are dropped silently.
                            continue;
                        };
                        handle_frame(&state, conn_id, &out_tx, &mut service_name, frame).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        silent_intervals = 0;
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        silent_intervals = 0;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!(conn = conn_id, "socket error: {e}");
                        break;
                    }
                }
            }
            queued = out_rx.recv() => {
                match queued {
                    Some(Outbound::Frame(frame)) => {
                        let Ok(text) = encode_frame(&frame) else { continue };
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close(reason)) => {
                        debug!(conn = conn_id, reason, "closing connection");
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    None => break,
                }
            }
            _ = ping_timer.tick() => {
                silent_intervals += 1;
                if silent_intervals > 2 {
                    warn!(conn = conn_id, service = ?service_name, "peer silent through two keepalives, closing");
                    break;
                }
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.disconnect(conn_id).await;
    debug!(conn = conn_id, service = ?service_name, "connection closed");
}

async fn handle_frame(
    state: &Arc<GatewayState>,
    conn_id: u64,
    out_tx: &mpsc::Sender<Outbound>,
    service_name: &mut Option<String>,
    frame: Frame,
) {
    match frame {
        Frame::Reg(registration) => {
            *service_name = Some(registration.service.clone());
            state.register(registration, conn_id, out_tx.clone()).await;
        }
        Frame::Req { id, target, method, params, timeout_ms } => {
            state
                .route_request(conn_id, out_tx, id, target, method, params, timeout_ms)
                .await;
        }
        Frame::Res { id, ok, payload, error } => {
            state.route_response(id, ok, payload, error).await;
        }
        Frame::Event { event, payload, .. } => {
            // The broker stamps the source from the registration rather
            // than trusting the frame.
            let source = service_name.clone().unwrap_or_default();
            state.fan_out(conn_id, source, event, payload).await;
        }
    }
}
