// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: Apache-2.0
//! Routing state shared by every gateway connection.
//!
//! Lock discipline: the service map mutex is held only for the lookup or
//! swap itself, never across a send or any other await. In-flight request
//! routes live in a lock-free map keyed by the globally-unique hop id the
//! broker assigns per forwarded request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use freja_protocol::{ErrorCode, Frame, ServiceRegistration};

/// Messages queued toward one connection's socket.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    /// Ask the connection loop to close; carries the reason for the log.
    Close(&'static str),
}

pub type OutboundSender = mpsc::Sender<Outbound>;

/// One live service registration.
pub struct ServiceEntry {
    pub registration: ServiceRegistration,
    pub conn_id: u64,
    pub outbound: OutboundSender,
}

/// A forwarded request awaiting its response.
struct PendingRoute {
    caller_conn: u64,
    caller_tx: OutboundSender,
    callee_conn: u64,
    original_id: String,
}

pub struct GatewayState {
    /// Service name → live entry. At most one connection per name.
    services: Mutex<HashMap<String, ServiceEntry>>,
    /// Hop id → route back to the caller. Shared with the per-request
    /// deadline watchdogs.
    pending: std::sync::Arc<DashMap<String, PendingRoute>>,
    next_conn: AtomicU64,
    next_hop: AtomicU64,
    pub request_timeout: Duration,
    pub ping_interval: Duration,
}

impl GatewayState {
    pub fn new(request_timeout: Duration, ping_interval: Duration) -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
            pending: std::sync::Arc::new(DashMap::new()),
            next_conn: AtomicU64::new(1),
            next_hop: AtomicU64::new(1),
            request_timeout,
            ping_interval,
        }
    }

    pub fn allocate_conn_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a service; a duplicate name preempts the prior connection.
    pub async fn register(
        &self,
        registration: ServiceRegistration,
        conn_id: u64,
        outbound: OutboundSender,
    ) {
        let name = registration.service.clone();
        let previous = {
            let mut services = self.services.lock().await;
            services.insert(
                name.clone(),
                ServiceEntry { registration, conn_id, outbound },
            )
        };
        if let Some(old) = previous {
            warn!(service = %name, old_conn = old.conn_id, new_conn = conn_id, "registration preempted");
            let _ = old.outbound.try_send(Outbound::Close("preempted"));
        } else {
            debug!(service = %name, conn = conn_id, "service registered");
        }
    }

    /// Drop the registration owned by `conn_id`, if it is still current,
    /// and fail every pending request that conn was part of.
    pub async fn disconnect(&self, conn_id: u64) {
        {
            let mut services = self.services.lock().await;
            services.retain(|_, entry| entry.conn_id != conn_id);
        }
        // Requests this conn was serving: tell the caller. Requests this
        // conn had issued: nobody is left to deliver to; drop them.
        let affected: Vec<String> = self
            .pending
            .iter()
            .filter(|r| r.callee_conn == conn_id || r.caller_conn == conn_id)
            .map(|r| r.key().clone())
            .collect();
        for hop_id in affected {
            if let Some((_, route)) = self.pending.remove(&hop_id) {
                if route.callee_conn == conn_id && route.caller_conn != conn_id {
                    let _ = route.caller_tx.try_send(Outbound::Frame(Frame::err(
                        route.original_id,
                        ErrorCode::Disconnected,
                        "service disconnected before responding",
                    )));
                }
            }
        }
    }

    /// Route a request from `caller` toward its target service. Any
    /// routing failure is answered directly on the caller's connection.
    pub async fn route_request(
        &self,
        caller_conn: u64,
        caller_tx: &OutboundSender,
        id: String,
        target: String,
        method: String,
        params: serde_json::Value,
        timeout_ms: Option<u64>,
    ) {
        let (callee_tx, callee_conn) = {
            let services = self.services.lock().await;
            match services.get(&target) {
                None => {
                    let _ = caller_tx.try_send(Outbound::Frame(Frame::err(
                        id,
                        ErrorCode::NoService,
                        format!("no such service: {target}"),
                    )));
                    return;
                }
                Some(entry) => {
                    if !entry.registration.methods.iter().any(|m| m == &method) {
                        let _ = caller_tx.try_send(Outbound::Frame(Frame::err(
                            id,
                            ErrorCode::NoMethod,
                            format!("{target} does not declare method {method}"),
                        )));
                        return;
                    }
                    (entry.outbound.clone(), entry.conn_id)
                }
            }
        };

        let hop_id = format!("g{}", self.next_hop.fetch_add(1, Ordering::Relaxed));
        self.pending.insert(
            hop_id.clone(),
            PendingRoute {
                caller_conn,
                caller_tx: caller_tx.clone(),
                callee_conn,
                original_id: id,
            },
        );

        let forwarded = Frame::Req {
            id: hop_id.clone(),
            target,
            method,
            params,
            timeout_ms,
        };
        if callee_tx.send(Outbound::Frame(forwarded)).await.is_err() {
            if let Some((_, route)) = self.pending.remove(&hop_id) {
                let _ = route.caller_tx.try_send(Outbound::Frame(Frame::err(
                    route.original_id,
                    ErrorCode::Disconnected,
                    "service connection closed",
                )));
            }
            return;
        }

        // Deadline watchdog: resolve with TIMEOUT unless the response
        // already claimed the route. A late response finds no route and is
        // dropped.
        let timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.request_timeout);
        let pending = self.pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, route)) = pending.remove(&hop_id) {
                let _ = route.caller_tx.try_send(Outbound::Frame(Frame::err(
                    route.original_id,
                    ErrorCode::Timeout,
                    format!("request timed out after {} ms", timeout.as_millis()),
                )));
            }
        });
    }

    /// Deliver a response to whoever issued the hop. Unknown hops (late or
    /// duplicate responses) are dropped silently.
    pub async fn route_response(&self, hop_id: String, ok: bool, payload: Option<serde_json::Value>, error: Option<freja_protocol::ErrorBody>) {
        match self.pending.remove(&hop_id) {
            Some((_, route)) => {
                let _ = route
                    .caller_tx
                    .send(Outbound::Frame(Frame::Res {
                        id: route.original_id,
                        ok,
                        payload,
                        error,
                    }))
                    .await;
            }
            None => debug!(hop = %hop_id, "dropping response with no pending request"),
        }
    }

    /// Fan an event out to every subscriber except the publisher.
    /// Best-effort, ordered per receiver by their outbound queue.
    pub async fn fan_out(&self, publisher_conn: u64, source: String, event: String, payload: serde_json::Value) {
        let targets: Vec<OutboundSender> = {
            let services = self.services.lock().await;
            services
                .values()
                .filter(|entry| entry.conn_id != publisher_conn)
                .filter(|entry| entry.registration.subscriptions.iter().any(|s| s == &event))
                .map(|entry| entry.outbound.clone())
                .collect()
        };
        let frame = Frame::Event { source, event, payload };
        for tx in targets {
            let _ = tx.send(Outbound::Frame(frame.clone())).await;
        }
    }

    /// Names of currently registered services (diagnostics).
    pub async fn service_names(&self) -> Vec<String> {
        let services = self.services.lock().await;
        let mut names: Vec<String> = services.keys().cloned().collect();
        names.sort();
        names
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> GatewayState {
        GatewayState::new(Duration::from_millis(200), Duration::from_secs(60))
    }

    fn registration(name: &str, methods: &[&str], subs: &[&str]) -> ServiceRegistration {
        ServiceRegistration {
            service: name.into(),
            version: "1".into(),
            methods: methods.iter().map(|s| s.to_string()).collect(),
            events: vec![],
            subscriptions: subs.iter().map(|s| s.to_string()).collect(),
        }
    }

    async fn expect_frame(rx: &mut mpsc::Receiver<Outbound>) -> Frame {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(Outbound::Frame(frame))) => frame,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_target_resolves_no_service() {
        let state = state();
        let (caller_tx, mut caller_rx) = mpsc::channel(8);
        state
            .route_request(1, &caller_tx, "r1".into(), "ghost".into(), "m".into(), serde_json::Value::Null, None)
            .await;
        match expect_frame(&mut caller_rx).await {
            Frame::Res { id, ok, error, .. } => {
                assert_eq!(id, "r1");
                assert!(!ok);
                assert_eq!(error.unwrap().code, ErrorCode::NoService);
            }
            other => panic!("expected res, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn undeclared_method_resolves_no_method() {
        let state = state();
        let (svc_tx, _svc_rx) = mpsc::channel(8);
        state.register(registration("tools", &["tool.list"], &[]), 2, svc_tx).await;

        let (caller_tx, mut caller_rx) = mpsc::channel(8);
        state
            .route_request(1, &caller_tx, "r1".into(), "tools".into(), "tool.nuke".into(), serde_json::Value::Null, None)
            .await;
        match expect_frame(&mut caller_rx).await {
            Frame::Res { error, .. } => assert_eq!(error.unwrap().code, ErrorCode::NoMethod),
            other => panic!("expected res, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_is_forwarded_with_a_hop_id_and_answered() {
        let state = state();
        let (svc_tx, mut svc_rx) = mpsc::channel(8);
        state.register(registration("tools", &["tool.list"], &[]), 2, svc_tx).await;

        let (caller_tx, mut caller_rx) = mpsc::channel(8);
        state
            .route_request(
                1,
                &caller_tx,
                "caller-7".into(),
                "tools".into(),
                "tool.list".into(),
                serde_json::json!({"q": 1}),
                None,
            )
            .await;

        let hop_id = match expect_frame(&mut svc_rx).await {
            Frame::Req { id, method, .. } => {
                assert!(id.starts_with('g'), "broker assigns its own hop id");
                assert_ne!(id, "caller-7");
                assert_eq!(method, "tool.list");
                id
            }
            other => panic!("expected forwarded req, got {other:?}"),
        };

        state
            .route_response(hop_id, true, Some(serde_json::json!({"tools": []})), None)
            .await;
        match expect_frame(&mut caller_rx).await {
            Frame::Res { id, ok, .. } => {
                assert_eq!(id, "caller-7", "caller sees its own id back");
                assert!(ok);
            }
            other => panic!("expected res, got {other:?}"),
        }
        assert_eq!(state.pending_len(), 0);
    }

    #[tokio::test]
    async fn stranded_request_times_out() {
        let state = state();
        let (svc_tx, _svc_rx) = mpsc::channel(8);
        state.register(registration("slow", &["m"], &[]), 2, svc_tx).await;

        let (caller_tx, mut caller_rx) = mpsc::channel(8);
        state
            .route_request(1, &caller_tx, "r".into(), "slow".into(), "m".into(), serde_json::Value::Null, Some(50))
            .await;
        match expect_frame(&mut caller_rx).await {
            Frame::Res { error, .. } => assert_eq!(error.unwrap().code, ErrorCode::Timeout),
            other => panic!("expected timeout res, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn late_response_is_dropped() {
        let state = state();
        // No pending route exists; this must not panic or send anything.
        state.route_response("g999".into(), true, None, None).await;
        assert_eq!(state.pending_len(), 0);
    }

    #[tokio::test]
    async fn duplicate_registration_preempts_the_old_connection() {
        let state = state();
        let (old_tx, mut old_rx) = mpsc::channel(8);
        state.register(registration("agent", &[], &[]), 1, old_tx).await;
        let (new_tx, _new_rx) = mpsc::channel(8);
        state.register(registration("agent", &[], &[]), 2, new_tx).await;

        match old_rx.recv().await {
            Some(Outbound::Close(reason)) => assert_eq!(reason, "preempted"),
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(state.service_names().await, vec!["agent"]);
    }

    #[tokio::test]
    async fn stale_disconnect_does_not_remove_the_new_registration() {
        let state = state();
        let (old_tx, _old_rx) = mpsc::channel(8);
        state.register(registration("agent", &[], &[]), 1, old_tx).await;
        let (new_tx, _new_rx) = mpsc::channel(8);
        state.register(registration("agent", &[], &[]), 2, new_tx).await;

        // The preempted connection dying later must not unregister conn 2.
        state.disconnect(1).await;
        assert_eq!(state.service_names().await, vec!["agent"]);
        state.disconnect(2).await;
        assert!(state.service_names().await.is_empty());
    }

    #[tokio::test]
    async fn events_fan_out_to_subscribers_but_not_the_publisher() {
        let state = state();
        let (pub_tx, mut pub_rx) = mpsc::channel(8);
        state
            .register(registration("channels", &[], &["message.received"]), 1, pub_tx)
            .await;
        let (sub_tx, mut sub_rx) = mpsc::channel(8);
        state
            .register(registration("agent", &[], &["message.received"]), 2, sub_tx)
            .await;
        let (other_tx, mut other_rx) = mpsc::channel(8);
        state.register(registration("cron", &[], &["cron.trigger"]), 3, other_tx).await;

        state
            .fan_out(1, "channels".into(), "message.received".into(), serde_json::json!({"k": "v"}))
            .await;

        match expect_frame(&mut sub_rx).await {
            Frame::Event { source, event, .. } => {
                assert_eq!(source, "channels");
                assert_eq!(event, "message.received");
            }
            other => panic!("expected event, got {other:?}"),
        }
        assert!(pub_rx.try_recv().is_err(), "publisher must not hear itself");
        assert!(other_rx.try_recv().is_err(), "non-subscriber must not receive");
    }

    #[tokio::test]
    async fn callee_disconnect_fails_pending_requests() {
        let state = state();
        let (svc_tx, mut svc_rx) = mpsc::channel(8);
        state.register(registration("flaky", &["m"], &[]), 2, svc_tx).await;

        let (caller_tx, mut caller_rx) = mpsc::channel(8);
        state
            .route_request(1, &caller_tx, "r".into(), "flaky".into(), "m".into(), serde_json::Value::Null, Some(5_000))
            .await;
        let _ = expect_frame(&mut svc_rx).await;

        state.disconnect(2).await;
        match expect_frame(&mut caller_rx).await {
            Frame::Res { error, .. } => {
                assert_eq!(error.unwrap().code, ErrorCode::Disconnected)
            }
            other => panic!("expected res, got {other:?}"),
        }
    }
}
