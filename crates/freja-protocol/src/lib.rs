// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//!
//! Wire protocol between services and the gateway broker.
//!
//! Four self-describing frames travel over an ordered duplex stream
//! (canonically a loopback WebSocket, one frame per text message):
//!
//! - **`req`**: an RPC request addressed to a named service.
//! - **`res`**: the response to exactly one prior request, matched by id.
//! - **`event`**: a pub/sub notification fanned out to subscribers.
//! - **`reg`**: the handshake a service sends immediately after connecting.
//!
//! Request ids are sender-scoped opaque strings; the broker never rewrites
//! the id a caller sees. Unrecognized frames are dropped silently.
//!
//! ```text
//! Service A                      Gateway                      Service B
//!    │── reg {service:"a"} ─────────►│                            │
//!    │                               │◄──── reg {service:"b"} ────│
//!    │── req {id:1, target:"b"} ────►│── req {id:g7, ...} ───────►│
//!    │◄─ res {id:1, ok:true} ────────│◄─ res {id:g7, ok:true} ────│
//!    │── event {event:"x.y"} ───────►│── event ──► every subscriber
//! ```

mod frame;

pub use frame::{
    decode_frame, encode_frame, ErrorBody, ErrorCode, Frame, ServiceRegistration,
};

/// Default deadline applied by the broker to a request whose frame carries
/// no `timeout_ms` override.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Interval between broker keepalive pings. A connection that stays silent
/// through two intervals is closed.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 60;
