// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! Service client base: the long-lived gateway connection every service
//! extends.
//!
//! A service implements [`ServiceHandler`] and hands it to
//! [`ServiceClient::spawn`]. The client performs the registration
//! handshake, keeps the pending-request table, exposes `call`/`emit`
//! through a cloneable [`ServiceHandle`], and reconnects with exponential
//! backoff when the gateway drops the connection. While disconnected,
//! calls fail fast with `DISCONNECTED` and emits are silently dropped.

mod client;
mod handler;

pub use client::{backoff_delay, CallError, ServiceClient, ServiceHandle, ServiceSettings};
pub use handler::{MethodError, ServiceHandler};
