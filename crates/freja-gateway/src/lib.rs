// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: Apache-2.0
//! The gateway broker: a process-local hub every service connects to.
//!
//! Services register over a loopback WebSocket, declare the methods they
//! answer and the events they subscribe to, and from then on the broker
//! routes each request to exactly one handler, fans events out to
//! subscribers, times out stranded requests, and survives reconnects.
//! The control plane knows nothing about agents; it moves frames.

mod broker;
mod server;

pub use broker::{GatewayState, ServiceEntry};
pub use server::{Gateway, GatewaySettings};
