// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

use freja_protocol::{ErrorCode, ServiceRegistration};

use crate::client::ServiceHandle;

/// A structured method failure, carried back to the caller by code.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct MethodError {
    pub code: ErrorCode,
    pub message: String,
}

impl MethodError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::HandlerError, message)
    }
}

/// What a service brings to the bus: its registration plus the two
/// inbound hooks. Handlers must return within the request deadline or the
/// caller is told `TIMEOUT` regardless of what happens later.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    /// Name, version, methods, published events, subscriptions.
    fn registration(&self) -> ServiceRegistration;

    /// Answer one request addressed to this service. `peer` lets the
    /// handler call other services without holding its own client.
    async fn handle_method(
        &self,
        method: &str,
        params: Value,
        peer: &ServiceHandle,
    ) -> Result<Value, MethodError>;

    /// One fan-out delivery. Errors are the handler's own business; the
    /// client logs panics and never lets an event break the pump.
    async fn handle_event(&self, _event: &str, _payload: Value, _peer: &ServiceHandle) {}

    /// Invoked after each successful registration handshake (including
    /// reconnects).
    async fn on_connected(&self, _peer: &ServiceHandle) {}
}
