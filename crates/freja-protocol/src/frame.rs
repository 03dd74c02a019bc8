// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Frames ───────────────────────────────────────────────────────────────────

/// A single control-plane frame.
///
/// Serialized as JSON with a `type` tag (`req`, `res`, `event`, `reg`).
/// Field order is irrelevant; every frame round-trips through
/// [`encode_frame`] / [`decode_frame`] unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// RPC request addressed to `target`. `id` is unique per connection.
    Req {
        id: String,
        target: String,
        method: String,
        #[serde(default)]
        params: Value,
        /// Per-call deadline override in milliseconds. Absent → broker default.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },

    /// Response to the request with the same `id`. Exactly one of
    /// `payload` / `error` is meaningful, discriminated by `ok`.
    Res {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },

    /// Pub/sub notification. `source` is the publishing service's name.
    Event {
        source: String,
        event: String,
        #[serde(default)]
        payload: Value,
    },

    /// Registration handshake, first frame on every service connection.
    Reg(ServiceRegistration),
}

impl Frame {
    /// Successful response frame.
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Frame::Res {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    /// Failed response frame.
    pub fn err(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Frame::Res {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }
}

/// The `reg` frame body: what a service offers and listens to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServiceRegistration {
    pub service: String,
    pub version: String,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Structured error carried by a failed response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// Error kinds, propagated by code rather than by type name so that every
/// service (and every language a future client is written in) agrees on
/// the taxonomy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No live registration for the request's target service.
    #[error("NO_SERVICE")]
    NoService,
    /// The target is registered but did not declare the method.
    #[error("NO_METHOD")]
    NoMethod,
    /// The request deadline elapsed before a response arrived.
    #[error("TIMEOUT")]
    Timeout,
    /// The transport dropped while the request was in flight.
    #[error("DISCONNECTED")]
    Disconnected,
    /// A queued session message was discarded before it ran.
    #[error("QUEUE_CLEARED")]
    QueueCleared,
    /// A subagent asked for a tool outside its allow-list.
    #[error("PERMISSION_DENIED")]
    PermissionDenied,
    /// The handler raised; the service boundary converted it to a response.
    #[error("HANDLER_ERROR")]
    HandlerError,
    /// The request or params failed validation before dispatch.
    #[error("BAD_REQUEST")]
    BadRequest,
}

// ─── Codec ────────────────────────────────────────────────────────────────────

/// Encode a frame as a single-line JSON text message.
pub fn encode_frame(frame: &Frame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

/// Decode one text message into a frame. `None` means the message was not
/// a recognized frame and must be dropped silently.
pub fn decode_frame(text: &str) -> Option<Frame> {
    serde_json::from_str(text).ok()
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Round-trips ───────────────────────────────────────────────────────────

    #[test]
    fn req_round_trip() {
        let frame = Frame::Req {
            id: "r-1".into(),
            target: "tools".into(),
            method: "tool.execute".into(),
            params: json!({"name": "read_file"}),
            timeout_ms: None,
        };
        let text = encode_frame(&frame).unwrap();
        assert_eq!(decode_frame(&text), Some(frame));
    }

    #[test]
    fn res_ok_round_trip() {
        let frame = Frame::ok("r-1", json!({"done": true}));
        let text = encode_frame(&frame).unwrap();
        assert_eq!(decode_frame(&text), Some(frame));
    }

    #[test]
    fn res_err_round_trip() {
        let frame = Frame::err("r-2", ErrorCode::NoService, "no such service: x");
        let text = encode_frame(&frame).unwrap();
        assert_eq!(decode_frame(&text), Some(frame));
    }

    #[test]
    fn event_round_trip() {
        let frame = Frame::Event {
            source: "channels".into(),
            event: "message.received".into(),
            payload: json!({"sessionKey": "whatsapp:+491"}),
        };
        let text = encode_frame(&frame).unwrap();
        assert_eq!(decode_frame(&text), Some(frame));
    }

    #[test]
    fn reg_round_trip() {
        let frame = Frame::Reg(ServiceRegistration {
            service: "agent".into(),
            version: "0.4.0".into(),
            methods: vec!["agent.run".into()],
            events: vec![],
            subscriptions: vec!["message.received".into(), "cron.trigger".into()],
        });
        let text = encode_frame(&frame).unwrap();
        assert_eq!(decode_frame(&text), Some(frame));
    }

    // ── Wire shape ────────────────────────────────────────────────────────────

    #[test]
    fn frames_carry_snake_case_type_tags() {
        let req = encode_frame(&Frame::Req {
            id: "1".into(),
            target: "t".into(),
            method: "m".into(),
            params: Value::Null,
            timeout_ms: None,
        })
        .unwrap();
        assert!(req.contains("\"type\":\"req\""));

        let reg = encode_frame(&Frame::Reg(ServiceRegistration::default())).unwrap();
        assert!(reg.contains("\"type\":\"reg\""));
    }

    #[test]
    fn error_codes_serialize_screaming_snake() {
        let s = serde_json::to_string(&ErrorCode::NoService).unwrap();
        assert_eq!(s, "\"NO_SERVICE\"");
        let s = serde_json::to_string(&ErrorCode::QueueCleared).unwrap();
        assert_eq!(s, "\"QUEUE_CLEARED\"");
    }

    #[test]
    fn field_order_is_irrelevant() {
        let text = r#"{"target":"tools","method":"tool.list","id":"7","type":"req"}"#;
        match decode_frame(text) {
            Some(Frame::Req { id, target, method, .. }) => {
                assert_eq!(id, "7");
                assert_eq!(target, "tools");
                assert_eq!(method, "tool.list");
            }
            other => panic!("expected req frame, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_frame_decodes_to_none() {
        assert_eq!(decode_frame(r#"{"type":"mystery"}"#), None);
        assert_eq!(decode_frame("not json at all"), None);
    }

    #[test]
    fn timeout_override_is_optional_on_the_wire() {
        let text = encode_frame(&Frame::Req {
            id: "1".into(),
            target: "t".into(),
            method: "m".into(),
            params: Value::Null,
            timeout_ms: None,
        })
        .unwrap();
        assert!(!text.contains("timeout_ms"));

        let with = r#"{"type":"req","id":"1","target":"t","method":"m","timeout_ms":500}"#;
        match decode_frame(with) {
            Some(Frame::Req { timeout_ms, .. }) => assert_eq!(timeout_ms, Some(500)),
            other => panic!("expected req frame, got {other:?}"),
        }
    }
}
