// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: Apache-2.0
//! The webhook service: an HTTP listener that turns authenticated
//! `POST /hooks/<id>` calls into `webhook.trigger` events.
//!
//! The reply is `200 {"ok":true}` as soon as the body is read; the fire
//! itself is asynchronous. Bearer tokens are per hook and never leave the
//! service (`webhook.list` redacts them). Payloads pass through a named
//! transform to become the agent task; transforms are compiled-in
//! renderers registered by the operator at startup.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::any,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use freja_protocol::ServiceRegistration;
use freja_service::{MethodError, ServiceHandle, ServiceHandler};

use crate::transforms::TransformRegistry;

/// Request bodies above this are refused with 413.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

// ─── Hook model ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookHook {
    /// URL-safe identifier; the path is `/hooks/<id>`.
    pub id: String,
    /// Bearer secret. Never returned by `webhook.list`.
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ─── Service ──────────────────────────────────────────────────────────────────

pub struct WebhookService {
    hooks: Mutex<HashMap<String, WebhookHook>>,
    transforms: TransformRegistry,
    handle: OnceLock<ServiceHandle>,
    /// Fires recorded for observability and tests: (hook id, task).
    fired: Mutex<Vec<(String, String)>>,
    /// Static OpenAPI document served at /openapi.json.
    openapi: Value,
}

impl WebhookService {
    pub fn new(
        hooks: Vec<WebhookHook>,
        transforms: TransformRegistry,
        tool_names: Vec<(String, String)>,
    ) -> Arc<Self> {
        let hooks = hooks.into_iter().map(|h| (h.id.clone(), h)).collect();
        Arc::new(Self {
            hooks: Mutex::new(hooks),
            transforms,
            handle: OnceLock::new(),
            fired: Mutex::new(Vec::new()),
            openapi: build_openapi(&tool_names),
        })
    }

    /// The HTTP surface. Separated from binding so tests can drive the
    /// router directly.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/hooks/:id", any(hook_endpoint))
            .route("/openapi.json", any(openapi_endpoint))
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
            .with_state(Arc::clone(self))
    }

    /// Bind the listener and serve until the process exits.
    pub async fn serve(self: &Arc<Self>, host: &str, port: u16) -> anyhow::Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "webhook listener up");
        let router = self.router();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!("webhook listener stopped: {e}");
            }
        });
        Ok(addr)
    }

    pub async fn fired(&self) -> Vec<(String, String)> {
        self.fired.lock().await.clone()
    }

    /// Hook table with tokens redacted.
    async fn list_redacted(&self) -> Value {
        let hooks = self.hooks.lock().await;
        let mut listed: Vec<Value> = hooks
            .values()
            .map(|h| {
                json!({
                    "id": h.id,
                    "transform": h.transform,
                    "notify": h.notify,
                    "description": h.description,
                })
            })
            .collect();
        listed.sort_by_key(|h| h["id"].as_str().unwrap_or_default().to_string());
        json!({ "hooks": listed })
    }

    async fn fire(&self, hook: &WebhookHook, payload: Value) {
        let task = self.transforms.render(hook.transform.as_deref(), &payload);
        self.fired.lock().await.push((hook.id.clone(), task.clone()));
        let event = json!({
            "hookId": hook.id,
            "task": task,
            "sessionKey": format!("webhook:{}", hook.id),
            "notify": hook.notify,
        });
        match self.handle.get() {
            Some(handle) => {
                info!(hook = %hook.id, "webhook fired");
                handle.emit("webhook.trigger", event);
            }
            None => warn!(hook = %hook.id, "webhook fire before gateway connection"),
        }
    }
}

// ─── HTTP handlers ────────────────────────────────────────────────────────────

async fn hook_endpoint(
    State(service): State<Arc<WebhookService>>,
    Path(id): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    // Only POST exists on this surface; anything else is an unknown route.
    if method != Method::POST {
        return StatusCode::NOT_FOUND.into_response();
    }
    let hook = {
        let hooks = service.hooks.lock().await;
        hooks.get(&id).cloned()
    };
    let Some(hook) = hook else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", hook.token))
        .unwrap_or(false);
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    // Malformed bodies are treated as an empty object.
    let payload: Value = serde_json::from_slice(&body).unwrap_or_else(|_| json!({}));

    // Acknowledge now, fire asynchronously.
    tokio::spawn(async move {
        service.fire(&hook, payload).await;
    });
    (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
}

async fn openapi_endpoint(State(service): State<Arc<WebhookService>>) -> impl IntoResponse {
    Json(service.openapi.clone())
}

/// Static OpenAPI 3.1 document advertising the tool-execution surface.
fn build_openapi(tools: &[(String, String)]) -> Value {
    let mut paths = serde_json::Map::new();
    for (name, description) in tools {
        paths.insert(
            format!("/tools/{name}/execute"),
            json!({
                "post": {
                    "operationId": format!("execute_{name}"),
                    "summary": description,
                    "responses": { "200": { "description": "tool result" } }
                }
            }),
        );
    }
    json!({
        "openapi": "3.1.0",
        "info": { "title": "freja tools", "version": env!("CARGO_PKG_VERSION") },
        "paths": paths,
    })
}

// ─── Bus methods ──────────────────────────────────────────────────────────────

#[async_trait]
impl ServiceHandler for WebhookService {
    fn registration(&self) -> ServiceRegistration {
        ServiceRegistration {
            service: "webhooks".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            methods: vec!["webhook.list".into(), "webhook.add".into(), "webhook.remove".into()],
            events: vec!["webhook.trigger".into()],
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
            // Tokens stay inside the service.
            "webhook.list" => Ok(self.list_redacted().await),
            "webhook.add" => {
                let hook: WebhookHook = serde_json::from_value(params)
                    .map_err(|e| MethodError::bad_request(format!("invalid hook: {e}")))?;
                let id = hook.id.clone();
                self.hooks.lock().await.insert(id.clone(), hook);
                Ok(json!({ "id": id }))
            }
            "webhook.remove" => {
                let id = params
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| MethodError::bad_request("missing id"))?;
                let removed = self.hooks.lock().await.remove(id).is_some();
                Ok(json!({ "removed": removed }))
            }
            other => Err(MethodError::bad_request(format!("unknown method: {other}"))),
        }
    }

    async fn on_connected(&self, peer: &ServiceHandle) {
        let _ = self.handle.set(peer.clone());
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    fn github_hook() -> WebhookHook {
        WebhookHook {
            id: "github".into(),
            token: "s3cret".into(),
            transform: None,
            notify: Some(vec!["whatsapp:+49".into()]),
            description: Some("push events".into()),
        }
    }

    fn service() -> Arc<WebhookService> {
        WebhookService::new(vec![github_hook()], TransformRegistry::new(), vec![])
    }

    fn post(path: &str, auth: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri(path);
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    // ── Auth (scenario: wrong bearer, then right bearer) ──────────────────────

    #[tokio::test]
    async fn wrong_token_is_401_and_nothing_fires() {
        let service = service();
        let response = service
            .router()
            .oneshot(post("/hooks/github", Some("Bearer wrong"), "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(service.fired().await.is_empty());
    }

    #[tokio::test]
    async fn missing_auth_is_401() {
        let service = service();
        let response = service
            .router()
            .oneshot(post("/hooks/github", None, "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn correct_token_fires_with_the_payload_task() {
        let service = service();
        let response = service
            .router()
            .oneshot(post(
                "/hooks/github",
                Some("Bearer s3cret"),
                r#"{"ref":"refs/heads/main"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&body).unwrap(),
            json!({"ok": true})
        );

        // The fire is async but well under half a second.
        let mut fired = Vec::new();
        for _ in 0..25 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            fired = service.fired().await;
            if !fired.is_empty() {
                break;
            }
        }
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, "github");
        assert!(fired[0].1.contains("refs/heads/main"));
    }

    // ── Routing ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn unknown_hook_is_404() {
        let service = service();
        let response = service
            .router()
            .oneshot(post("/hooks/nope", Some("Bearer s3cret"), "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn non_post_is_404() {
        let service = service();
        let response = service
            .router()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/hooks/github")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn oversized_body_is_413() {
        let service = service();
        let big = "x".repeat(MAX_BODY_BYTES + 1);
        let response = service
            .router()
            .oneshot(post("/hooks/github", Some("Bearer s3cret"), &big))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(service.fired().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_treated_as_empty_object() {
        let service = service();
        let response = service
            .router()
            .oneshot(post("/hooks/github", Some("Bearer s3cret"), "not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let mut fired = Vec::new();
        for _ in 0..25 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            fired = service.fired().await;
            if !fired.is_empty() {
                break;
            }
        }
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, "{}");
    }

    // ── Bus surface ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn list_never_returns_tokens() {
        let service = service();
        let listed = service.list_redacted().await;
        let text = serde_json::to_string(&listed).unwrap();
        assert!(text.contains("github"));
        assert!(!text.contains("s3cret"), "tokens must be redacted: {text}");
    }

    // ── OpenAPI ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn openapi_lists_tool_execute_paths() {
        let service = WebhookService::new(
            vec![],
            TransformRegistry::new(),
            vec![("echo".into(), "echoes its input".into())],
        );
        let response = service
            .router()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/openapi.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let doc: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(doc["openapi"], "3.1.0");
        assert!(doc["paths"]["/tools/echo/execute"]["post"].is_object());
    }
}
