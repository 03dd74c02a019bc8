// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! The tools service: registry lookup and invocation over the bus.
//!
//! Tool bodies are black boxes behind the [`Tool`] trait; the service owns
//! the dispatch contract only: `tool.list`, `tool.describe`,
//! `tool.execute` with argument validation and the subagent permission
//! filter. Tools reach other services through [`ToolContext::call`], never
//! through imported singletons, which is what keeps the runtime ↔ tools ↔
//! services cycle broken.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use freja_core::runtime::is_subagent_key;
use freja_memory::MemoryIndex;
use freja_model::Block;
use freja_protocol::ServiceRegistration;
use freja_service::{CallError, MethodError, ServiceHandle, ServiceHandler};

/// Tools a subagent session may not invoke.
pub const SUBAGENT_DENIED_TOOLS: &[&str] = &[
    "sessions_list",
    "sessions_history",
    "sessions_send",
    "sessions_spawn",
];

// ─── Tool boundary ────────────────────────────────────────────────────────────

/// Execution context handed to every tool body.
pub struct ToolContext {
    pub session_key: String,
    pub working_dir: Option<String>,
    peer: Option<ServiceHandle>,
}

impl ToolContext {
    pub fn new(session_key: impl Into<String>, working_dir: Option<String>) -> Self {
        Self { session_key: session_key.into(), working_dir, peer: None }
    }

    fn with_peer(mut self, peer: ServiceHandle) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Reach another service through the gateway.
    pub async fn call(
        &self,
        target: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, CallError> {
        match &self.peer {
            Some(peer) => peer.call(target, method, params, None).await,
            None => Err(CallError::Disconnected),
        }
    }
}

/// Result of one tool body invocation.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: Vec<Block>,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(text: impl Into<String>) -> Self {
        Self { content: vec![Block::text(text)], is_error: false }
    }

    pub fn err(text: impl Into<String>) -> Self {
        Self { content: vec![Block::text(text)], is_error: true }
    }
}

/// A registered tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the arguments object.
    fn parameters_schema(&self) -> Value;
    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult;
}

// ─── Registry ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Descriptors for every registered tool, name-sorted.
    pub fn descriptors(&self) -> Vec<Value> {
        let mut tools: Vec<&Arc<dyn Tool>> = self.tools.values().collect();
        tools.sort_by_key(|t| t.name().to_string());
        tools
            .into_iter()
            .map(|t| {
                json!({
                    "name": t.name(),
                    "description": t.description(),
                    "parameters": t.parameters_schema(),
                })
            })
            .collect()
    }
}

// ─── Service ──────────────────────────────────────────────────────────────────

pub struct ToolsService {
    registry: ToolRegistry,
}

impl ToolsService {
    pub fn new(registry: ToolRegistry) -> Arc<Self> {
        Arc::new(Self { registry })
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    async fn execute(&self, params: Value, peer: &ServiceHandle) -> Result<Value, MethodError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| MethodError::bad_request("missing tool name"))?
            .to_string();
        let args = params.get("args").cloned().unwrap_or_else(|| json!({}));
        if !args.is_object() {
            return Err(MethodError::bad_request("tool args must be an object"));
        }
        let context = params.get("context").cloned().unwrap_or(Value::Null);
        let session_key = context
            .get("sessionKey")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let working_dir = context
            .get("workingDir")
            .and_then(Value::as_str)
            .map(str::to_string);

        if is_subagent_key(&session_key) && SUBAGENT_DENIED_TOOLS.contains(&name.as_str()) {
            return Err(MethodError::denied(format!(
                "{name} is not available to subagent sessions"
            )));
        }

        let Some(tool) = self.registry.get(&name) else {
            // Unknown tool is a tool-level error, not a bus failure: the
            // model sees it and can pick another tool.
            return Ok(json!({
                "content": [Block::text(format!("unknown tool: {name}"))],
                "isError": true,
            }));
        };

        debug!(tool = %name, session = %session_key, "executing tool");
        let ctx = ToolContext::new(session_key, working_dir).with_peer(peer.clone());
        let result = tool.execute(args, &ctx).await;
        Ok(json!({
            "content": result.content,
            "isError": result.is_error,
        }))
    }
}

#[async_trait]
impl ServiceHandler for ToolsService {
    fn registration(&self) -> ServiceRegistration {
        ServiceRegistration {
            service: "tools".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            methods: vec!["tool.list".into(), "tool.describe".into(), "tool.execute".into()],
            events: vec![],
            subscriptions: vec![],
        }
    }

    async fn handle_method(
        &self,
        method: &str,
        params: Value,
        peer: &ServiceHandle,
    ) -> Result<Value, MethodError> {
        match method {
            "tool.list" => Ok(json!({ "tools": self.registry.descriptors() })),
            "tool.describe" => {
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| MethodError::bad_request("missing tool name"))?;
                match self.registry.get(name) {
                    Some(tool) => Ok(json!({
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.parameters_schema(),
                    })),
                    None => Err(MethodError::bad_request(format!("unknown tool: {name}"))),
                }
            }
            "tool.execute" => self.execute(params, peer).await,
            other => Err(MethodError::bad_request(format!("unknown method: {other}"))),
        }
    }
}

// ─── Built-in tools ───────────────────────────────────────────────────────────

/// Search the memory index; the agent's recall surface.
pub struct MemorySearchTool {
    index: Arc<MemoryIndex>,
}

impl MemorySearchTool {
    pub fn new(index: Arc<MemoryIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "search long-term memory notes and past conversations"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "what to look for" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> ToolResult {
        let Some(query) = args.get("query").and_then(Value::as_str) else {
            return ToolResult::err("missing required argument: query");
        };
        if let Err(e) = self.index.sync(false).await {
            return ToolResult::err(format!("memory sync failed: {e}"));
        }
        match self.index.search(query).await {
            Ok(results) if results.is_empty() => ToolResult::ok("no matching memories"),
            Ok(results) => {
                let rendered = results
                    .iter()
                    .map(|r| format!("[{}] (score {:.2})\n{}", r.citation, r.score, r.chunk.content))
                    .collect::<Vec<_>>()
                    .join("\n\n");
                ToolResult::ok(rendered)
            }
            Err(e) => ToolResult::err(format!("memory search failed: {e}")),
        }
    }
}

/// Spawn a child session run on behalf of the calling session. The actual
/// work happens in the agent service; this tool only relays.
pub struct SessionsSpawnTool;

#[async_trait]
impl Tool for SessionsSpawnTool {
    fn name(&self) -> &str {
        "sessions_spawn"
    }

    fn description(&self) -> &str {
        "spawn a subagent session to work on a task"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": { "type": "string", "description": "the task for the subagent" }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let Some(task) = args.get("task").and_then(Value::as_str) else {
            return ToolResult::err("missing required argument: task");
        };
        let reply = ctx
            .call(
                "agent",
                "agent.spawn",
                json!({ "parentKey": ctx.session_key, "task": task }),
            )
            .await;
        match reply {
            Ok(payload) => {
                let text = payload
                    .get("reply")
                    .and_then(Value::as_str)
                    .unwrap_or("subagent finished with no reply");
                ToolResult::ok(text)
            }
            Err(e) => ToolResult::err(format!("subagent spawn failed: {e}")),
        }
    }
}

/// Trivial echo tool for wiring tests and demos.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "echoes its input back"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> ToolResult {
        match args.get("text").and_then(Value::as_str) {
            Some(text) => ToolResult::ok(format!("echo: {text}")),
            None => ToolResult::err("missing required argument: text"),
        }
    }
}

// ─── Gateway-backed dispatcher for the runtime ────────────────────────────────

/// The runtime's own bus endpoint. It answers no methods; it exists so
/// the runtime has a connection to issue `tool.*` calls on.
pub struct RuntimeEndpoint;

#[async_trait]
impl ServiceHandler for RuntimeEndpoint {
    fn registration(&self) -> ServiceRegistration {
        ServiceRegistration {
            service: "runtime".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            methods: vec![],
            events: vec![],
            subscriptions: vec![],
        }
    }

    async fn handle_method(
        &self,
        method: &str,
        _params: Value,
        _peer: &ServiceHandle,
    ) -> Result<Value, MethodError> {
        Err(MethodError::bad_request(format!("runtime answers no methods, got {method}")))
    }
}

/// [`freja_core::ToolDispatcher`] implementation that reaches the tools
/// service over the bus.
pub struct GatewayToolDispatcher {
    peer: ServiceHandle,
    timeout: Duration,
}

impl GatewayToolDispatcher {
    pub fn new(peer: ServiceHandle) -> Self {
        Self { peer, timeout: Duration::from_secs(120) }
    }
}

#[async_trait]
impl freja_core::ToolDispatcher for GatewayToolDispatcher {
    async fn list(&self) -> anyhow::Result<Vec<freja_model::ToolSpec>> {
        let payload = self
            .peer
            .call("tools", "tool.list", json!({}), None)
            .await
            .map_err(|e| anyhow::anyhow!("tool.list failed: {e}"))?;
        let tools = payload
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(tools
            .into_iter()
            .filter_map(|t| {
                Some(freja_model::ToolSpec {
                    name: t.get("name")?.as_str()?.to_string(),
                    description: t
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    parameters: t.get("parameters").cloned().unwrap_or(json!({})),
                })
            })
            .collect())
    }

    async fn execute(
        &self,
        name: &str,
        arguments: Value,
        invocation: freja_core::ToolInvocation,
    ) -> anyhow::Result<freja_core::ToolResultPayload> {
        let params = json!({
            "name": name,
            "args": arguments,
            "context": {
                "sessionKey": invocation.session_key,
                "workingDir": invocation.workspace_dir,
            }
        });
        let reply = self
            .peer
            .call("tools", "tool.execute", params, Some(self.timeout))
            .await;
        match reply {
            Ok(payload) => {
                let content: Vec<Block> = payload
                    .get("content")
                    .cloned()
                    .map(|c| serde_json::from_value(c).unwrap_or_default())
                    .unwrap_or_default();
                let is_error = payload
                    .get("isError")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Ok(freja_core::ToolResultPayload { content, is_error })
            }
            // A structured denial becomes an error result the model can
            // see; transport failures bubble up.
            Err(CallError::Remote { code, message })
                if code == freja_protocol::ErrorCode::PermissionDenied =>
            {
                Ok(freja_core::ToolResultPayload {
                    content: vec![Block::text(format!("Permission denied: {message}"))],
                    is_error: true,
                })
            }
            Err(e) => Err(anyhow::anyhow!("tool.execute failed: {e}")),
        }
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
