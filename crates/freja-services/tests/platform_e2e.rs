// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! Full-stack scenarios: gateway + channel/tools/agent services + runtime,
//! all talking over real loopback WebSockets, with a scripted model.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use freja_core::{Runtime, RuntimeSettings};
use freja_gateway::{Gateway, GatewaySettings};
use freja_model::{ModelProvider, ScriptedProvider};
use freja_service::{ServiceClient, ServiceSettings};
use freja_services::{
    AgentService, ChannelAdapter, ChannelService, ConsoleAdapter, EchoTool,
    GatewayToolDispatcher, InboundMessage, RuntimeEndpoint, ToolRegistry, ToolsService,
    TransformRegistry, WebhookHook, WebhookService,
};
use freja_store::{MemoryStore, SessionStore};

/// Everything a scenario needs, with all clients connected.
struct Platform {
    _gateway: Gateway,
    _clients: Vec<ServiceClient>,
    adapter: Arc<ConsoleAdapter>,
    channels: Arc<ChannelService>,
    webhooks: Arc<WebhookService>,
    store: Arc<MemoryStore>,
}

async fn platform(provider: Arc<dyn ModelProvider>) -> Platform {
    let gateway = Gateway::bind(GatewaySettings {
        port: 0,
        request_timeout: Duration::from_secs(5),
        ..Default::default()
    })
    .await
    .expect("gateway binds");
    let url = gateway.url();
    let store = Arc::new(MemoryStore::new());

    // Runtime rides its own bus endpoint for tool dispatch.
    let runtime_client = ServiceClient::spawn(
        url.clone(),
        Arc::new(RuntimeEndpoint),
        ServiceSettings::default(),
    );
    assert!(runtime_client.wait_connected(Duration::from_secs(2)).await);
    let dispatcher = Arc::new(GatewayToolDispatcher::new(runtime_client.handle()));
    let runtime = Arc::new(Runtime::new(
        Arc::clone(&store) as Arc<dyn SessionStore>,
        provider,
        dispatcher,
        RuntimeSettings::default(),
    ));

    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    let tools = ToolsService::new(registry);
    let tools_client = ServiceClient::spawn(url.clone(), tools, ServiceSettings::default());
    assert!(tools_client.wait_connected(Duration::from_secs(2)).await);

    let adapter = ConsoleAdapter::new("console");
    let channels = ChannelService::new(
        Arc::clone(&store) as Arc<dyn SessionStore>,
        vec![Arc::clone(&adapter) as Arc<dyn ChannelAdapter>],
    );
    let channels_client =
        ServiceClient::spawn(url.clone(), Arc::clone(&channels) as _, ServiceSettings::default());
    assert!(channels_client.wait_connected(Duration::from_secs(2)).await);

    let webhooks = WebhookService::new(
        vec![WebhookHook {
            id: "github".into(),
            token: "s3cret".into(),
            transform: None,
            notify: Some(vec!["console:+49".into()]),
            description: None,
        }],
        TransformRegistry::new(),
        vec![],
    );
    let webhooks_client =
        ServiceClient::spawn(url.clone(), Arc::clone(&webhooks) as _, ServiceSettings::default());
    assert!(webhooks_client.wait_connected(Duration::from_secs(2)).await);

    let agent = AgentService::new(runtime, Arc::clone(&store) as Arc<dyn SessionStore>);
    let agent_client = ServiceClient::spawn(url, agent, ServiceSettings::default());
    assert!(agent_client.wait_connected(Duration::from_secs(2)).await);

    Platform {
        _gateway: gateway,
        _clients: vec![
            runtime_client,
            tools_client,
            channels_client,
            webhooks_client,
            agent_client,
        ],
        adapter,
        channels,
        webhooks,
        store,
    }
}

async fn wait_for_reply(adapter: &ConsoleAdapter, within: Duration) -> Vec<(String, String)> {
    let start = tokio::time::Instant::now();
    loop {
        let sent = adapter.sent.lock().await.clone();
        if !sent.is_empty() {
            return sent;
        }
        if start.elapsed() > within {
            return sent;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn inbound_chat_message_flows_to_a_delivered_reply() {
    let provider = Arc::new(ScriptedProvider::always_text("hello from the agent"));
    let p = platform(provider).await;

    p.channels
        .inbound(InboundMessage {
            channel: "console".into(),
            user_id: "+1".into(),
            text: "anyone there?".into(),
        })
        .await
        .unwrap();

    let sent = wait_for_reply(&p.adapter, Duration::from_secs(5)).await;
    assert_eq!(sent.len(), 1, "expected exactly one delivered reply");
    assert_eq!(sent[0].0, "+1");
    assert_eq!(sent[0].1, "hello from the agent");

    // The stored history carries both the task and the reply, append-only.
    let history = p
        .store
        .get_messages("console:+1", freja_store::GetMessages::default())
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].metadata_type(), Some("task"));
}

#[tokio::test]
async fn tool_calls_cross_the_bus_and_the_reply_follows() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_response("c1", "echo", json!({"text": "ping"})),
        ScriptedProvider::text_response("the tool said ping"),
    ]));
    let p = platform(provider).await;

    p.channels
        .inbound(InboundMessage {
            channel: "console".into(),
            user_id: "+2".into(),
            text: "try the echo tool".into(),
        })
        .await
        .unwrap();

    let sent = wait_for_reply(&p.adapter, Duration::from_secs(5)).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "the tool said ping");

    // task, assistant tool call, tool result, final assistant.
    let history = p
        .store
        .get_messages("console:+2", freja_store::GetMessages::default())
        .await
        .unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[2].tool_result_ids(), vec!["c1"]);
    assert!(history[2].visible_text().is_empty() || !history[2].visible_text().contains("error"));
}

#[tokio::test]
async fn failed_runs_deliver_a_classified_notice() {
    let provider = Arc::new(freja_model::FailingProvider::new("429 rate limit exceeded"));
    let p = platform(provider).await;

    p.channels
        .inbound(InboundMessage {
            channel: "console".into(),
            user_id: "+3".into(),
            text: "hi".into(),
        })
        .await
        .unwrap();

    let sent = wait_for_reply(&p.adapter, Duration::from_secs(5)).await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.starts_with("Something went wrong:"));
    assert!(sent[0].1.contains("rate-limited"));
}

#[tokio::test]
async fn webhook_trigger_runs_and_notifies_the_configured_address() {
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    let provider = Arc::new(ScriptedProvider::always_text("deploy looks healthy"));
    let p = platform(provider).await;

    let response = p
        .webhooks
        .router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/hooks/github")
                .header("authorization", "Bearer s3cret")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"ref":"refs/heads/main"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);

    let sent = wait_for_reply(&p.adapter, Duration::from_secs(5)).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "+49");
    assert_eq!(sent[0].1, "deploy looks healthy");

    // The webhook session exists with its task seeded from the payload.
    let session = p.store.get("webhook:github").await.unwrap();
    assert!(session.is_some());
}
