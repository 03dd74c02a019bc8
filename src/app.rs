// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: Apache-2.0
//! Top-level wiring: one `App` owns the broker, the stores, the memory
//! index, the runtime, and every service client. No singletons; each
//! piece receives exactly the handles it needs.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use freja_config::Config;
use freja_core::{PruneSettings, Runtime, RuntimeSettings};
use freja_gateway::{Gateway, GatewaySettings};
use freja_memory::{
    spawn_watcher, Embedder, HashEmbedder, HostedEmbedder, IndexSettings, MemoryIndex,
    WatcherHandle,
};
use freja_model::{ModelProvider, ScriptedProvider};
use freja_service::{ServiceClient, ServiceSettings};
use freja_services::{
    cron, AgentService, ChannelAdapter, ChannelService, ConsoleAdapter, CronService, EchoTool,
    GatewayToolDispatcher, JsonFilePersistence, MemorySearchTool, RuntimeEndpoint,
    SessionsSpawnTool, ToolRegistry, ToolsService, TransformRegistry, WebhookService,
};
use freja_store::{JsonlStore, MemoryStore, SessionStore};

pub struct App {
    _gateway: Gateway,
    _clients: Vec<ServiceClient>,
    _watcher: Option<WatcherHandle>,
    pub channels: Arc<ChannelService>,
}

impl App {
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        // ── Broker ────────────────────────────────────────────────────────────
        let gateway = Gateway::bind(GatewaySettings {
            host: config.gateway.host.clone(),
            port: config.gateway.port,
            request_timeout: std::time::Duration::from_millis(config.gateway.request_timeout_ms),
            ping_interval: std::time::Duration::from_secs(config.gateway.ping_interval_secs),
        })
        .await
        .context("binding gateway")?;
        let url = gateway.url();

        // ── Storage ───────────────────────────────────────────────────────────
        let store: Arc<dyn SessionStore> = match config.storage.sessions_backend.as_str() {
            "memory" => Arc::new(MemoryStore::new()),
            _ => Arc::new(
                JsonlStore::open(&config.storage.sessions_root)
                    .await
                    .context("opening session store")?,
            ),
        };

        // ── Memory index + watcher ────────────────────────────────────────────
        tokio::fs::create_dir_all(&config.storage.memory_root).await?;
        let embedder: Arc<dyn Embedder> = match (
            config.embeddings.provider.as_str(),
            &config.embeddings.api_key,
        ) {
            ("openai", Some(key)) => Arc::new(HostedEmbedder::new(
                key.clone(),
                config.embeddings.endpoint.clone(),
            )),
            _ => Arc::new(HashEmbedder),
        };
        let memory = Arc::new(MemoryIndex::new(
            &config.storage.memory_root,
            &config.storage.sessions_root,
            embedder,
            IndexSettings::default(),
        ));
        memory.sync(true).await.context("initial memory sync")?;
        let watcher = spawn_watcher(Arc::clone(&memory)).ok();

        // ── Model provider ────────────────────────────────────────────────────
        let provider: Arc<dyn ModelProvider> = match config.model.provider.as_str() {
            "mock" => Arc::new(ScriptedProvider::always_text("(mock model reply)")),
            other => anyhow::bail!(
                "model provider {other:?} needs an external adapter; only \"mock\" ships in-tree"
            ),
        };

        // ── Runtime on its own bus endpoint ───────────────────────────────────
        let runtime_client =
            ServiceClient::spawn(url.clone(), Arc::new(RuntimeEndpoint), ServiceSettings::default());
        let dispatcher = Arc::new(GatewayToolDispatcher::new(runtime_client.handle()));
        let runtime = Arc::new(Runtime::new(
            Arc::clone(&store),
            provider,
            dispatcher,
            RuntimeSettings {
                prune: PruneSettings::from(&config.prune),
                history: freja_model::sanitize::HistoryLimits {
                    cron_turns: config.history.cron_turns,
                    channel_turns: config.history.channel_turns,
                    default_turns: config.history.default_turns,
                },
                ..Default::default()
            },
        ));

        // ── Services ──────────────────────────────────────────────────────────
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(MemorySearchTool::new(Arc::clone(&memory)));
        registry.register(SessionsSpawnTool);
        let tool_summary: Vec<(String, String)> = registry
            .descriptors()
            .iter()
            .filter_map(|d| {
                Some((
                    d.get("name")?.as_str()?.to_string(),
                    d.get("description")?.as_str()?.to_string(),
                ))
            })
            .collect();
        let tools = ToolsService::new(registry);
        let tools_client = ServiceClient::spawn(url.clone(), tools, ServiceSettings::default());

        let channels = ChannelService::new(
            Arc::clone(&store),
            vec![ConsoleAdapter::new("console") as Arc<dyn ChannelAdapter>],
        );
        let channels_client = ServiceClient::spawn(
            url.clone(),
            Arc::clone(&channels) as _,
            ServiceSettings::default(),
        );

        let cron_persistence =
            JsonFilePersistence::new(config.storage.sessions_root.join("cron-tasks.json"));
        let persisted = cron_persistence.load().await.unwrap_or_default();
        let cron_service = CronService::new(Arc::new(cron_persistence));
        cron_service.seed(persisted).await;
        cron::start(&cron_service);
        let cron_client = ServiceClient::spawn(
            url.clone(),
            Arc::clone(&cron_service) as _,
            ServiceSettings::default(),
        );

        let webhooks = WebhookService::new(vec![], TransformRegistry::new(), tool_summary);
        webhooks
            .serve(&config.webhook.host, config.webhook.port)
            .await
            .context("starting webhook listener")?;
        let webhooks_client = ServiceClient::spawn(
            url.clone(),
            Arc::clone(&webhooks) as _,
            ServiceSettings::default(),
        );

        let agent = AgentService::new(runtime, Arc::clone(&store));
        let agent_client = ServiceClient::spawn(url, agent, ServiceSettings::default());

        info!("freja platform is up");
        Ok(Self {
            _gateway: gateway,
            _clients: vec![
                runtime_client,
                tools_client,
                channels_client,
                cron_client,
                webhooks_client,
                agent_client,
            ],
            _watcher: watcher,
            channels,
        })
    }
}
