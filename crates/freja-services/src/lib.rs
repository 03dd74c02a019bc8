// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! Platform services riding the gateway bus.
//!
//! Channel, cron, and webhook services turn outside events into session
//! tasks; the agent service runs them through the runtime and routes
//! replies back out; the tools service owns tool lookup and invocation.
//! Each service is an independent [`freja_service::ServiceHandler`] so
//! the broker, not imports, connects them.

pub mod agent;
pub mod channel;
pub mod cron;
pub mod tools;
pub mod transforms;
pub mod webhook;

pub use agent::AgentService;
pub use channel::{ChannelAdapter, ChannelService, ConsoleAdapter, InboundMessage};
pub use cron::{
    parse_schedule, CronPersistence, CronService, CronTask, JsonFilePersistence, NoopPersistence,
};
pub use tools::{
    EchoTool, GatewayToolDispatcher, MemorySearchTool, RuntimeEndpoint, SessionsSpawnTool, Tool,
    ToolContext, ToolRegistry, ToolResult, ToolsService,
};
pub use transforms::{passthrough, Transform, TransformRegistry};
pub use webhook::{WebhookHook, WebhookService, MAX_BODY_BYTES};
