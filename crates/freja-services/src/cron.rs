// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! The cron service: a schedule table plus a timer that turns due tasks
//! into `cron.trigger` events.
//!
//! Schedules are standard 5-field cron expressions evaluated in UTC, so a
//! host timezone change never shifts a firing. Non-ephemeral table changes
//! go through the persistence hook; ephemeral tasks live and die with the
//! process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use freja_protocol::ServiceRegistration;
use freja_service::{MethodError, ServiceHandle, ServiceHandler};

// ─── Task model ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CronTask {
    pub id: String,
    pub name: String,
    /// Standard 5-field cron expression, UTC.
    pub schedule: String,
    #[serde(default)]
    pub description: String,
    /// The prompt handed to the agent when the task fires.
    pub task: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Channel addresses (`<channel>:<userId>`) notified with the reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<Vec<String>>,
    /// Ephemeral tasks are never persisted.
    #[serde(default)]
    pub ephemeral: bool,
}

fn default_enabled() -> bool {
    true
}

/// Parse a 5-field cron expression. The `cron` crate wants a seconds
/// column, so one is prepended.
pub fn parse_schedule(expr: &str) -> anyhow::Result<Schedule> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        anyhow::bail!("expected a 5-field cron expression, got {fields} fields");
    }
    Schedule::from_str(&format!("0 {expr}"))
        .map_err(|e| anyhow::anyhow!("invalid cron expression {expr:?}: {e}"))
}

/// Next UTC fire instant strictly after `after`.
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// The `cron.trigger` payload for one firing.
pub fn trigger_payload(task: &CronTask, now: DateTime<Utc>) -> Value {
    json!({
        "taskId": task.id,
        "task": task.task,
        "name": task.name,
        "sessionKey": format!("cron:{}:{}", task.id, now.timestamp()),
        "notify": task.notify,
    })
}

// ─── Persistence hook ─────────────────────────────────────────────────────────

#[async_trait]
pub trait CronPersistence: Send + Sync {
    async fn save(&self, tasks: &[CronTask]) -> anyhow::Result<()>;
}

pub struct NoopPersistence;

#[async_trait]
impl CronPersistence for NoopPersistence {
    async fn save(&self, _tasks: &[CronTask]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Persist the non-ephemeral table as pretty JSON.
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> anyhow::Result<Vec<CronTask>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CronPersistence for JsonFilePersistence {
    async fn save(&self, tasks: &[CronTask]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let text = serde_json::to_string_pretty(tasks)?;
        tokio::fs::write(&self.path, text).await?;
        Ok(())
    }
}

// ─── Service ──────────────────────────────────────────────────────────────────

struct Entry {
    task: CronTask,
    schedule: Schedule,
    next: Option<DateTime<Utc>>,
}

pub struct CronService {
    entries: Mutex<HashMap<String, Entry>>,
    persistence: Arc<dyn CronPersistence>,
    handle: OnceLock<ServiceHandle>,
    ticker_started: AtomicBool,
}

impl CronService {
    pub fn new(persistence: Arc<dyn CronPersistence>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            persistence,
            handle: OnceLock::new(),
            ticker_started: AtomicBool::new(false),
        })
    }

    /// Seed the table (startup restore). Invalid schedules are skipped
    /// with a warning rather than poisoning the rest of the table.
    pub async fn seed(&self, tasks: Vec<CronTask>) {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        for task in tasks {
            match parse_schedule(&task.schedule) {
                Ok(schedule) => {
                    let next = next_fire(&schedule, now);
                    entries.insert(task.id.clone(), Entry { task, schedule, next });
                }
                Err(e) => warn!(task = %task.id, "skipping persisted task: {e}"),
            }
        }
    }

    pub async fn tasks(&self) -> Vec<CronTask> {
        let entries = self.entries.lock().await;
        let mut tasks: Vec<CronTask> = entries.values().map(|e| e.task.clone()).collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    async fn persist(&self) {
        let durable: Vec<CronTask> = self
            .tasks()
            .await
            .into_iter()
            .filter(|t| !t.ephemeral)
            .collect();
        if let Err(e) = self.persistence.save(&durable).await {
            warn!("cron persistence failed: {e}");
        }
    }

    fn fire(&self, task: &CronTask, now: DateTime<Utc>) -> Value {
        let payload = trigger_payload(task, now);
        match self.handle.get() {
            Some(handle) => {
                info!(task = %task.id, "cron task fired");
                handle.emit("cron.trigger", payload.clone());
            }
            None => warn!(task = %task.id, "cron fire before gateway connection"),
        }
        payload
    }

    /// Timer pass: fire every enabled entry whose next instant has
    /// arrived, then advance it.
    async fn tick(&self, now: DateTime<Utc>) {
        let mut due: Vec<CronTask> = Vec::new();
        {
            let mut entries = self.entries.lock().await;
            for entry in entries.values_mut() {
                if !entry.task.enabled {
                    continue;
                }
                if let Some(next) = entry.next {
                    if next <= now {
                        due.push(entry.task.clone());
                        entry.next = next_fire(&entry.schedule, now);
                    }
                }
            }
        }
        for task in due {
            self.fire(&task, now);
        }
    }

    fn start_ticker(self: &Arc<Self>) {
        if self.ticker_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                service.tick(Utc::now()).await;
            }
        });
    }

    // ── Methods ───────────────────────────────────────────────────────────────

    async fn add(&self, params: Value) -> Result<Value, MethodError> {
        let task: CronTask = serde_json::from_value(params)
            .map_err(|e| MethodError::bad_request(format!("invalid task: {e}")))?;
        let schedule = parse_schedule(&task.schedule)
            .map_err(|e| MethodError::bad_request(e.to_string()))?;
        let ephemeral = task.ephemeral;
        let id = task.id.clone();
        {
            let mut entries = self.entries.lock().await;
            let next = next_fire(&schedule, Utc::now());
            entries.insert(id.clone(), Entry { task, schedule, next });
        }
        if !ephemeral {
            self.persist().await;
        }
        Ok(json!({ "id": id }))
    }

    async fn remove(&self, params: Value) -> Result<Value, MethodError> {
        let id = required_str(&params, "id")?;
        let removed = {
            let mut entries = self.entries.lock().await;
            entries.remove(&id)
        };
        match removed {
            Some(entry) => {
                if !entry.task.ephemeral {
                    self.persist().await;
                }
                Ok(json!({ "removed": true }))
            }
            None => Ok(json!({ "removed": false })),
        }
    }

    async fn update(&self, params: Value) -> Result<Value, MethodError> {
        let id = required_str(&params, "id")?;
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| MethodError::bad_request(format!("no such task: {id}")))?;

        if let Some(enabled) = params.get("enabled").and_then(Value::as_bool) {
            entry.task.enabled = enabled;
        }
        if let Some(name) = params.get("name").and_then(Value::as_str) {
            entry.task.name = name.to_string();
        }
        if let Some(prompt) = params.get("task").and_then(Value::as_str) {
            entry.task.task = prompt.to_string();
        }
        if let Some(expr) = params.get("schedule").and_then(Value::as_str) {
            let schedule = parse_schedule(expr)
                .map_err(|e| MethodError::bad_request(e.to_string()))?;
            entry.task.schedule = expr.to_string();
            entry.next = next_fire(&schedule, Utc::now());
            entry.schedule = schedule;
        }
        let durable = !entry.task.ephemeral;
        let updated = entry.task.clone();
        drop(entries);

        if durable {
            self.persist().await;
        }
        Ok(serde_json::to_value(updated).unwrap_or(Value::Null))
    }

    async fn run_now(&self, params: Value) -> Result<Value, MethodError> {
        let id = required_str(&params, "id")?;
        let task = {
            let entries = self.entries.lock().await;
            entries
                .get(&id)
                .map(|e| e.task.clone())
                .ok_or_else(|| MethodError::bad_request(format!("no such task: {id}")))?
        };
        let payload = self.fire(&task, Utc::now());
        Ok(payload)
    }
}

#[async_trait]
impl ServiceHandler for CronService {
    fn registration(&self) -> ServiceRegistration {
        ServiceRegistration {
            service: "cron".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            methods: vec![
                "cron.add".into(),
                "cron.remove".into(),
                "cron.update".into(),
                "cron.run".into(),
                "cron.list".into(),
            ],
            events: vec!["cron.trigger".into()],
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
            "cron.add" => self.add(params).await,
            "cron.remove" => self.remove(params).await,
            "cron.update" => self.update(params).await,
            "cron.run" => self.run_now(params).await,
            "cron.list" => Ok(json!({ "tasks": self.tasks().await })),
            other => Err(MethodError::bad_request(format!("unknown method: {other}"))),
        }
    }

    async fn on_connected(&self, peer: &ServiceHandle) {
        let _ = self.handle.set(peer.clone());
    }
}

/// Connect the ticker once the service is wrapped in its Arc.
pub fn start(service: &Arc<CronService>) {
    service.start_ticker();
}

fn required_str(params: &Value, field: &str) -> Result<String, MethodError> {
    params
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| MethodError::bad_request(format!("missing {field}")))
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
