// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! Webhook payload transforms: named renderers that turn a raw JSON
//! payload into the agent task string.
//!
//! Transforms are compiled in and registered by the operator at startup;
//! there is no dynamic code loading. An unknown or absent name falls back
//! to the passthrough renderer.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

pub type Transform = Arc<dyn Fn(&Value) -> String + Send + Sync>;

pub struct TransformRegistry {
    transforms: HashMap<String, Transform>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformRegistry {
    pub fn new() -> Self {
        let mut registry = Self { transforms: HashMap::new() };
        registry.register("github-push", Arc::new(github_push));
        registry
    }

    pub fn register(&mut self, name: &str, transform: Transform) {
        self.transforms.insert(name.to_string(), transform);
    }

    /// Render the payload through `name`, or passthrough when the name is
    /// absent or unknown.
    pub fn render(&self, name: Option<&str>, payload: &Value) -> String {
        match name {
            Some(name) => match self.transforms.get(name) {
                Some(transform) => transform(payload),
                None => {
                    warn!(transform = name, "unknown transform, using passthrough");
                    passthrough(payload)
                }
            },
            None => passthrough(payload),
        }
    }
}

/// Default renderer: the payload itself, pretty-printed.
pub fn passthrough(payload: &Value) -> String {
    serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string())
}

/// Example transform for GitHub push payloads.
fn github_push(payload: &Value) -> String {
    let reference = payload
        .get("ref")
        .and_then(Value::as_str)
        .unwrap_or("unknown ref");
    let pusher = payload
        .pointer("/pusher/name")
        .and_then(Value::as_str)
        .unwrap_or("someone");
    let commits = payload
        .get("commits")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    format!("{pusher} pushed {commits} commit(s) to {reference}. Summarize what changed and whether anything needs attention.")
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn passthrough_pretty_prints() {
        let payload = json!({"ref": "refs/heads/main"});
        let rendered = passthrough(&payload);
        assert!(rendered.contains("refs/heads/main"));
    }

    #[test]
    fn unknown_name_falls_back_to_passthrough() {
        let registry = TransformRegistry::new();
        let payload = json!({"a": 1});
        assert_eq!(registry.render(Some("nope"), &payload), passthrough(&payload));
    }

    #[test]
    fn github_push_renders_a_task_sentence() {
        let registry = TransformRegistry::new();
        let payload = json!({
            "ref": "refs/heads/main",
            "pusher": {"name": "mira"},
            "commits": [{"id": "1"}, {"id": "2"}],
        });
        let rendered = registry.render(Some("github-push"), &payload);
        assert!(rendered.contains("mira"));
        assert!(rendered.contains("2 commit(s)"));
        assert!(rendered.contains("refs/heads/main"));
    }

    #[test]
    fn custom_transforms_can_be_registered() {
        let mut registry = TransformRegistry::new();
        registry.register("shout", Arc::new(|p: &Value| p.to_string().to_uppercase()));
        let rendered = registry.render(Some("shout"), &json!({"x": "loud"}));
        assert!(rendered.contains("LOUD"));
    }
}
