// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! Per-session message queue: the one mutual-exclusion domain that spans
//! services.
//!
//! Tasks for the same session key run strictly one at a time in FIFO
//! order; tasks for distinct keys run concurrently. Clearing a session's
//! queue rejects every still-pending task but never aborts the in-flight
//! one.

use std::collections::{HashMap, VecDeque};
use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::debug;

// ─── Errors & events ──────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The task was discarded by `clear` before it started.
    #[error("QUEUE_CLEARED")]
    Cleared,
    /// The task ran and failed; the queue advanced to the next one.
    #[error("task failed: {0}")]
    Task(#[source] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePhase {
    Enqueued,
    Started,
    Processing,
    Completed,
    Failed,
}

/// Per-task lifecycle notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    #[serde(rename = "sessionKey")]
    pub session_key: String,
    pub phase: QueuePhase,
}

// ─── Queue ────────────────────────────────────────────────────────────────────

struct Lane {
    waiting: VecDeque<Ticket>,
    in_flight: bool,
}

struct Ticket {
    /// `true` admits the task; `false` means the queue was cleared.
    admit: oneshot::Sender<bool>,
}

pub struct SessionQueue {
    lanes: Mutex<HashMap<String, Lane>>,
    events: broadcast::Sender<QueueEvent>,
}

impl Default for SessionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionQueue {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self { lanes: Mutex::new(HashMap::new()), events }
    }

    /// Observe per-task lifecycle events (`enqueued → started → processing
    /// → completed | failed`).
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Run `task` when the session's lane admits it. The returned future
    /// resolves with the task result, or with [`QueueError::Cleared`] when
    /// the lane was cleared first.
    pub async fn run<T, F>(&self, session_key: &str, task: F) -> Result<T, QueueError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let admitted = self.enqueue(session_key).await;
        self.emit(session_key, QueuePhase::Enqueued);

        match admitted.await {
            Ok(true) => {}
            _ => return Err(QueueError::Cleared),
        }

        self.emit(session_key, QueuePhase::Started);
        self.emit(session_key, QueuePhase::Processing);
        let outcome = task.await;
        self.finish(session_key).await;

        match outcome {
            Ok(value) => {
                self.emit(session_key, QueuePhase::Completed);
                Ok(value)
            }
            Err(e) => {
                self.emit(session_key, QueuePhase::Failed);
                Err(QueueError::Task(e))
            }
        }
    }

    /// Reject every pending task for `session_key`. The in-flight task, if
    /// any, keeps running. Returns the number of rejected tasks.
    pub async fn clear(&self, session_key: &str) -> usize {
        let mut lanes = self.lanes.lock().await;
        let Some(lane) = lanes.get_mut(session_key) else { return 0 };
        let rejected = lane.waiting.len();
        for ticket in lane.waiting.drain(..) {
            let _ = ticket.admit.send(false);
        }
        if !lane.in_flight {
            lanes.remove(session_key);
        }
        debug!(session = %session_key, rejected, "queue cleared");
        rejected
    }

    /// Number of pending (not yet admitted) tasks for a key.
    pub async fn pending(&self, session_key: &str) -> usize {
        let lanes = self.lanes.lock().await;
        lanes.get(session_key).map_or(0, |l| l.waiting.len())
    }

    async fn enqueue(&self, session_key: &str) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        let mut lanes = self.lanes.lock().await;
        let lane = lanes.entry(session_key.to_string()).or_insert_with(|| Lane {
            waiting: VecDeque::new(),
            in_flight: false,
        });
        if lane.in_flight {
            lane.waiting.push_back(Ticket { admit: tx });
        } else {
            lane.in_flight = true;
            let _ = tx.send(true);
        }
        rx
    }

    /// Release the lane and admit the next waiter, if any.
    async fn finish(&self, session_key: &str) {
        let mut lanes = self.lanes.lock().await;
        let Some(lane) = lanes.get_mut(session_key) else { return };
        match lane.waiting.pop_front() {
            Some(next) => {
                // Lane stays in-flight; hand over directly.
                let _ = next.admit.send(true);
            }
            None => {
                lanes.remove(session_key);
            }
        }
    }

    fn emit(&self, session_key: &str, phase: QueuePhase) {
        let _ = self.events.send(QueueEvent {
            session_key: session_key.to_string(),
            phase,
        });
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    // ── FIFO ordering per session (scenario: two messages, one key) ──────────

    #[tokio::test]
    async fn same_key_tasks_run_in_fifo_order() {
        let queue = Arc::new(SessionQueue::new());
        let log: Arc<AsyncMutex<Vec<&'static str>>> = Arc::default();

        let q1 = Arc::clone(&queue);
        let l1 = Arc::clone(&log);
        let first = tokio::spawn(async move {
            q1.run("s1", async {
                // Hold the lane long enough that the second task must wait.
                tokio::time::sleep(Duration::from_millis(50)).await;
                l1.lock().await.push("first");
                Ok("first")
            })
            .await
        });

        // Give the first task a head start into the lane.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let q2 = Arc::clone(&queue);
        let l2 = Arc::clone(&log);
        let second = tokio::spawn(async move {
            q2.run("s1", async {
                l2.lock().await.push("second");
                Ok("second")
            })
            .await
        });

        assert_eq!(first.await.unwrap().unwrap(), "first");
        assert_eq!(second.await.unwrap().unwrap(), "second");
        assert_eq!(*log.lock().await, vec!["first", "second"]);
    }

    // ── At most one in processing per key ─────────────────────────────────────

    #[tokio::test]
    async fn at_most_one_in_flight_per_key() {
        let queue = Arc::new(SessionQueue::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let q = Arc::clone(&queue);
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                q.run("hot", async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_run_concurrently() {
        let queue = Arc::new(SessionQueue::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let q = Arc::clone(&queue);
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                q.run(&format!("key-{i}"), async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(
            max_seen.load(Ordering::SeqCst) > 1,
            "distinct keys should overlap"
        );
    }

    // ── clear ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn clear_rejects_pending_but_not_in_flight() {
        let queue = Arc::new(SessionQueue::new());
        let (hold_tx, hold_rx) = oneshot::channel::<()>();

        let q1 = Arc::clone(&queue);
        let in_flight = tokio::spawn(async move {
            q1.run("s", async move {
                let _ = hold_rx.await;
                Ok("survived")
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let q2 = Arc::clone(&queue);
        let pending = tokio::spawn(async move { q2.run("s", async { Ok("never") }).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(queue.clear("s").await, 1);
        assert!(matches!(
            pending.await.unwrap(),
            Err(QueueError::Cleared)
        ));

        hold_tx.send(()).unwrap();
        assert_eq!(in_flight.await.unwrap().unwrap(), "survived");
    }

    // ── Failure advances the lane ─────────────────────────────────────────────

    #[tokio::test]
    async fn failed_task_is_dropped_and_next_runs() {
        let queue = Arc::new(SessionQueue::new());

        let q1 = Arc::clone(&queue);
        let failing = tokio::spawn(async move {
            q1.run::<(), _>("s", async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                anyhow::bail!("boom")
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let q2 = Arc::clone(&queue);
        let next = tokio::spawn(async move { q2.run("s", async { Ok(42) }).await });

        assert!(matches!(failing.await.unwrap(), Err(QueueError::Task(_))));
        assert_eq!(next.await.unwrap().unwrap(), 42);
    }

    // ── Lifecycle events ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn lifecycle_events_follow_the_documented_order() {
        let queue = SessionQueue::new();
        let mut rx = queue.subscribe();
        queue.run("s", async { Ok(()) }).await.unwrap();

        let mut phases = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            phases.push(ev.phase);
        }
        assert_eq!(
            phases,
            vec![
                QueuePhase::Enqueued,
                QueuePhase::Started,
                QueuePhase::Processing,
                QueuePhase::Completed
            ]
        );
    }

    #[tokio::test]
    async fn pending_counts_waiting_tasks() {
        let queue = Arc::new(SessionQueue::new());
        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        let q1 = Arc::clone(&queue);
        let blocker = tokio::spawn(async move {
            q1.run("s", async move {
                let _ = hold_rx.await;
                Ok(())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let q2 = Arc::clone(&queue);
        let waiter = tokio::spawn(async move { q2.run("s", async { Ok(()) }).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(queue.pending("s").await, 1);
        hold_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        waiter.await.unwrap().unwrap();
        assert_eq!(queue.pending("s").await, 0);
    }
}
