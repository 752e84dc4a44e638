//! Prefetch queue and worker pool
//!
//! Producers never block: when the queue is full the lowest-priority entry
//! (oldest first among equals) is dropped. A fixed number of workers drain
//! the queue, pausing while the load signal reports contention.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Request to synthesize a packet ahead of time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefetchRequest {
    pub session_id: String,
    pub predicted_tool: String,
    pub intent_cluster: String,
    /// Higher runs first
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub domain_category: Option<String>,
    #[serde(default = "chrono::Utc::now")]
    pub enqueued_at: DateTime<Utc>,
}

impl PrefetchRequest {
    pub fn new(
        session_id: impl Into<String>,
        predicted_tool: impl Into<String>,
        intent_cluster: impl Into<String>,
        priority: u32,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            predicted_tool: predicted_tool.into(),
            intent_cluster: intent_cluster.into(),
            priority,
            project_id: None,
            domain_category: None,
            enqueued_at: Utc::now(),
        }
    }

    fn same_target(&self, other: &PrefetchRequest) -> bool {
        self.session_id == other.session_id
            && self.predicted_tool == other.predicted_tool
            && self.intent_cluster == other.intent_cluster
    }
}

/// Result of a non-blocking enqueue
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Queued,
    /// Merged into an existing request for the same target
    Merged,
    /// Queue was full; the returned request was dropped (possibly the new one)
    Dropped(PrefetchRequest),
}

/// Prefetch counters exposed in the status snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrefetchStats {
    pub queued: usize,
    pub capacity: usize,
    pub paused: bool,
    pub enqueued: u64,
    pub merged: u64,
    pub dropped: u64,
    pub completed: u64,
    pub skipped_fresh: u64,
    pub empty: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    merged: AtomicU64,
    dropped: AtomicU64,
    completed: AtomicU64,
    skipped_fresh: AtomicU64,
    empty: AtomicU64,
    failed: AtomicU64,
}

/// Bounded priority queue of prefetch requests
pub struct PrefetchQueue {
    entries: Mutex<Vec<PrefetchRequest>>,
    notify: Notify,
    capacity: usize,
    counters: Counters,
}

impl PrefetchQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            counters: Counters::default(),
        }
    }

    /// Enqueue without waiting for space.
    pub async fn push(&self, request: PrefetchRequest) -> EnqueueOutcome {
        let outcome = {
            let mut entries = self.entries.lock().await;

            if let Some(existing) = entries.iter_mut().find(|e| e.same_target(&request)) {
                existing.priority = existing.priority.max(request.priority);
                EnqueueOutcome::Merged
            } else if entries.len() < self.capacity {
                entries.push(request);
                EnqueueOutcome::Queued
            } else {
                // Lowest priority, oldest first among equals
                let victim = entries
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| {
                        a.priority
                            .cmp(&b.priority)
                            .then_with(|| a.enqueued_at.cmp(&b.enqueued_at))
                    })
                    .map(|(i, e)| (i, e.priority));

                match victim {
                    Some((idx, lowest)) if request.priority > lowest => {
                        let dropped = entries.swap_remove(idx);
                        entries.push(request);
                        EnqueueOutcome::Dropped(dropped)
                    }
                    _ => EnqueueOutcome::Dropped(request),
                }
            }
        };

        match &outcome {
            EnqueueOutcome::Queued => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                self.notify.notify_one();
            }
            EnqueueOutcome::Merged => {
                self.counters.merged.fetch_add(1, Ordering::Relaxed);
            }
            EnqueueOutcome::Dropped(dropped) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                self.notify.notify_one();
                tracing::warn!(
                    session_id = %dropped.session_id,
                    tool = %dropped.predicted_tool,
                    priority = dropped.priority,
                    "Prefetch queue full, dropped request"
                );
            }
        }
        outcome
    }

    /// Remove the highest-priority request (oldest first among equals).
    pub async fn try_pop(&self) -> Option<PrefetchRequest> {
        let mut entries = self.entries.lock().await;
        let idx = entries
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.enqueued_at.cmp(&a.enqueued_at))
            })
            .map(|(i, _)| i)?;
        Some(entries.remove(idx))
    }

    /// Wait for the next request or cancellation
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<PrefetchRequest> {
        loop {
            let notified = self.notify.notified();
            if let Some(request) = self.try_pop().await {
                return Some(request);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn record(&self, result: &Result<PrefetchStatus>) {
        let counter = match result {
            Ok(PrefetchStatus::Completed) => &self.counters.completed,
            Ok(PrefetchStatus::SkippedFresh) => &self.counters.skipped_fresh,
            Ok(PrefetchStatus::Empty) => &self.counters.empty,
            Err(_) => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn stats(&self, paused: bool) -> PrefetchStats {
        PrefetchStats {
            queued: self.len().await,
            capacity: self.capacity,
            paused,
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            merged: self.counters.merged.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            skipped_fresh: self.counters.skipped_fresh.load(Ordering::Relaxed),
            empty: self.counters.empty.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Load signal
// =============================================================================

/// External contention flag; workers pause while it is set
#[derive(Clone)]
pub struct LoadSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl LoadSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_contended(&self, contended: bool) {
        self.tx.send_replace(contended);
    }

    pub fn is_contended(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for LoadSignal {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Workers
// =============================================================================

/// What a worker did with one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchStatus {
    Completed,
    /// A fresh exact packet already existed
    SkippedFresh,
    /// Nothing scored above the whisper threshold
    Empty,
}

/// Runs one prefetch request end to end
#[async_trait]
pub trait PrefetchRunner: Send + Sync {
    async fn run(&self, request: PrefetchRequest) -> Result<PrefetchStatus>;
}

/// Spawn `workers` tasks draining `queue` through `runner`.
pub fn spawn_workers(
    queue: Arc<PrefetchQueue>,
    runner: Arc<dyn PrefetchRunner>,
    workers: usize,
    load: LoadSignal,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|worker_id| {
            let queue = queue.clone();
            let runner = runner.clone();
            let mut load_rx = load.subscribe();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                tracing::info!(worker_id, "Prefetch worker started");
                loop {
                    // Hold off while contended
                    if *load_rx.borrow() {
                        tracing::debug!(worker_id, "Prefetch worker paused");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            res = load_rx.wait_for(|contended| !*contended) => {
                                if res.is_err() {
                                    break;
                                }
                            }
                        }
                        tracing::debug!(worker_id, "Prefetch worker resumed");
                    }

                    let request = match queue.pop(&cancel).await {
                        Some(r) => r,
                        None => break,
                    };

                    let result = runner.run(request.clone()).await;
                    if let Err(e) = &result {
                        tracing::warn!(
                            worker_id,
                            session_id = %request.session_id,
                            tool = %request.predicted_tool,
                            error = %e,
                            "Prefetch request failed"
                        );
                    }
                    queue.record(&result);
                }
                tracing::info!(worker_id, "Prefetch worker stopped");
            })
        })
        .collect()
}
