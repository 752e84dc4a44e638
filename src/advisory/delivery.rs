//! Delivery tracking
//!
//! Every decision cycle ends with exactly one `DeliveryEvent`, emitted or
//! not. The tracker keeps a bounded indexed history of them, aggregate
//! counters for the status snapshot, and the rolling delivery-mode badge.

use crate::advisory::types::{AuthorityTier, DeliveryEvent, Route};
use crate::history::{BoundedLog, Traced};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;

impl Traced for DeliveryEvent {
    fn trace_id(&self) -> &str {
        &self.trace_id
    }

    fn session_id(&self) -> Option<&str> {
        Some(&self.session_id)
    }
}

/// Final emission rule: any tier above `Silent`, not suppressed, with text.
pub fn should_emit(tier: AuthorityTier, suppressed: bool, text: Option<&str>) -> bool {
    tier > AuthorityTier::Silent
        && !suppressed
        && text.map(|t| !t.trim().is_empty()).unwrap_or(false)
}

/// Rolling delivery mode over recent cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryBadge {
    Live,
    Fallback,
    Blocked,
    Stale,
}

impl DeliveryBadge {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryBadge::Live => "live",
            DeliveryBadge::Fallback => "fallback",
            DeliveryBadge::Blocked => "blocked",
            DeliveryBadge::Stale => "stale",
        }
    }
}

/// Compute the badge from events ordered newest first.
pub fn compute_badge(
    recent: &[&DeliveryEvent],
    now: DateTime<Utc>,
    stale_after: Duration,
) -> DeliveryBadge {
    let Some(newest) = recent.first() else {
        return DeliveryBadge::Stale;
    };
    if now - newest.created_at > stale_after {
        return DeliveryBadge::Stale;
    }

    let blocked = recent.iter().filter(|e| e.is_blocked()).count();
    if blocked * 2 > recent.len() {
        return DeliveryBadge::Blocked;
    }

    let emitted: Vec<&&DeliveryEvent> = recent.iter().filter(|e| e.emitted).collect();
    let fallback = emitted
        .iter()
        .filter(|e| e.route == Some(Route::Fallback))
        .count();
    if !emitted.is_empty() && fallback * 2 >= emitted.len() {
        return DeliveryBadge::Fallback;
    }

    DeliveryBadge::Live
}

/// Aggregate delivery counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub total: u64,
    pub emitted: u64,
    pub by_route: BTreeMap<String, u64>,
    pub by_tier: BTreeMap<String, u64>,
    pub by_reason: BTreeMap<String, u64>,
    pub by_error: BTreeMap<String, u64>,
    pub retained: usize,
}

impl DeliveryStats {
    fn count(&mut self, event: &DeliveryEvent) {
        self.total += 1;
        if event.emitted {
            self.emitted += 1;
        }
        let route = event.route.map(|r| r.as_str()).unwrap_or("none");
        *self.by_route.entry(route.to_string()).or_default() += 1;
        *self
            .by_tier
            .entry(event.authority_tier.as_str().to_string())
            .or_default() += 1;
        *self
            .by_reason
            .entry(event.reason.as_str().to_string())
            .or_default() += 1;
        if let Some(code) = event.error_code {
            *self.by_error.entry(code.as_str().to_string()).or_default() += 1;
        }
    }
}

struct TrackerInner {
    log: BoundedLog<DeliveryEvent>,
    stats: DeliveryStats,
}

/// Bounded, indexed delivery history
pub struct DeliveryTracker {
    inner: RwLock<TrackerInner>,
}

impl DeliveryTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(TrackerInner {
                log: BoundedLog::new(capacity),
                stats: DeliveryStats::default(),
            }),
        }
    }

    /// Append the event for one cycle
    pub async fn record(&self, event: DeliveryEvent) {
        tracing::debug!(
            trace_id = %event.trace_id,
            session_id = %event.session_id,
            tool = %event.tool,
            tier = %event.authority_tier,
            route = event.route.map(|r| r.as_str()).unwrap_or("none"),
            emitted = event.emitted,
            reason = %event.reason,
            elapsed_ms = event.elapsed_ms,
            "Delivery recorded"
        );
        let mut inner = self.inner.write().await;
        inner.stats.count(&event);
        inner.log.push(event);
    }

    /// Events carrying `trace_id`, oldest first
    pub async fn by_trace(&self, trace_id: &str) -> Vec<DeliveryEvent> {
        self.inner
            .read()
            .await
            .log
            .by_trace(trace_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Trace ids still held in the log
    pub async fn trace_ids(&self) -> HashSet<String> {
        self.inner
            .read()
            .await
            .log
            .trace_ids()
            .map(str::to_string)
            .collect()
    }

    /// Events of a session, oldest first
    pub async fn by_session(&self, session_id: &str) -> Vec<DeliveryEvent> {
        self.inner
            .read()
            .await
            .log
            .by_session(session_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Newest `n` events, newest first
    pub async fn recent(&self, n: usize) -> Vec<DeliveryEvent> {
        self.inner
            .read()
            .await
            .log
            .recent(n)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn badge(&self, window: usize, stale_after: Duration, now: DateTime<Utc>) -> DeliveryBadge {
        let inner = self.inner.read().await;
        let recent = inner.log.recent(window.max(1));
        compute_badge(&recent, now, stale_after)
    }

    pub async fn stats(&self) -> DeliveryStats {
        let inner = self.inner.read().await;
        DeliveryStats {
            retained: inner.log.len(),
            ..inner.stats.clone()
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.log.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.log.is_empty()
    }

    /// Export history for persistence, oldest first
    pub async fn export(&self) -> Vec<DeliveryEvent> {
        self.inner.read().await.log.export()
    }

    /// Reload persisted history; counters are rebuilt from it
    pub async fn import(&self, events: Vec<DeliveryEvent>) {
        let mut inner = self.inner.write().await;
        for event in events {
            inner.stats.count(&event);
            inner.log.push(event);
        }
    }
}
