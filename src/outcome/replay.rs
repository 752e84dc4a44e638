//! Replay aggregation
//!
//! Strictly linked outcomes are counted per `(tool, pattern_key)`. When an
//! alternative pattern clearly outperforms the dominant one for a tool, a
//! `replay` candidate is queued for that tool's next decision cycle.

use crate::advisory::types::AdviceCandidate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Source type of candidates produced here
pub const REPLAY_SOURCE: &str = "replay";

/// Aggregate of strict outcomes for one pattern on one tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayBucket {
    pub tool: String,
    pub pattern_key: String,
    pub strict_success_count: u32,
    pub strict_total_count: u32,
    pub last_seen: DateTime<Utc>,
}

impl ReplayBucket {
    pub fn success_rate(&self) -> f64 {
        if self.strict_total_count == 0 {
            0.0
        } else {
            self.strict_success_count as f64 / self.strict_total_count as f64
        }
    }
}

/// Persisted replay state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplaySnapshot {
    pub buckets: Vec<ReplayBucket>,
    /// `tool|alternative|dominant` combinations already emitted
    pub emitted: Vec<String>,
}

fn bucket_key(tool: &str, pattern_key: &str) -> (String, String) {
    (tool.to_string(), pattern_key.to_string())
}

fn combo_key(tool: &str, alternative: &str, dominant: &str) -> String {
    format!("{}|{}|{}", tool, alternative, dominant)
}

/// Replay bucket store and candidate inbox
pub struct ReplayEngine {
    buckets: RwLock<HashMap<(String, String), ReplayBucket>>,
    emitted: RwLock<HashSet<String>>,
    pending: RwLock<HashMap<String, Vec<AdviceCandidate>>>,
}

impl ReplayEngine {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            emitted: RwLock::new(HashSet::new()),
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Count one strict outcome
    pub async fn record(&self, tool: &str, pattern_key: &str, success: bool, at: DateTime<Utc>) {
        let mut buckets = self.buckets.write().await;
        let bucket = buckets
            .entry(bucket_key(tool, pattern_key))
            .or_insert_with(|| ReplayBucket {
                tool: tool.to_string(),
                pattern_key: pattern_key.to_string(),
                strict_success_count: 0,
                strict_total_count: 0,
                last_seen: at,
            });
        bucket.strict_total_count += 1;
        if success {
            bucket.strict_success_count += 1;
        }
        if at > bucket.last_seen {
            bucket.last_seen = at;
        }
    }

    pub async fn bucket(&self, tool: &str, pattern_key: &str) -> Option<ReplayBucket> {
        self.buckets
            .read()
            .await
            .get(&bucket_key(tool, pattern_key))
            .cloned()
    }

    /// Queue replay candidates for `tool` whose delta over the dominant
    /// pattern is met. Each combination is emitted at most once.
    pub async fn evaluate(
        &self,
        tool: &str,
        min_samples: u32,
        min_delta: f64,
        now: DateTime<Utc>,
    ) -> Vec<AdviceCandidate> {
        let tool_buckets: Vec<ReplayBucket> = self
            .buckets
            .read()
            .await
            .values()
            .filter(|b| b.tool == tool)
            .cloned()
            .collect();

        let Some(dominant) = tool_buckets
            .iter()
            .max_by(|a, b| {
                a.strict_total_count
                    .cmp(&b.strict_total_count)
                    .then_with(|| b.pattern_key.cmp(&a.pattern_key))
            })
            .cloned()
        else {
            return Vec::new();
        };
        if dominant.strict_total_count < min_samples {
            return Vec::new();
        }

        let mut fresh = Vec::new();
        let mut emitted = self.emitted.write().await;
        for alt in &tool_buckets {
            if alt.pattern_key == dominant.pattern_key || alt.strict_total_count < min_samples {
                continue;
            }
            // Small epsilon so a delta equal to the minimum qualifies
            if alt.success_rate() - dominant.success_rate() + 1e-9 < min_delta {
                continue;
            }
            if !emitted.insert(combo_key(tool, &alt.pattern_key, &dominant.pattern_key)) {
                continue;
            }

            tracing::info!(
                tool = %tool,
                alternative = %alt.pattern_key,
                dominant = %dominant.pattern_key,
                "Replay candidate emitted"
            );
            fresh.push(replay_candidate(tool, alt, &dominant, now));
        }
        drop(emitted);

        if !fresh.is_empty() {
            self.pending
                .write()
                .await
                .entry(tool.to_string())
                .or_default()
                .extend(fresh.iter().cloned());
        }
        fresh
    }

    /// Drain queued candidates for `tool`
    pub async fn take_pending(&self, tool: &str) -> Vec<AdviceCandidate> {
        self.pending.write().await.remove(tool).unwrap_or_default()
    }

    pub async fn bucket_count(&self) -> usize {
        self.buckets.read().await.len()
    }

    pub async fn emitted_count(&self) -> usize {
        self.emitted.read().await.len()
    }

    pub async fn export(&self) -> ReplaySnapshot {
        let mut emitted: Vec<String> = self.emitted.read().await.iter().cloned().collect();
        emitted.sort();
        ReplaySnapshot {
            buckets: self.buckets.read().await.values().cloned().collect(),
            emitted,
        }
    }

    pub async fn import(&self, snapshot: ReplaySnapshot) {
        let mut buckets = self.buckets.write().await;
        for bucket in snapshot.buckets {
            buckets.insert(bucket_key(&bucket.tool, &bucket.pattern_key), bucket);
        }
        self.emitted.write().await.extend(snapshot.emitted);
    }
}

impl Default for ReplayEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn replay_candidate(
    tool: &str,
    alt: &ReplayBucket,
    dominant: &ReplayBucket,
    now: DateTime<Utc>,
) -> AdviceCandidate {
    let text = format!(
        "For {}, the approach behind '{}' succeeded {:.0}% of the time versus {:.0}% for the usual '{}'; prefer it",
        tool,
        alt.pattern_key,
        alt.success_rate() * 100.0,
        dominant.success_rate() * 100.0,
        dominant.pattern_key
    );
    let samples = alt.strict_total_count as f64;
    AdviceCandidate::new(REPLAY_SOURCE, text)
        .with_id(format!("replay-{}-{}-{}", tool, alt.pattern_key, dominant.pattern_key))
        .with_confidence(alt.success_rate())
        .with_context_match(1.0)
        .with_reliability(samples / (samples + 5.0))
        .with_provenance(alt.pattern_key.clone())
        .with_observed_at(now)
}
