//! Ranker/fuser for evidence bundles
//!
//! ```text
//! composite = (confidence·w1 + context_match·w2 + reliability·w3)
//!             · source_boost · recency_decay · fatigue
//! ```
//!
//! Candidates are ordered by composite score, then confidence, then context
//! match, then most recent provenance. An empty bundle is an explicit
//! [`Ranking::NoEvidence`], never an empty list.

use crate::advisory::fingerprint::fingerprint;
use crate::advisory::types::{AdviceCandidate, EvidenceBundle};
use crate::config::RankerConfig;
use crate::session::SessionState;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A candidate with its fused score
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub candidate: AdviceCandidate,
    pub composite: f64,
    pub fingerprint: String,
}

/// Result of ranking a bundle
#[derive(Debug, Clone, PartialEq)]
pub enum Ranking {
    /// Bundle was empty or held no valid candidates
    NoEvidence,
    /// Candidates in descending order
    Ranked(Vec<RankedCandidate>),
}

impl Ranking {
    pub fn top(&self) -> Option<&RankedCandidate> {
        match self {
            Ranking::NoEvidence => None,
            Ranking::Ranked(list) => list.first(),
        }
    }

    pub fn candidates(&self) -> &[RankedCandidate] {
        match self {
            Ranking::NoEvidence => &[],
            Ranking::Ranked(list) => list,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Ranking::NoEvidence)
    }
}

/// Per-source boosts, seeded from config and nudged by outcome feedback
pub struct SourceBoosts {
    boosts: RwLock<HashMap<String, f64>>,
}

impl SourceBoosts {
    pub fn new(initial: HashMap<String, f64>) -> Self {
        Self {
            boosts: RwLock::new(initial),
        }
    }

    pub fn from_config(config: &RankerConfig) -> Self {
        Self::new(config.source_boosts.clone())
    }

    /// Boost for a source (1.0 when unknown)
    pub async fn get(&self, source: &str) -> f64 {
        self.boosts.read().await.get(source).copied().unwrap_or(1.0)
    }

    /// Copy of the table for one ranking pass
    pub async fn snapshot(&self) -> HashMap<String, f64> {
        self.boosts.read().await.clone()
    }

    /// Add `delta` to a source's boost, clamped to `[min, max]`. Returns the new value.
    pub async fn adjust(&self, source: &str, delta: f64, min: f64, max: f64) -> f64 {
        let mut boosts = self.boosts.write().await;
        let entry = boosts.entry(source.to_string()).or_insert(1.0);
        *entry = (*entry + delta).clamp(min, max);
        *entry
    }

    /// Replace the table with persisted values
    pub async fn import(&self, values: HashMap<String, f64>) {
        let mut boosts = self.boosts.write().await;
        for (source, value) in values {
            if value.is_finite() && value > 0.0 {
                boosts.insert(source, value);
            }
        }
    }
}

impl Default for SourceBoosts {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

/// Stateless ranker
pub struct Ranker;

impl Ranker {
    /// Score and order a bundle.
    pub fn rank(
        bundle: &EvidenceBundle,
        config: &RankerConfig,
        boosts: &HashMap<String, f64>,
        session: &SessionState,
        now: DateTime<Utc>,
    ) -> Ranking {
        let mut ranked: Vec<RankedCandidate> = bundle
            .candidates
            .iter()
            .filter(|c| c.is_valid())
            .map(|c| {
                let fp = fingerprint(&c.text);
                let composite = Self::composite(c, &fp, config, boosts, session, now);
                RankedCandidate {
                    candidate: c.clone(),
                    composite,
                    fingerprint: fp,
                }
            })
            .collect();

        if ranked.is_empty() {
            return Ranking::NoEvidence;
        }

        ranked.sort_by(Self::compare);
        Ranking::Ranked(ranked)
    }

    /// Composite score of one candidate
    pub fn composite(
        candidate: &AdviceCandidate,
        fingerprint: &str,
        config: &RankerConfig,
        boosts: &HashMap<String, f64>,
        session: &SessionState,
        now: DateTime<Utc>,
    ) -> f64 {
        let base = candidate.confidence.clamp(0.0, 1.0) * config.confidence_weight
            + candidate.context_match.clamp(0.0, 1.0) * config.context_weight
            + candidate.reliability.clamp(0.0, 1.0) * config.reliability_weight;

        let boost = boosts
            .get(&candidate.source_type)
            .copied()
            .filter(|b| b.is_finite() && *b > 0.0)
            .unwrap_or(1.0);

        let fatigue = if config.fatigue_after > 0
            && session.emit_count(fingerprint) >= config.fatigue_after
        {
            config.fatigue_penalty
        } else {
            1.0
        };

        base * boost * Self::recency_decay(candidate.observed_at, config, now) * fatigue
    }

    /// `max(floor, 0.5^(age_hours / half_life))`, 1.0 without a timestamp
    pub fn recency_decay(
        observed_at: Option<DateTime<Utc>>,
        config: &RankerConfig,
        now: DateTime<Utc>,
    ) -> f64 {
        let Some(at) = observed_at else {
            return 1.0;
        };
        if config.recency_half_life_hours <= 0.0 {
            return 1.0;
        }
        let age_hours = ((now - at).num_seconds().max(0) as f64) / 3600.0;
        0.5f64
            .powf(age_hours / config.recency_half_life_hours)
            .max(config.recency_floor)
    }

    fn compare(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
        b.composite
            .partial_cmp(&a.composite)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.candidate
                    .confidence
                    .partial_cmp(&a.candidate.confidence)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| {
                b.candidate
                    .context_match
                    .partial_cmp(&a.candidate.context_match)
                    .unwrap_or(Ordering::Equal)
            })
            // Most recent provenance first; undated candidates last
            .then_with(|| b.candidate.observed_at.cmp(&a.candidate.observed_at))
            .then_with(|| a.candidate.id.cmp(&b.candidate.id))
    }
}
