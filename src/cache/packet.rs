//! Advisory packets
//!
//! A packet is pre-synthesized advice stored under a
//! `(project, phase, domain, tool, intent)` key.

use crate::advisory::types::AuthorityTier;
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lookup key of a packet
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketKey {
    pub project_id: String,
    pub phase: String,
    pub domain_category: String,
    pub tool: String,
    pub intent_cluster: String,
}

impl PacketKey {
    pub fn new(
        project_id: impl Into<String>,
        phase: impl Into<String>,
        domain_category: impl Into<String>,
        tool: impl Into<String>,
        intent_cluster: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            phase: phase.into(),
            domain_category: domain_category.into(),
            tool: tool.into(),
            intent_cluster: intent_cluster.into(),
        }
    }

    /// Whether `value` equals any component
    pub fn has_component(&self, value: &str) -> bool {
        self.project_id == value
            || self.phase == value
            || self.domain_category == value
            || self.tool == value
            || self.intent_cluster == value
    }
}

impl fmt::Display for PacketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.project_id, self.phase, self.domain_category, self.tool, self.intent_cluster
        )
    }
}

/// Who wrote the packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketSource {
    /// Synthesized on the hot path
    #[default]
    Live,
    /// Synthesized ahead of time by a prefetch worker
    Prefetch,
}

/// Pre-synthesized advice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryPacket {
    pub packet_id: String,
    pub key: PacketKey,
    pub ranked_candidate_ids: Vec<String>,
    pub synthesized_text: String,
    pub tier: AuthorityTier,
    /// Composite score of the lead candidate
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub effectiveness_score: f64,
    pub usage_count: u32,
    /// Scope tags (`file:`, `project:`, `tool:`) used by invalidation
    pub scope_keys: Vec<String>,
    pub source: PacketSource,
    /// Provenance key of the lead candidate
    #[serde(default)]
    pub pattern_key: Option<String>,
    #[serde(default)]
    pub source_types: Vec<String>,
    /// Fingerprints of the candidates the text was built from
    #[serde(default)]
    pub fingerprints: Vec<String>,
}

impl AdvisoryPacket {
    /// New packet with a fresh id, stamped `now`
    pub fn new(
        key: PacketKey,
        synthesized_text: impl Into<String>,
        tier: AuthorityTier,
        confidence: f64,
        ttl_secs: u64,
        effectiveness: f64,
        now: DateTime<Utc>,
    ) -> Self {
        let scope_keys = vec![
            format!("project:{}", key.project_id),
            format!("tool:{}", key.tool),
        ];
        Self {
            packet_id: format!("pkt-{}", Uuid::new_v4()),
            key,
            ranked_candidate_ids: Vec::new(),
            synthesized_text: synthesized_text.into(),
            tier,
            confidence,
            created_at: now,
            ttl_secs,
            effectiveness_score: effectiveness,
            usage_count: 0,
            scope_keys,
            source: PacketSource::Live,
            pattern_key: None,
            source_types: Vec::new(),
            fingerprints: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: PacketSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_candidates(
        mut self,
        ids: Vec<String>,
        source_types: Vec<String>,
        fingerprints: Vec<String>,
    ) -> Self {
        self.ranked_candidate_ids = ids;
        self.source_types = source_types;
        self.fingerprints = fingerprints;
        self
    }

    pub fn with_pattern_key(mut self, pattern_key: Option<String>) -> Self {
        self.pattern_key = pattern_key;
        self
    }

    /// Tag the packet with the file it was synthesized for
    pub fn with_file_scope(mut self, path: Option<&str>) -> Self {
        if let Some(path) = path.filter(|p| !p.is_empty()) {
            self.scope_keys.push(format!("file:{}", path));
        }
        self
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::seconds(self.ttl_secs.min(i64::MAX as u64) as i64)
    }

    /// Expired packets are never served
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// Reject packets that cannot be served safely
    pub fn validate(&self) -> Result<()> {
        if self.packet_id.is_empty() {
            return Err(Error::Cache("packet has no id".to_string()));
        }
        if self.synthesized_text.trim().is_empty() {
            return Err(Error::Cache(format!("packet {} has no text", self.packet_id)));
        }
        if !self.confidence.is_finite() || !self.effectiveness_score.is_finite() {
            return Err(Error::Cache(format!(
                "packet {} has non-finite scores",
                self.packet_id
            )));
        }
        Ok(())
    }

    pub fn is_corrupt(&self) -> bool {
        self.validate().is_err()
    }

    /// Conflict rule for two writes under the same key
    pub fn supersedes(&self, other: &AdvisoryPacket) -> bool {
        self.created_at > other.created_at
            || (self.created_at == other.created_at && self.confidence >= other.confidence)
    }
}
