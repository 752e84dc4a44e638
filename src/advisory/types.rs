//! Core advisory data types
//!
//! Candidates come in from the evidence provider, decisions go out to the
//! host runtime, and every cycle leaves exactly one `DeliveryEvent` behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Escalation level controlling whether and how strongly advice surfaces.
///
/// Ordered: `Silent < Whisper < Note < Warning`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityTier {
    /// Recorded, never surfaced
    #[default]
    Silent,
    /// Low-key hint
    Whisper,
    /// Regular advisory note
    Note,
    /// Strong warning
    Warning,
}

impl AuthorityTier {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorityTier::Silent => "silent",
            AuthorityTier::Whisper => "whisper",
            AuthorityTier::Note => "note",
            AuthorityTier::Warning => "warning",
        }
    }

    /// Prefix used by deterministic synthesis
    pub fn label(&self) -> &'static str {
        match self {
            AuthorityTier::Silent => "",
            AuthorityTier::Whisper => "Hint",
            AuthorityTier::Note => "Note",
            AuthorityTier::Warning => "Warning",
        }
    }

    /// Low-authority tiers are subject to cross-session dedupe
    pub fn is_low_authority(&self) -> bool {
        matches!(self, AuthorityTier::Whisper | AuthorityTier::Note)
    }
}

impl fmt::Display for AuthorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synthesis mode, both as configured and as resolved for one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthMode {
    /// Template composition, constant time
    #[default]
    Deterministic,
    /// LLM synthesis with a deadline
    Ai,
    /// LLM only for high tiers with enough budget left
    Selective,
}

impl SynthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SynthMode::Deterministic => "deterministic",
            SynthMode::Ai => "ai",
            SynthMode::Selective => "selective",
        }
    }
}

/// How the delivered text was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Packet matched the full key
    CacheExact,
    /// Packet matched by similarity
    CacheRelaxed,
    /// Synthesized in this cycle as planned
    Live,
    /// Deterministic text substituted for an AI path
    Fallback,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::CacheExact => "cache_exact",
            Route::CacheRelaxed => "cache_relaxed",
            Route::Live => "live",
            Route::Fallback => "fallback",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error tags recorded in delivery events and outcome statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Evidence provider failed or timed out
    EvidenceUnavailable,
    /// AI synthesis replaced by the deterministic result
    SynthFallback,
    /// A cache entry could not be served
    CacheCorrupt,
    /// Outcome trace was duplicate, ambiguous or out of window
    TraceAmbiguous,
    /// Outcome trace matched no delivery
    TraceUnmatched,
    /// Outcome record was not strict
    WeakLink,
    /// Outcome referred to a cycle that emitted nothing
    NotEmitted,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::EvidenceUnavailable => "EVIDENCE_UNAVAILABLE",
            ErrorCode::SynthFallback => "SYNTH_FALLBACK",
            ErrorCode::CacheCorrupt => "CACHE_CORRUPT",
            ErrorCode::TraceAmbiguous => "TRACE_AMBIGUOUS",
            ErrorCode::TraceUnmatched => "TRACE_UNMATCHED",
            ErrorCode::WeakLink => "WEAK_LINK",
            ErrorCode::NotEmitted => "NOT_EMITTED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the gate (or the final delivery check) decided as it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    /// Emission allowed
    Ok,
    /// Nothing to rank
    NoEvidence,
    /// Top score below the whisper threshold
    BelowThreshold,
    /// Same fingerprint shown for this tool within the session cooldown
    CooldownActive,
    /// Same low-authority fingerprint shown in another session recently
    GlobalDedupe,
}

impl GateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateReason::Ok => "ok",
            GateReason::NoEvidence => "no_evidence",
            GateReason::BelowThreshold => "below_threshold",
            GateReason::CooldownActive => "cooldown_active",
            GateReason::GlobalDedupe => "global_dedupe",
        }
    }
}

impl fmt::Display for GateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Evidence
// =============================================================================

/// One piece of retrieved evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviceCandidate {
    /// Candidate identifier, unique within its provider
    pub id: String,
    /// Producing source (e.g. `cognitive`, `replay`)
    pub source_type: String,
    /// Advice text
    pub text: String,
    /// Provider confidence in [0, 1]
    pub confidence: f64,
    /// Match against the current context in [0, 1]
    pub context_match: f64,
    /// Historical reliability of the source in [0, 1]
    pub reliability: f64,
    /// Stable key of the underlying pattern/insight
    pub provenance_key: String,
    /// Trace that produced this candidate, if any
    #[serde(default)]
    pub trace_id: Option<String>,
    /// When the underlying evidence was last observed
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

impl AdviceCandidate {
    /// Create a candidate with neutral scores; the provenance key defaults to the id.
    pub fn new(source_type: impl Into<String>, text: impl Into<String>) -> Self {
        let id = format!("cand-{}", Uuid::new_v4());
        Self {
            provenance_key: id.clone(),
            id,
            source_type: source_type.into(),
            text: text.into(),
            confidence: 0.5,
            context_match: 0.5,
            reliability: 0.5,
            trace_id: None,
            observed_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_confidence(mut self, value: f64) -> Self {
        self.confidence = value;
        self
    }

    pub fn with_context_match(mut self, value: f64) -> Self {
        self.context_match = value;
        self
    }

    pub fn with_reliability(mut self, value: f64) -> Self {
        self.reliability = value;
        self
    }

    pub fn with_provenance(mut self, key: impl Into<String>) -> Self {
        self.provenance_key = key.into();
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = Some(at);
        self
    }

    /// Whether the candidate can be ranked at all
    pub fn is_valid(&self) -> bool {
        !self.text.trim().is_empty()
            && self.confidence.is_finite()
            && self.context_match.is_finite()
            && self.reliability.is_finite()
    }
}

/// Ordered candidates for one `(session_id, tool, intent_context)`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub session_id: String,
    pub tool: String,
    pub intent_context: String,
    pub candidates: Vec<AdviceCandidate>,
}

impl EvidenceBundle {
    pub fn new(
        session_id: impl Into<String>,
        tool: impl Into<String>,
        intent_context: impl Into<String>,
        candidates: Vec<AdviceCandidate>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            tool: tool.into(),
            intent_context: intent_context.into(),
            candidates,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

// =============================================================================
// Decision interface
// =============================================================================

/// Caller-supplied context for one tool event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionContext {
    /// Project the session works in
    pub project_id: Option<String>,
    /// Free-form description of what the agent is doing
    pub intent_context: String,
    /// Explicit intent cluster (derived from `intent_context` when absent)
    pub intent_cluster: Option<String>,
    /// Explicit domain category (derived from `file_path` when absent)
    pub domain_category: Option<String>,
    /// File the tool is about to touch
    pub file_path: Option<String>,
}

impl DecisionContext {
    pub fn new(intent_context: impl Into<String>) -> Self {
        Self {
            intent_context: intent_context.into(),
            ..Default::default()
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }
}

/// Result of one hot-path decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the host should surface `text`
    pub emit: bool,
    /// Advisory text when emitted
    pub text: Option<String>,
    pub authority_tier: AuthorityTier,
    /// Trace to report outcomes against
    pub trace_id: String,
    pub reason: GateReason,
    pub route: Option<Route>,
}

// =============================================================================
// Delivery and outcome records
// =============================================================================

/// Append-only record of one decision cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub trace_id: String,
    pub session_id: String,
    pub tool: String,
    pub authority_tier: AuthorityTier,
    pub route: Option<Route>,
    pub synth_mode: Option<SynthMode>,
    pub elapsed_ms: u64,
    pub emitted: bool,
    pub text: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub reason: GateReason,
    /// Packet that served or was written by this cycle
    pub packet_id: Option<String>,
    /// Provenance key of the leading delivered candidate
    pub pattern_key: Option<String>,
    /// Sources of the delivered candidates
    pub source_types: Vec<String>,
    /// Fingerprints of the delivered candidates
    pub fingerprints: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryEvent {
    /// The event ended without emission because something failed
    pub fn is_blocked(&self) -> bool {
        !self.emitted && self.error_code.is_some()
    }
}

/// Whether the action following advice went well
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Good,
    Bad,
}

/// Externally observed outcome of a tool action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub trace_id: String,
    pub tool: String,
    pub polarity: Polarity,
    #[serde(default = "Utc::now")]
    pub observed_at: DateTime<Utc>,
    /// The producer vouches for the trace binding
    #[serde(default = "default_strict")]
    pub strict: bool,
}

fn default_strict() -> bool {
    true
}

impl OutcomeRecord {
    pub fn new(trace_id: impl Into<String>, tool: impl Into<String>, polarity: Polarity) -> Self {
        Self {
            trace_id: trace_id.into(),
            tool: tool.into(),
            polarity,
            observed_at: Utc::now(),
            strict: true,
        }
    }
}

/// Fresh trace identifier for a decision cycle
pub fn new_trace_id() -> String {
    format!("adv-{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(AuthorityTier::Silent < AuthorityTier::Whisper);
        assert!(AuthorityTier::Whisper < AuthorityTier::Note);
        assert!(AuthorityTier::Note < AuthorityTier::Warning);
        assert!(AuthorityTier::Note.is_low_authority());
        assert!(!AuthorityTier::Warning.is_low_authority());
    }

    #[test]
    fn test_enum_wire_names() {
        assert_eq!(
            serde_json::to_value(Route::CacheRelaxed).unwrap(),
            serde_json::json!("cache_relaxed")
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::SynthFallback).unwrap(),
            serde_json::json!("SYNTH_FALLBACK")
        );
        assert_eq!(
            serde_json::to_value(GateReason::CooldownActive).unwrap(),
            serde_json::json!("cooldown_active")
        );
        assert_eq!(GateReason::Ok.to_string(), "ok");
    }

    #[test]
    fn test_candidate_validity() {
        let ok = AdviceCandidate::new("cognitive", "Run tests before committing");
        assert!(ok.is_valid());
        assert_eq!(ok.provenance_key, ok.id);

        let blank = AdviceCandidate::new("cognitive", "   ");
        assert!(!blank.is_valid());

        let nan = AdviceCandidate::new("cognitive", "text").with_confidence(f64::NAN);
        assert!(!nan.is_valid());
    }

    #[test]
    fn test_outcome_strict_defaults_true() {
        let json = serde_json::json!({
            "trace_id": "adv-1",
            "tool": "Edit",
            "polarity": "good",
            "observed_at": "2026-01-01T00:00:00Z"
        });
        let record: OutcomeRecord = serde_json::from_value(json).unwrap();
        assert!(record.strict);
        assert_eq!(record.polarity, Polarity::Good);
    }

    #[test]
    fn test_trace_ids_unique() {
        assert_ne!(new_trace_id(), new_trace_id());
        assert!(new_trace_id().starts_with("adv-"));
    }
}
