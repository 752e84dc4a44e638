//! Authority gate
//!
//! Turns a ranking into an emission decision. The tier strategy is a pure
//! function of the composite score over an immutable threshold set; the gate
//! then applies per-session cooldown and cross-session dedupe.
//!
//! Every evaluation yields a `(tier, suppressed, reason)` triple, with
//! `reason = ok` when nothing was suppressed.

use crate::advisory::ranker::{RankedCandidate, Ranking};
use crate::advisory::types::{AuthorityTier, GateReason};
use crate::config::GateConfig;
use crate::session::{DedupeRegistry, SessionState};
use chrono::{DateTime, Duration, Utc};

/// Map a composite score to a tier, checking from `Warning` down.
pub fn tier_for(score: f64, thresholds: &GateConfig) -> AuthorityTier {
    if !score.is_finite() {
        return AuthorityTier::Silent;
    }
    if score >= thresholds.warning_threshold {
        AuthorityTier::Warning
    } else if score >= thresholds.note_threshold {
        AuthorityTier::Note
    } else if score >= thresholds.whisper_threshold {
        AuthorityTier::Whisper
    } else {
        AuthorityTier::Silent
    }
}

/// Gate outcome for one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    /// Tier of the first selected candidate, or of the top candidate
    pub tier: AuthorityTier,
    pub suppressed: bool,
    pub reason: GateReason,
    /// Candidates cleared for delivery, best first
    pub selected: Vec<SelectedCandidate>,
}

/// A ranked candidate that passed the gate
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedCandidate {
    pub ranked: RankedCandidate,
    pub tier: AuthorityTier,
}

impl GateDecision {
    fn blocked(tier: AuthorityTier, suppressed: bool, reason: GateReason) -> Self {
        Self {
            tier,
            suppressed,
            reason,
            selected: Vec::new(),
        }
    }

    /// Whether the cycle proceeds to routing
    pub fn should_emit(&self) -> bool {
        !self.suppressed && self.tier > AuthorityTier::Silent && !self.selected.is_empty()
    }
}

/// Gate bound to one cooldown policy
pub struct AuthorityClassifier<'a> {
    config: &'a GateConfig,
    dedupe: &'a DedupeRegistry,
}

impl<'a> AuthorityClassifier<'a> {
    pub fn new(config: &'a GateConfig, dedupe: &'a DedupeRegistry) -> Self {
        Self { config, dedupe }
    }

    /// Evaluate a ranking against the session's history.
    pub async fn evaluate(
        &self,
        ranking: &Ranking,
        session: &SessionState,
        tool: &str,
        now: DateTime<Utc>,
    ) -> GateDecision {
        let ranked = match ranking {
            Ranking::NoEvidence => {
                return GateDecision::blocked(AuthorityTier::Silent, true, GateReason::NoEvidence)
            }
            Ranking::Ranked(list) => list,
        };

        let session_window = Duration::seconds(self.config.session_cooldown_secs as i64);
        let global_window = Duration::seconds(self.config.global_cooldown_secs as i64);
        let limit = self.config.max_emit_per_call.max(1);

        let mut selected: Vec<SelectedCandidate> = Vec::new();
        let mut top_reason: Option<GateReason> = None;

        for candidate in ranked {
            if selected.len() >= limit {
                break;
            }

            let tier = tier_for(candidate.composite, self.config);
            if tier == AuthorityTier::Silent {
                // Ranking is descending, so everything below is silent too
                top_reason.get_or_insert(GateReason::BelowThreshold);
                break;
            }

            let reason = if session.in_cooldown(tool, &candidate.fingerprint, now, session_window)
            {
                GateReason::CooldownActive
            } else if tier.is_low_authority()
                && self
                    .dedupe
                    .recently_shown_elsewhere(
                        &session.session_id,
                        tool,
                        &candidate.fingerprint,
                        now,
                        global_window,
                    )
                    .await
            {
                GateReason::GlobalDedupe
            } else {
                GateReason::Ok
            };
            top_reason.get_or_insert(reason);

            let duplicate = selected
                .iter()
                .any(|s| s.ranked.fingerprint == candidate.fingerprint);
            if reason == GateReason::Ok && !duplicate {
                selected.push(SelectedCandidate {
                    ranked: candidate.clone(),
                    tier,
                });
            }
        }

        if let Some(first) = selected.first() {
            return GateDecision {
                tier: first.tier,
                suppressed: false,
                reason: GateReason::Ok,
                selected,
            };
        }

        let top_tier = ranked
            .first()
            .map(|c| tier_for(c.composite, self.config))
            .unwrap_or_default();
        match top_reason.unwrap_or(GateReason::BelowThreshold) {
            GateReason::BelowThreshold => {
                GateDecision::blocked(AuthorityTier::Silent, false, GateReason::BelowThreshold)
            }
            reason => GateDecision::blocked(top_tier, true, reason),
        }
    }
}
