//! Advisory decision pipeline
//!
//! Evidence → ranking → authority gate → route (cache or synthesis) →
//! delivery, driven by [`AdvisoryEngine`].

pub mod delivery;
pub mod engine;
pub mod evidence;
pub mod fingerprint;
pub mod gate;
pub mod handler;
pub mod intent;
pub mod llm;
pub mod ranker;
pub mod synthesizer;
pub mod types;

pub use delivery::{DeliveryBadge, DeliveryStats, DeliveryTracker};
pub use engine::{AdvisoryEngine, AdvisoryEngineBuilder, StatusSnapshot};
pub use evidence::{EvidenceProvider, HttpEvidenceProvider, StaticEvidenceProvider};
pub use gate::{AuthorityClassifier, GateDecision, SelectedCandidate};
pub use handler::{advisory_router, AdvisoryState};
pub use intent::IntentTaxonomy;
pub use llm::{HttpLlmBackend, LlmBackend};
pub use ranker::{RankedCandidate, Ranker, Ranking, SourceBoosts};
pub use synthesizer::{SynthesisOutput, SynthesisStats, Synthesizer};
pub use types::{
    AdviceCandidate, AuthorityTier, Decision, DecisionContext, DeliveryEvent, ErrorCode,
    EvidenceBundle, GateReason, OutcomeRecord, Polarity, Route, SynthMode,
};
