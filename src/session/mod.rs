//! Session state and cross-session dedupe

mod dedupe;
mod manager;

pub use dedupe::{DedupeEntry, DedupeRegistry};
pub use manager::{Phase, SessionManager, SessionState, ShownFingerprint, ToolEvent};
