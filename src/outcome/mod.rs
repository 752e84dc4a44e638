//! Outcome attribution and replay
//!
//! Outcomes arrive asynchronously from the host runtime. Strictly linked
//! outcomes feed replay buckets, packet effectiveness and source boosts.

pub mod linker;
pub mod replay;

pub use linker::{attribute, LinkResult, LinkStats, OutcomeEntry, OutcomeLinker};
pub use replay::{ReplayBucket, ReplayEngine, ReplaySnapshot, REPLAY_SOURCE};
