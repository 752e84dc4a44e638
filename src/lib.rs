//! Advisory - hook-time advisory decision and delivery engine
//!
//! Advisory sits between an AI coding agent's tool calls and its knowledge
//! stores. On every tool event it decides, within a hard latency budget,
//! whether to surface advice, how strongly, and what text to deliver. It
//! learns from the outcomes of the actions that followed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Hook API (axum)                          │
//! │   decide · outcomes · prefetch · invalidate · load · status      │
//! └───────────────┬───────────────────────────────┬──────────────────┘
//!                 │ hot path                       │ async intake
//! ┌───────────────▼──────────────────┐  ┌──────────▼───────────────┐
//! │          Advisory Engine          │  │     Outcome Linker       │
//! │  Evidence → Ranker → Gate         │  │  strict attribution      │
//! │     → Packet cache | Synthesizer  │  │  replay buckets          │
//! │     → Delivery tracker            │  │  effectiveness feedback  │
//! └───────┬──────────────────┬────────┘  └──────────┬───────────────┘
//!         │                  │                      │
//! ┌───────▼───────┐  ┌───────▼────────┐   ┌─────────▼──────────┐
//! │ Session state │  │ Packet cache    │◄──│ Prefetch workers   │
//! │ cooldowns     │  │ exact / relaxed │   │ (paused on load)   │
//! └───────────────┘  └─────────────────┘   └────────────────────┘
//!                    all state snapshotted to JSON files
//! ```
//!
//! ## Modules
//!
//! - [`advisory`]: decision pipeline, engine and hook API handlers
//! - [`cache`]: advisory packets, packet cache and prefetch queue
//! - [`outcome`]: outcome attribution and replay aggregation
//! - [`session`]: per-session state and cross-session dedupe
//! - [`history`]: bounded indexed logs and state persistence
//! - [`config`]: configuration snapshots and hot reload
//! - [`api`]: HTTP application assembly

pub mod advisory;
pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod history;
pub mod outcome;
pub mod session;

pub use advisory::{AdvisoryEngine, AdvisoryEngineBuilder, Decision, DecisionContext};
pub use config::AdvisoryConfig;
pub use error::{Error, Result};
