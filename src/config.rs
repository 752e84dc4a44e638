//! Advisory configuration management
//!
//! Every tunable the engine uses lives here as a named parameter with a
//! documented default. The engine never reads configuration in place: each
//! decision cycle takes an immutable snapshot from a [`ConfigHandle`], and the
//! [`spawn_config_reloader`] task swaps in a new snapshot between cycles when
//! the backing file changes.

use crate::advisory::types::{AuthorityTier, SynthMode};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;

/// Main advisory configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisoryConfig {
    /// Hot-path budget and evidence settings
    pub engine: EngineConfig,

    /// Ranker/fuser weights and boosts
    pub ranker: RankerConfig,

    /// Authority thresholds and cooldowns
    pub gate: GateConfig,

    /// Packet cache sizing, TTL and feedback
    pub cache: CacheConfig,

    /// Background prefetch pool
    pub prefetch: PrefetchConfig,

    /// Synthesis mode and AI backend
    pub synthesis: SynthesisConfig,

    /// Delivery history and badge
    pub delivery: DeliveryConfig,

    /// Outcome attribution and replay
    pub outcome: OutcomeConfig,

    /// Evidence provider wiring
    pub evidence: EvidenceConfig,

    /// Persisted state location
    pub storage: StorageConfig,

    /// Hook API server
    pub server: ServerConfig,
}

/// Hot-path engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard wall-clock budget for one decision cycle in milliseconds
    pub budget_ms: u64,

    /// Upper bound for the evidence provider call in milliseconds
    pub evidence_timeout_ms: u64,

    /// Budget kept in reserve for deterministic synthesis and bookkeeping
    pub safety_margin_ms: u64,

    /// Project used when the caller does not supply one
    pub default_project: String,

    /// Number of tool events retained per session
    pub tool_history_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            budget_ms: 4000,
            evidence_timeout_ms: 1500,
            safety_margin_ms: 50,
            default_project: "default".to_string(),
            tool_history_len: 32,
        }
    }
}

/// Ranker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankerConfig {
    /// Weight of candidate confidence (w1)
    pub confidence_weight: f64,

    /// Weight of context match (w2)
    pub context_weight: f64,

    /// Weight of source reliability (w3)
    pub reliability_weight: f64,

    /// Initial per-source boosts; sources not listed use 1.0
    pub source_boosts: HashMap<String, f64>,

    /// Half-life for provenance recency decay in hours
    pub recency_half_life_hours: f64,

    /// Lower bound for the recency multiplier
    pub recency_floor: f64,

    /// Emissions of the same fingerprint in a session before fatigue applies
    pub fatigue_after: u32,

    /// Multiplier applied to fatigued candidates
    pub fatigue_penalty: f64,

    /// Lower clamp for learned source boosts
    pub boost_min: f64,

    /// Upper clamp for learned source boosts
    pub boost_max: f64,

    /// Boost adjustment per linked outcome
    pub boost_step: f64,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            confidence_weight: 0.5,
            context_weight: 0.3,
            reliability_weight: 0.2,
            source_boosts: HashMap::new(),
            recency_half_life_hours: 72.0,
            recency_floor: 0.3,
            fatigue_after: 3,
            fatigue_penalty: 0.7,
            boost_min: 0.5,
            boost_max: 1.5,
            boost_step: 0.02,
        }
    }
}

/// Authority gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Minimum composite score for `Warning`
    pub warning_threshold: f64,

    /// Minimum composite score for `Note`
    pub note_threshold: f64,

    /// Minimum composite score for `Whisper`
    pub whisper_threshold: f64,

    /// Per-session, per-tool fingerprint cooldown in seconds
    pub session_cooldown_secs: u64,

    /// Cross-session cooldown for `Whisper`/`Note` in seconds
    pub global_cooldown_secs: u64,

    /// Maximum candidates surfaced in one cycle
    pub max_emit_per_call: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 0.80,
            note_threshold: 0.55,
            whisper_threshold: 0.35,
            session_cooldown_secs: 600,
            global_cooldown_secs: 600,
            max_emit_per_call: 2,
        }
    }
}

/// Packet cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum packets held before LRU eviction
    pub capacity: usize,

    /// Packet time-to-live in seconds
    pub packet_ttl_secs: u64,

    /// Minimum similarity for a relaxed hit
    pub relaxed_min_score: f64,

    /// Packets below this effectiveness are never served
    pub min_effectiveness: f64,

    /// Effectiveness assigned to new packets
    pub initial_effectiveness: f64,

    /// Relaxed similarity weight for a tool match
    pub tool_weight: f64,

    /// Relaxed similarity weight for an intent cluster match
    pub intent_weight: f64,

    /// Relaxed similarity weight for a domain category match
    pub domain_weight: f64,

    /// Relaxed similarity weight for packet freshness
    pub recency_weight: f64,

    /// Effectiveness boost on a linked good outcome
    pub positive_boost: f64,

    /// Effectiveness decay on a linked bad outcome
    pub negative_decay: f64,

    /// Effectiveness decay when a served packet saw no outcome
    pub unused_decay: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 2000,
            packet_ttl_secs: 900,
            relaxed_min_score: 0.6,
            min_effectiveness: 0.3,
            initial_effectiveness: 0.5,
            tool_weight: 0.4,
            intent_weight: 0.3,
            domain_weight: 0.2,
            recency_weight: 0.1,
            positive_boost: 0.1,
            negative_decay: 0.15,
            unused_decay: 0.05,
        }
    }
}

/// Prefetch worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Enable the background pool
    pub enabled: bool,

    /// Fixed worker count
    pub workers: usize,

    /// Maximum queued requests before dropping the lowest priority
    pub queue_capacity: usize,

    /// Timeout for AI synthesis off the hot path in milliseconds
    pub ai_timeout_ms: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 2,
            queue_capacity: 64,
            ai_timeout_ms: 8000,
        }
    }
}

/// Synthesis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Synthesis mode on the hot path
    pub mode: SynthMode,

    /// Minimum tier for AI in selective mode
    pub min_authority: AuthorityTier,

    /// Minimum remaining budget for AI in selective mode
    pub min_remaining_ms: u64,

    /// Maximum characters in synthesized text
    pub max_chars: usize,

    /// Maximum candidates composed into one advisory
    pub max_items: usize,

    /// TTL for the candidate-set synthesis cache in seconds
    pub cache_ttl_secs: u64,

    /// Capacity of the synthesis cache
    pub cache_capacity: u64,

    /// Keep AI results that arrive after the deadline for the next repeat
    pub warm_on_late_result: bool,

    /// AI backend; AI modes fall back to deterministic when absent
    pub llm: Option<LlmConfig>,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            mode: SynthMode::Deterministic,
            min_authority: AuthorityTier::Note,
            min_remaining_ms: 1200,
            max_chars: 400,
            max_items: 2,
            cache_ttl_secs: 60,
            cache_capacity: 1024,
            warm_on_late_result: true,
            llm: None,
        }
    }
}

/// OpenAI-compatible chat completions backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`
    pub base_url: String,

    /// Model identifier
    pub model: String,

    /// Environment variable holding the API key
    pub api_key_env: String,

    /// Completion token limit
    pub max_tokens: u32,

    /// Sampling temperature
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_tokens: 200,
            temperature: 0.2,
        }
    }
}

/// Delivery tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Delivery events retained in the history ring
    pub history_capacity: usize,

    /// Events considered for the delivery-mode badge
    pub badge_window: usize,

    /// Badge turns `stale` when the newest event is older than this
    pub stale_after_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            history_capacity: 5000,
            badge_window: 20,
            stale_after_secs: 900,
        }
    }
}

/// Outcome attribution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutcomeConfig {
    /// Strict attribution window in seconds
    pub window_secs: u64,

    /// Minimum strict samples per pattern before replay compares it
    pub replay_min_samples: u32,

    /// Required success-rate advantage of the alternative pattern
    pub replay_min_delta: f64,

    /// Capacity of the outcome intake channel
    pub channel_capacity: usize,

    /// Interval of the non-use sweep in seconds
    pub sweep_interval_secs: u64,

    /// Outcome records retained in history
    pub history_capacity: usize,
}

impl Default for OutcomeConfig {
    fn default() -> Self {
        Self {
            window_secs: 1800,
            replay_min_samples: 5,
            replay_min_delta: 0.2,
            channel_capacity: 1024,
            sweep_interval_secs: 60,
            history_capacity: 5000,
        }
    }
}

/// Evidence provider configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    /// HTTP endpoint of the retrieval service
    pub endpoint: Option<String>,

    /// JSON file with static candidates keyed by tool
    pub file: Option<PathBuf>,
}

/// Persisted state configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the JSON state snapshots
    pub base_dir: PathBuf,

    /// Interval between background snapshots in seconds
    pub persist_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: dirs_next::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".advisory")
                .join("state"),
            persist_interval_secs: 30,
        }
    }
}

/// Hook API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Allowed CORS origins (empty = any)
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18791,
            cors_origins: Vec::new(),
        }
    }
}

impl AdvisoryConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AdvisoryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check ranges and orderings the engine relies on.
    pub fn validate(&self) -> Result<()> {
        let gate = &self.gate;
        if !(gate.warning_threshold >= gate.note_threshold
            && gate.note_threshold >= gate.whisper_threshold
            && gate.whisper_threshold >= 0.0)
        {
            return Err(Error::Config(format!(
                "gate thresholds must satisfy warning >= note >= whisper >= 0 (got {} / {} / {})",
                gate.warning_threshold, gate.note_threshold, gate.whisper_threshold
            )));
        }

        let r = &self.ranker;
        for (name, w) in [
            ("confidence_weight", r.confidence_weight),
            ("context_weight", r.context_weight),
            ("reliability_weight", r.reliability_weight),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(Error::Config(format!("ranker.{name} must be >= 0")));
            }
        }
        if r.boost_min > r.boost_max || r.boost_min <= 0.0 {
            return Err(Error::Config(
                "ranker boost bounds must satisfy 0 < boost_min <= boost_max".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&r.recency_floor) {
            return Err(Error::Config("ranker.recency_floor must be in [0, 1]".to_string()));
        }

        if self.engine.budget_ms == 0 {
            return Err(Error::Config("engine.budget_ms must be > 0".to_string()));
        }
        if self.engine.safety_margin_ms >= self.engine.budget_ms {
            return Err(Error::Config(
                "engine.safety_margin_ms must be smaller than engine.budget_ms".to_string(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(Error::Config("cache.capacity must be > 0".to_string()));
        }
        if self.prefetch.enabled && (self.prefetch.workers == 0 || self.prefetch.queue_capacity == 0)
        {
            return Err(Error::Config(
                "prefetch.workers and prefetch.queue_capacity must be > 0".to_string(),
            ));
        }
        if self.delivery.history_capacity == 0 || self.outcome.history_capacity == 0 {
            return Err(Error::Config("history capacities must be > 0".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Snapshot handle and hot reload
// =============================================================================

/// Holder of the current configuration snapshot.
///
/// Readers get an `Arc` to an immutable snapshot; `replace` swaps the whole
/// snapshot atomically so a cycle never observes a half-applied change.
pub struct ConfigHandle {
    current: RwLock<Arc<AdvisoryConfig>>,
}

impl ConfigHandle {
    /// Create a handle holding `config`.
    pub fn new(config: AdvisoryConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Current immutable snapshot.
    pub fn snapshot(&self) -> Arc<AdvisoryConfig> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Validate and swap in a new snapshot.
    pub fn replace(&self, config: AdvisoryConfig) -> Result<()> {
        config.validate()?;
        let next = Arc::new(config);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        Ok(())
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(AdvisoryConfig::default())
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Spawn a background task that reloads `path` whenever its mtime changes.
///
/// Invalid files are logged and ignored; the previous snapshot stays active.
pub fn spawn_config_reloader(
    path: PathBuf,
    handle: Arc<ConfigHandle>,
    interval_secs: u64,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_seen = modified_at(&path);
        let mut ticker =
            tokio::time::interval(tokio::time::Duration::from_secs(interval_secs.max(1)));
        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let current = modified_at(&path);
            if current.is_none() || current == last_seen {
                continue;
            }
            last_seen = current;

            match AdvisoryConfig::load(&path).and_then(|cfg| handle.replace(cfg)) {
                Ok(()) => tracing::info!(path = %path.display(), "Configuration reloaded"),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Ignoring invalid configuration update"
                ),
            }
        }
        tracing::debug!("Configuration reloader stopped");
    })
}
