//! Advisory engine
//!
//! Owns every advisory component and drives one decision cycle per tool
//! event:
//!
//! ```text
//! Start → EvidenceGathered → Ranked → GateDecided ─┬→ Suppressed → Terminal
//!                                                  └→ RouteSelected → Synthesized
//!                                                       → Delivered → Terminal
//! ```
//!
//! Evidence and synthesis are both bounded by the remaining budget, so every
//! cycle terminates within the configured wall-clock limit. Failures degrade
//! to "no emit" and are recorded in the delivery event; `decide` never
//! returns an error.

use crate::advisory::delivery::{should_emit, DeliveryBadge, DeliveryStats, DeliveryTracker};
use crate::advisory::evidence::{EvidenceProvider, HttpEvidenceProvider, StaticEvidenceProvider};
use crate::advisory::fingerprint::fingerprint;
use crate::advisory::gate::{tier_for, AuthorityClassifier, GateDecision, SelectedCandidate};
use crate::advisory::intent::{resolve_domain, IntentTaxonomy};
use crate::advisory::llm::{HttpLlmBackend, LlmBackend};
use crate::advisory::ranker::{Ranker, Ranking, SourceBoosts};
use crate::advisory::synthesizer::{SynthesisRequest, SynthesisStats, Synthesizer};
use crate::advisory::types::{
    new_trace_id, AdviceCandidate, AuthorityTier, Decision, DecisionContext, DeliveryEvent,
    ErrorCode, EvidenceBundle, GateReason, OutcomeRecord, Polarity, Route, SynthMode,
};
use crate::cache::{
    spawn_workers, AdvisoryPacket, CacheMatch, CacheStats, EnqueueOutcome, LoadSignal,
    PacketCache, PacketFeedback, PacketKey, PacketSource, PrefetchQueue, PrefetchRequest,
    PrefetchRunner, PrefetchStats, PrefetchStatus,
};
use crate::config::{AdvisoryConfig, ConfigHandle};
use crate::error::{Error, Result};
use crate::history::{StateSnapshot, StateStore};
use crate::outcome::{LinkResult, LinkStats, OutcomeLinker};
use crate::session::{DedupeRegistry, SessionManager, SessionState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Sessions idle this long are dropped by the maintenance sweep
const SESSION_IDLE_HOURS: i64 = 24;

/// Observability snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub uptime_secs: u64,
    pub badge: DeliveryBadge,
    pub sessions: usize,
    pub synth_mode: SynthMode,
    pub budget_ms: u64,
    pub contended: bool,
    pub delivery: DeliveryStats,
    pub outcomes: LinkStats,
    pub cache: CacheStats,
    pub prefetch: PrefetchStats,
    pub synthesis: SynthesisStats,
    pub replay_buckets: usize,
    pub replay_emitted: usize,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`AdvisoryEngine`]
pub struct AdvisoryEngineBuilder {
    config: Arc<ConfigHandle>,
    evidence: Option<Arc<dyn EvidenceProvider>>,
    llm: Option<Arc<dyn LlmBackend>>,
    store: Option<StateStore>,
}

impl AdvisoryEngineBuilder {
    pub fn new(config: AdvisoryConfig) -> Self {
        Self::with_handle(Arc::new(ConfigHandle::new(config)))
    }

    /// Share an existing config handle (e.g. one watched by a reloader)
    pub fn with_handle(config: Arc<ConfigHandle>) -> Self {
        Self {
            config,
            evidence: None,
            llm: None,
            store: None,
        }
    }

    pub fn evidence(mut self, provider: Arc<dyn EvidenceProvider>) -> Self {
        self.evidence = Some(provider);
        self
    }

    pub fn llm(mut self, backend: Arc<dyn LlmBackend>) -> Self {
        self.llm = Some(backend);
        self
    }

    pub fn state_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the engine. Providers not set explicitly come from the config.
    pub fn build(self) -> Result<AdvisoryEngine> {
        let config = self.config.snapshot();
        config.validate()?;

        let evidence: Arc<dyn EvidenceProvider> = match self.evidence {
            Some(p) => p,
            None => match (&config.evidence.endpoint, &config.evidence.file) {
                (Some(endpoint), _) => Arc::new(HttpEvidenceProvider::new(endpoint.clone())),
                (None, Some(file)) => Arc::new(StaticEvidenceProvider::from_file(file)?),
                (None, None) => Arc::new(StaticEvidenceProvider::new()),
            },
        };

        let llm: Option<Arc<dyn LlmBackend>> = match self.llm {
            Some(b) => Some(b),
            None => config
                .synthesis
                .llm
                .clone()
                .map(|c| Arc::new(HttpLlmBackend::new(c)) as Arc<dyn LlmBackend>),
        };

        let (outcome_tx, outcome_rx) = mpsc::channel(config.outcome.channel_capacity.max(1));

        let inner = Arc::new(EngineInner {
            synthesizer: Synthesizer::new(&config.synthesis, llm),
            taxonomy: IntentTaxonomy::new()?,
            sessions: SessionManager::new(),
            dedupe: DedupeRegistry::new(),
            boosts: SourceBoosts::from_config(&config.ranker),
            cache: PacketCache::new(config.cache.capacity),
            prefetch: Arc::new(PrefetchQueue::new(config.prefetch.queue_capacity)),
            load: LoadSignal::new(),
            delivery: DeliveryTracker::new(config.delivery.history_capacity),
            linker: OutcomeLinker::new(config.outcome.history_capacity),
            store: self.store,
            evidence,
            config: self.config,
            started_at: Instant::now(),
        });

        tracing::info!(
            evidence = inner.evidence.name(),
            llm = inner.synthesizer.has_backend(),
            synth_mode = config.synthesis.mode.as_str(),
            budget_ms = config.engine.budget_ms,
            "Advisory engine built"
        );

        Ok(AdvisoryEngine {
            inner,
            outcome_tx,
            outcome_rx: Mutex::new(Some(outcome_rx)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Shared engine state; background tasks hold an `Arc` to it
struct EngineInner {
    config: Arc<ConfigHandle>,
    evidence: Arc<dyn EvidenceProvider>,
    synthesizer: Synthesizer,
    taxonomy: IntentTaxonomy,
    sessions: SessionManager,
    dedupe: DedupeRegistry,
    boosts: SourceBoosts,
    cache: PacketCache,
    prefetch: Arc<PrefetchQueue>,
    load: LoadSignal,
    delivery: DeliveryTracker,
    linker: OutcomeLinker,
    store: Option<StateStore>,
    started_at: Instant,
}

/// Hook-time advisory engine
pub struct AdvisoryEngine {
    inner: Arc<EngineInner>,
    outcome_tx: mpsc::Sender<OutcomeRecord>,
    outcome_rx: Mutex<Option<mpsc::Receiver<OutcomeRecord>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Where the delivered text came from
struct Routed {
    text: String,
    route: Route,
    synth_mode: Option<SynthMode>,
    error_code: Option<ErrorCode>,
    packet_id: Option<String>,
    /// Attribution of the text actually delivered
    pattern_key: Option<String>,
    source_types: Vec<String>,
    fingerprints: Vec<String>,
}

impl AdvisoryEngine {
    pub fn builder(config: AdvisoryConfig) -> AdvisoryEngineBuilder {
        AdvisoryEngineBuilder::new(config)
    }

    /// Current configuration handle
    pub fn config_handle(&self) -> Arc<ConfigHandle> {
        self.inner.config.clone()
    }

    /// Run one decision cycle for a tool event.
    pub async fn decide(&self, session_id: &str, tool: &str, context: &DecisionContext) -> Decision {
        self.inner.decide(session_id, tool, context).await
    }

    /// Submit an outcome without waiting. Fails with `Error::Outcome` if
    /// the intake channel is full or closed.
    pub fn record_outcome(&self, record: OutcomeRecord) -> Result<()> {
        match self.outcome_tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(record)) => {
                tracing::warn!(trace_id = %record.trace_id, "Outcome intake full, dropping record");
                Err(Error::Outcome("outcome intake is full".to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                tracing::warn!(trace_id = %record.trace_id, "Outcome intake closed, dropping record");
                Err(Error::Outcome("outcome intake is closed".to_string()))
            }
        }
    }

    /// Process an outcome inline (used by one-shot commands and tests)
    pub async fn process_outcome(&self, record: OutcomeRecord) -> LinkResult {
        self.inner.process_outcome(record).await
    }

    /// Queue a prefetch request without waiting
    pub async fn enqueue_prefetch(&self, request: PrefetchRequest) -> EnqueueOutcome {
        if !self.inner.config.snapshot().prefetch.enabled {
            tracing::debug!(tool = %request.predicted_tool, "Prefetch disabled, ignoring request");
            return EnqueueOutcome::Dropped(request);
        }
        self.inner.prefetch.push(request).await
    }

    /// Run one prefetch request inline
    pub async fn run_prefetch(&self, request: PrefetchRequest) -> Result<PrefetchStatus> {
        self.inner.run(request).await
    }

    /// Purge packets intersecting `scope`
    pub async fn invalidate_packets(&self, scope: &str) -> usize {
        self.inner.cache.invalidate(scope).await
    }

    /// External load signal; prefetch workers pause while contended
    pub fn set_contended(&self, contended: bool) {
        if self.inner.load.is_contended() != contended {
            tracing::info!(contended, "Load signal changed");
        }
        self.inner.load.set_contended(contended);
    }

    pub async fn status(&self) -> StatusSnapshot {
        self.inner.status().await
    }

    /// Recent delivery events of a session
    pub async fn session_deliveries(&self, session_id: &str) -> Vec<DeliveryEvent> {
        self.inner.delivery.by_session(session_id).await
    }

    pub async fn session_snapshot(&self, session_id: &str) -> SessionState {
        self.inner.sessions.snapshot(session_id).await
    }

    /// Sweep unused deliveries and expired state once
    pub async fn run_maintenance(&self) {
        self.inner.maintenance(Utc::now()).await;
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Load persisted state, if a store is configured
    pub async fn load_state(&self) -> Result<()> {
        let Some(store) = &self.inner.store else {
            return Ok(());
        };
        let snapshot = store.load().await;
        let inner = &self.inner;
        let now = Utc::now();

        inner.cache.import(snapshot.packets, now).await;
        inner.sessions.import(snapshot.sessions).await;
        for event in &snapshot.deliveries {
            inner.linker.track_delivery(event).await;
        }
        inner.delivery.import(snapshot.deliveries).await;
        inner.linker.import(snapshot.outcomes).await;
        inner.linker.replay().import(snapshot.replay).await;
        inner.dedupe.import(snapshot.dedupe).await;
        inner.boosts.import(snapshot.boosts).await;
        Ok(())
    }

    /// Write all state, if a store is configured
    pub async fn save_state(&self) -> Result<()> {
        self.inner.save_state().await
    }

    // =========================================================================
    // Background tasks
    // =========================================================================

    /// Spawn the outcome consumer, maintenance sweep, prefetch workers and
    /// periodic persistence.
    pub async fn start(&self) -> Result<()> {
        let rx = self
            .outcome_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("Advisory engine already started".to_string()))?;

        let config = self.inner.config.snapshot();
        let mut tasks = self.tasks.lock().await;

        tasks.push(spawn_outcome_consumer(
            self.inner.clone(),
            rx,
            self.cancel.clone(),
        ));
        tasks.push(spawn_interval(
            "maintenance",
            config.outcome.sweep_interval_secs,
            self.cancel.clone(),
            {
                let inner = self.inner.clone();
                move || {
                    let inner = inner.clone();
                    async move { inner.maintenance(Utc::now()).await }
                }
            },
        ));

        if config.prefetch.enabled {
            tasks.extend(spawn_workers(
                self.inner.prefetch.clone(),
                self.inner.clone() as Arc<dyn PrefetchRunner>,
                config.prefetch.workers,
                self.inner.load.clone(),
                self.cancel.clone(),
            ));
        }

        if self.inner.store.is_some() {
            tasks.push(spawn_interval(
                "persist",
                config.storage.persist_interval_secs,
                self.cancel.clone(),
                {
                    let inner = self.inner.clone();
                    move || {
                        let inner = inner.clone();
                        async move {
                            if let Err(e) = inner.save_state().await {
                                tracing::warn!(error = %e, "Periodic state save failed");
                            }
                        }
                    }
                },
            ));
        }

        tracing::info!(tasks = tasks.len(), "Advisory engine started");
        Ok(())
    }

    /// Cancel background tasks, wait for them, and persist state.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.save_state().await?;
        tracing::info!("Advisory engine stopped");
        Ok(())
    }
}

fn spawn_outcome_consumer(
    inner: Arc<EngineInner>,
    mut rx: mpsc::Receiver<OutcomeRecord>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Outcome consumer started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                record = rx.recv() => match record {
                    Some(record) => {
                        inner.process_outcome(record).await;
                    }
                    None => break,
                },
            }
        }
        tracing::info!("Outcome consumer stopped");
    })
}

fn spawn_interval<F, Fut>(
    name: &'static str,
    interval_secs: u64,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(interval_secs.max(1)));
        // Skip the first immediate tick
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
        tracing::debug!(task = name, "Background task stopped");
    })
}

impl EngineInner {
    fn packet_key(
        &self,
        config: &AdvisoryConfig,
        session: &SessionState,
        tool: &str,
        context: &DecisionContext,
    ) -> PacketKey {
        let project = context
            .project_id
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| config.engine.default_project.clone());
        PacketKey::new(
            project,
            session.phase.as_str(),
            resolve_domain(context.domain_category.as_deref(), context.file_path.as_deref()),
            tool,
            self.taxonomy
                .resolve_cluster(context.intent_cluster.as_deref(), &context.intent_context),
        )
    }

    async fn gather_evidence(
        &self,
        session_id: &str,
        tool: &str,
        intent_context: &str,
        timeout: Duration,
    ) -> (Vec<AdviceCandidate>, Option<ErrorCode>) {
        let call = self.evidence.get_evidence(session_id, tool, intent_context);
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(candidates)) => (candidates, None),
            Ok(Err(e)) => {
                tracing::warn!(
                    session_id = %session_id,
                    tool = %tool,
                    error = %e,
                    "Evidence unavailable"
                );
                (Vec::new(), Some(ErrorCode::EvidenceUnavailable))
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %session_id,
                    tool = %tool,
                    timeout_ms = timeout.as_millis() as u64,
                    "Evidence timed out"
                );
                (Vec::new(), Some(ErrorCode::EvidenceUnavailable))
            }
        }
    }

    async fn decide(&self, session_id: &str, tool: &str, context: &DecisionContext) -> Decision {
        let started = Instant::now();
        let config = self.config.snapshot();
        let budget = Duration::from_millis(config.engine.budget_ms);
        let deadline = started + budget.saturating_sub(Duration::from_millis(config.engine.safety_margin_ms));
        let remaining = || deadline.saturating_duration_since(Instant::now());
        let now = Utc::now();
        let trace_id = new_trace_id();

        // Local view including this event; committed once at the end
        let mut session = self.sessions.snapshot(session_id).await;
        session.record_tool(tool, now, config.engine.tool_history_len);

        // Evidence
        let evidence_timeout =
            Duration::from_millis(config.engine.evidence_timeout_ms).min(remaining());
        let (mut candidates, evidence_error) = self
            .gather_evidence(session_id, tool, &context.intent_context, evidence_timeout)
            .await;
        candidates.extend(self.linker.replay().take_pending(tool).await);
        let bundle = EvidenceBundle::new(session_id, tool, context.intent_context.clone(), candidates);

        // Rank and gate
        let boosts = self.boosts.snapshot().await;
        let ranking = Ranker::rank(&bundle, &config.ranker, &boosts, &session, now);
        let gate = AuthorityClassifier::new(&config.gate, &self.dedupe)
            .evaluate(&ranking, &session, tool, now)
            .await;

        let mut event = DeliveryEvent {
            trace_id: trace_id.clone(),
            session_id: session_id.to_string(),
            tool: tool.to_string(),
            authority_tier: gate.tier,
            route: None,
            synth_mode: None,
            elapsed_ms: 0,
            emitted: false,
            text: None,
            error_code: evidence_error,
            reason: gate.reason,
            packet_id: None,
            pattern_key: None,
            source_types: Vec::new(),
            fingerprints: Vec::new(),
            created_at: now,
        };

        if !gate.should_emit() {
            self.commit_session(session_id, tool, now, &config, &[]).await;
            return self.finish(event, started).await;
        }

        // Route: packet cache, then synthesis
        let key = self.packet_key(&config, &session, tool, context);
        let session_window = chrono::Duration::seconds(config.gate.session_cooldown_secs as i64);
        let routed = match self.cache.lookup(&key, &config.cache, now).await {
            Some((packet, matched))
                if !std::iter::once(fingerprint(&packet.synthesized_text))
                    .chain(packet.fingerprints.iter().cloned())
                    .any(|fp| session.in_cooldown(tool, &fp, now, session_window)) =>
            {
                Routed {
                    text: packet.synthesized_text,
                    route: match matched {
                        CacheMatch::Exact => Route::CacheExact,
                        CacheMatch::Relaxed => Route::CacheRelaxed,
                    },
                    synth_mode: None,
                    error_code: None,
                    packet_id: Some(packet.packet_id),
                    pattern_key: packet.pattern_key,
                    source_types: packet.source_types,
                    fingerprints: packet.fingerprints,
                }
            }
            _ => {
                self.synthesize_live(&config, &gate, &key, tool, context, remaining(), now)
                    .await
            }
        };

        event.pattern_key = routed.pattern_key;
        event.source_types = routed.source_types;
        event.route = Some(routed.route);
        event.synth_mode = routed.synth_mode;
        event.packet_id = routed.packet_id;
        event.error_code = routed.error_code.or(event.error_code);

        if !should_emit(gate.tier, false, Some(&routed.text)) {
            self.commit_session(session_id, tool, now, &config, &[]).await;
            event.reason = GateReason::BelowThreshold;
            return self.finish(event, started).await;
        }

        // Deliver: re-verify cooldown under the session lock
        let mut fingerprints = routed.fingerprints;
        let text_fp = fingerprint(&routed.text);
        if !fingerprints.contains(&text_fp) {
            fingerprints.push(text_fp);
        }

        let committed = self
            .commit_session(session_id, tool, now, &config, &fingerprints)
            .await;
        event.fingerprints = fingerprints;
        if !committed {
            event.reason = GateReason::CooldownActive;
            return self.finish(event, started).await;
        }

        if gate.tier.is_low_authority() {
            for fp in &event.fingerprints {
                self.dedupe.record(session_id, tool, fp, now).await;
            }
        }

        event.emitted = true;
        event.text = Some(routed.text);
        self.finish(event, started).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn synthesize_live(
        &self,
        config: &AdvisoryConfig,
        gate: &GateDecision,
        key: &PacketKey,
        tool: &str,
        context: &DecisionContext,
        remaining: Duration,
        now: DateTime<Utc>,
    ) -> Routed {
        let output = self
            .synthesizer
            .synthesize(
                &SynthesisRequest {
                    mode: config.synthesis.mode,
                    tier: gate.tier,
                    selected: &gate.selected,
                    tool,
                    intent_context: &context.intent_context,
                    remaining,
                },
                &config.synthesis,
            )
            .await;

        // Fallback text is not cached so a later cycle can retry the AI path
        let packet_id = if output.route == Route::Live && !output.text.trim().is_empty() {
            let packet = build_packet(config, key, &output.text, gate.tier, &gate.selected, now)
                .with_file_scope(context.file_path.as_deref());
            let id = packet.packet_id.clone();
            self.cache.put(packet).await.then_some(id)
        } else {
            None
        };

        Routed {
            text: output.text,
            route: output.route,
            synth_mode: Some(output.mode),
            error_code: output.error_code,
            packet_id,
            pattern_key: gate
                .selected
                .first()
                .map(|s| s.ranked.candidate.provenance_key.clone()),
            source_types: gate
                .selected
                .iter()
                .map(|s| s.ranked.candidate.source_type.clone())
                .collect(),
            fingerprints: gate
                .selected
                .iter()
                .map(|s| s.ranked.fingerprint.clone())
                .collect(),
        }
    }

    /// The single session mutation of a cycle. Returns `false` when one of
    /// `fingerprints` went into cooldown since the snapshot.
    async fn commit_session(
        &self,
        session_id: &str,
        tool: &str,
        now: DateTime<Utc>,
        config: &AdvisoryConfig,
        fingerprints: &[String],
    ) -> bool {
        let window = chrono::Duration::seconds(config.gate.session_cooldown_secs as i64);
        let history_len = config.engine.tool_history_len;
        self.sessions
            .commit(session_id, |state| {
                state.record_tool(tool, now, history_len);
                if fingerprints
                    .iter()
                    .any(|fp| state.in_cooldown(tool, fp, now, window))
                {
                    return false;
                }
                for fp in fingerprints {
                    state.record_emit(tool, fp, now);
                }
                true
            })
            .await
    }

    async fn finish(&self, mut event: DeliveryEvent, started: Instant) -> Decision {
        event.elapsed_ms = started.elapsed().as_millis() as u64;
        let decision = Decision {
            emit: event.emitted,
            text: event.text.clone(),
            authority_tier: event.authority_tier,
            trace_id: event.trace_id.clone(),
            reason: event.reason,
            route: event.route,
        };
        self.linker.track_delivery(&event).await;
        self.delivery.record(event).await;
        decision
    }

    async fn process_outcome(&self, record: OutcomeRecord) -> LinkResult {
        let config = self.config.snapshot();
        let now = Utc::now();
        let window = chrono::Duration::seconds(config.outcome.window_secs as i64);
        let deliveries = self.delivery.by_trace(&record.trace_id).await;
        let tool = record.tool.clone();
        let polarity = record.polarity;

        let result = self.linker.process(record, &deliveries, window, now).await;
        if let LinkResult::Linked(delivery) = &result {
            let (feedback, step) = match polarity {
                Polarity::Good => (PacketFeedback::Positive, config.ranker.boost_step),
                Polarity::Bad => (PacketFeedback::Negative, -config.ranker.boost_step),
            };
            if let Some(packet_id) = &delivery.packet_id {
                self.cache
                    .apply_feedback(packet_id, feedback, &config.cache)
                    .await;
            }
            for source in &delivery.source_types {
                self.boosts
                    .adjust(source, step, config.ranker.boost_min, config.ranker.boost_max)
                    .await;
            }
            self.linker
                .replay()
                .evaluate(
                    &tool,
                    config.outcome.replay_min_samples,
                    config.outcome.replay_min_delta,
                    now,
                )
                .await;
        }
        result
    }

    async fn maintenance(&self, now: DateTime<Utc>) {
        let config = self.config.snapshot();
        let window = chrono::Duration::seconds(config.outcome.window_secs as i64);

        let unused = self.linker.sweep_unused(window, now).await;
        for packet_id in &unused {
            self.cache
                .apply_feedback(packet_id, PacketFeedback::Unused, &config.cache)
                .await;
        }
        let retained = self.delivery.trace_ids().await;
        self.linker.retain_linked(&retained).await;
        let expired = self.cache.purge_expired(now).await;
        let global = chrono::Duration::seconds(config.gate.global_cooldown_secs as i64);
        self.dedupe.prune(now - global).await;
        self.sessions
            .cleanup_idle(now - chrono::Duration::hours(SESSION_IDLE_HOURS))
            .await;

        if !unused.is_empty() || expired > 0 {
            tracing::debug!(unused = unused.len(), expired, "Maintenance sweep");
        }
    }

    async fn status(&self) -> StatusSnapshot {
        let config = self.config.snapshot();
        let now = Utc::now();
        let contended = self.load.is_contended();
        StatusSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            badge: self
                .delivery
                .badge(
                    config.delivery.badge_window,
                    chrono::Duration::seconds(config.delivery.stale_after_secs as i64),
                    now,
                )
                .await,
            sessions: self.sessions.session_count().await,
            synth_mode: config.synthesis.mode,
            budget_ms: config.engine.budget_ms,
            contended,
            delivery: self.delivery.stats().await,
            outcomes: self.linker.stats().await,
            cache: self.cache.stats().await,
            prefetch: self.prefetch.stats(contended).await,
            synthesis: self.synthesizer.stats(),
            replay_buckets: self.linker.replay().bucket_count().await,
            replay_emitted: self.linker.replay().emitted_count().await,
        }
    }

    async fn save_state(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = StateSnapshot {
            packets: self.cache.export().await,
            sessions: self.sessions.export().await,
            deliveries: self.delivery.export().await,
            outcomes: self.linker.export().await,
            replay: self.linker.replay().export().await,
            dedupe: self.dedupe.export().await,
            boosts: self.boosts.snapshot().await,
        };
        store.save(&snapshot).await
    }
}

fn build_packet(
    config: &AdvisoryConfig,
    key: &PacketKey,
    text: &str,
    tier: AuthorityTier,
    selected: &[SelectedCandidate],
    now: DateTime<Utc>,
) -> AdvisoryPacket {
    let confidence = selected.first().map(|s| s.ranked.composite).unwrap_or(0.0);
    AdvisoryPacket::new(
        key.clone(),
        text,
        tier,
        confidence,
        config.cache.packet_ttl_secs,
        config.cache.initial_effectiveness,
        now,
    )
    .with_candidates(
        selected.iter().map(|s| s.ranked.candidate.id.clone()).collect(),
        selected
            .iter()
            .map(|s| s.ranked.candidate.source_type.clone())
            .collect(),
        selected.iter().map(|s| s.ranked.fingerprint.clone()).collect(),
    )
    .with_pattern_key(selected.first().map(|s| s.ranked.candidate.provenance_key.clone()))
}

#[async_trait]
impl PrefetchRunner for EngineInner {
    async fn run(&self, request: PrefetchRequest) -> Result<PrefetchStatus> {
        let config = self.config.snapshot();
        let now = Utc::now();

        let mut session = self.sessions.snapshot(&request.session_id).await;
        session.record_tool(&request.predicted_tool, now, config.engine.tool_history_len);

        let context = DecisionContext {
            project_id: request.project_id.clone(),
            intent_context: request.intent_cluster.clone(),
            intent_cluster: Some(request.intent_cluster.clone()),
            domain_category: request.domain_category.clone(),
            file_path: None,
        };
        let key = self.packet_key(&config, &session, &request.predicted_tool, &context);
        if self.cache.has_fresh(&key, now).await {
            return Ok(PrefetchStatus::SkippedFresh);
        }

        let candidates = tokio::time::timeout(
            Duration::from_millis(config.engine.evidence_timeout_ms),
            self.evidence.get_evidence(
                &request.session_id,
                &request.predicted_tool,
                &request.intent_cluster,
            ),
        )
        .await
        .map_err(|_| Error::Prefetch("Evidence timed out".to_string()))??;

        let bundle = EvidenceBundle::new(
            request.session_id.clone(),
            request.predicted_tool.clone(),
            request.intent_cluster.clone(),
            candidates,
        );
        let boosts = self.boosts.snapshot().await;
        let ranking = Ranker::rank(&bundle, &config.ranker, &boosts, &session, now);

        // Cooldown is applied at delivery time, not here
        let limit = config.gate.max_emit_per_call.max(1);
        let selected: Vec<SelectedCandidate> = match &ranking {
            Ranking::NoEvidence => Vec::new(),
            Ranking::Ranked(list) => list
                .iter()
                .map(|r| SelectedCandidate {
                    ranked: r.clone(),
                    tier: tier_for(r.composite, &config.gate),
                })
                .filter(|s| s.tier > AuthorityTier::Silent)
                .take(limit)
                .collect(),
        };
        let Some(tier) = selected.first().map(|s| s.tier) else {
            return Ok(PrefetchStatus::Empty);
        };

        let output = self
            .synthesizer
            .synthesize(
                &SynthesisRequest {
                    mode: config.synthesis.mode,
                    tier,
                    selected: &selected,
                    tool: &request.predicted_tool,
                    intent_context: &request.intent_cluster,
                    remaining: Duration::from_millis(config.prefetch.ai_timeout_ms),
                },
                &config.synthesis,
            )
            .await;

        let packet = build_packet(&config, &key, &output.text, tier, &selected, now)
            .with_source(PacketSource::Prefetch);
        tracing::debug!(
            session_id = %request.session_id,
            tool = %request.predicted_tool,
            packet_id = %packet.packet_id,
            route = %output.route,
            "Prefetched packet"
        );
        self.cache.put(packet).await;
        Ok(PrefetchStatus::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn strong(text: &str) -> AdviceCandidate {
        AdviceCandidate::new("cognitive", text)
            .with_confidence(0.9)
            .with_context_match(0.8)
            .with_provenance(format!("pattern:{}", text))
    }

    fn scenario_config() -> AdvisoryConfig {
        let mut config = AdvisoryConfig::default();
        config.gate.warning_threshold = 0.7;
        config
    }

    async fn engine_with(config: AdvisoryConfig, by_tool: Vec<(&str, Vec<AdviceCandidate>)>) -> AdvisoryEngine {
        let map: HashMap<String, Vec<AdviceCandidate>> = by_tool
            .into_iter()
            .map(|(t, c)| (t.to_string(), c))
            .collect();
        AdvisoryEngine::builder(config)
            .evidence(Arc::new(StaticEvidenceProvider::from_map(map)))
            .build()
            .unwrap()
    }

    struct FailingEvidence;

    #[async_trait]
    impl EvidenceProvider for FailingEvidence {
        async fn get_evidence(&self, _: &str, _: &str, _: &str) -> Result<Vec<AdviceCandidate>> {
            Err(Error::Evidence("down".to_string()))
        }
        fn name(&self) -> &str {
            "failing"
        }
    }

    struct HangingEvidence;

    #[async_trait]
    impl EvidenceProvider for HangingEvidence {
        async fn get_evidence(&self, _: &str, _: &str, _: &str) -> Result<Vec<AdviceCandidate>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
        fn name(&self) -> &str {
            "hanging"
        }
    }

    struct HangingLlm;

    #[async_trait]
    impl LlmBackend for HangingLlm {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
        fn name(&self) -> &str {
            "hanging"
        }
    }

    struct CountingLlm {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmBackend for CountingLlm {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("Prefer the shared auth middleware.".to_string())
        }
        fn name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_strong_candidate_emits_warning() {
        let engine = engine_with(
            scenario_config(),
            vec![("Edit", vec![strong("Validate JWT audience claims")])],
        )
        .await;

        let decision = engine
            .decide("s1", "Edit", &DecisionContext::new("edit auth middleware"))
            .await;
        assert!(decision.emit);
        assert_eq!(decision.authority_tier, AuthorityTier::Warning);
        assert_eq!(decision.reason, GateReason::Ok);
        assert_eq!(decision.route, Some(Route::Live));
        assert_eq!(
            decision.text.as_deref(),
            Some("Warning: Validate JWT audience claims.")
        );
        assert!(decision.trace_id.starts_with("adv-"));
    }

    #[tokio::test]
    async fn test_repeat_inside_cooldown_suppressed() {
        let engine = engine_with(
            scenario_config(),
            vec![("Edit", vec![strong("Validate JWT audience claims")])],
        )
        .await;
        let ctx = DecisionContext::new("edit auth middleware");

        assert!(engine.decide("s1", "Edit", &ctx).await.emit);
        let second = engine.decide("s1", "Edit", &ctx).await;
        assert!(!second.emit);
        assert_eq!(second.reason, GateReason::CooldownActive);

        // Every cycle leaves an event with a trace id
        let events = engine.session_deliveries("s1").await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| !e.trace_id.is_empty()));
    }

    #[tokio::test]
    async fn test_no_two_emissions_share_fingerprint_within_window() {
        let engine = Arc::new(
            engine_with(
                scenario_config(),
                vec![("Edit", vec![strong("Run the migration dry-run first")])],
            )
            .await,
        );
        let ctx = DecisionContext::new("schema change");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move { engine.decide("s1", "Edit", &ctx).await }));
        }
        let mut emitted = 0;
        for handle in handles {
            if handle.await.unwrap().emit {
                emitted += 1;
            }
        }
        assert_eq!(emitted, 1);
    }

    #[tokio::test]
    async fn test_cache_serves_other_session() {
        let engine = engine_with(
            scenario_config(),
            vec![("Edit", vec![strong("Validate JWT audience claims")])],
        )
        .await;
        let ctx = DecisionContext::new("auth work").with_project("p1");

        let first = engine.decide("s1", "Edit", &ctx).await;
        assert_eq!(first.route, Some(Route::Live));

        let second = engine.decide("s2", "Edit", &ctx).await;
        assert!(second.emit);
        assert_eq!(second.route, Some(Route::CacheExact));
        assert_eq!(second.text, first.text);
    }

    #[tokio::test]
    async fn test_cache_hit_attributed_to_served_packet() {
        let current = strong("Validate JWT audience claims").with_provenance("current-pattern");
        let engine = engine_with(scenario_config(), vec![("Edit", vec![current])]).await;
        let ctx = DecisionContext::new("auth work").with_project("p1");

        // Seed the key the cycle will look up with older, differently sourced advice
        let config = engine.inner.config.snapshot();
        let now = Utc::now();
        let mut session = SessionState::new("s1");
        session.record_tool("Edit", now, config.engine.tool_history_len);
        let key = engine.inner.packet_key(&config, &session, "Edit", &ctx);
        let seeded = AdvisoryPacket::new(
            key,
            "Warning: Old prefetched advice.",
            AuthorityTier::Warning,
            0.9,
            config.cache.packet_ttl_secs,
            config.cache.initial_effectiveness,
            now,
        )
        .with_source(PacketSource::Prefetch)
        .with_candidates(
            vec!["cand-old".to_string()],
            vec!["bank".to_string()],
            vec![fingerprint("Old prefetched advice")],
        )
        .with_pattern_key(Some("old-pattern".to_string()));
        assert!(engine.inner.cache.put(seeded).await);

        let decision = engine.decide("s1", "Edit", &ctx).await;
        assert!(decision.emit);
        assert_eq!(decision.route, Some(Route::CacheExact));
        assert_eq!(decision.text.as_deref(), Some("Warning: Old prefetched advice."));

        let events = engine.session_deliveries("s1").await;
        assert_eq!(events[0].pattern_key.as_deref(), Some("old-pattern"));
        assert_eq!(events[0].source_types, vec!["bank".to_string()]);
        assert!(events[0]
            .fingerprints
            .contains(&fingerprint("Old prefetched advice")));

        let result = engine
            .process_outcome(OutcomeRecord::new(&decision.trace_id, "Edit", Polarity::Good))
            .await;
        assert!(matches!(result, LinkResult::Linked(_)));

        let replay = engine.inner.linker.replay();
        assert!(replay.bucket("Edit", "old-pattern").await.is_some());
        assert!(replay.bucket("Edit", "current-pattern").await.is_none());
        assert!((engine.inner.boosts.get("bank").await - 1.02).abs() < 1e-9);
        assert!((engine.inner.boosts.get("cognitive").await - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_selective_without_budget_is_fallback() {
        let mut config = scenario_config();
        config.engine.budget_ms = 500;
        config.synthesis.mode = SynthMode::Selective;
        config.synthesis.min_remaining_ms = 1200;
        let llm = Arc::new(CountingLlm {
            calls: AtomicUsize::new(0),
        });
        let map: HashMap<String, Vec<AdviceCandidate>> =
            [("Edit".to_string(), vec![strong("Validate JWT audience claims")])].into();
        let engine = AdvisoryEngine::builder(config)
            .evidence(Arc::new(StaticEvidenceProvider::from_map(map)))
            .llm(llm.clone())
            .build()
            .unwrap();

        let decision = engine.decide("s1", "Edit", &DecisionContext::new("auth")).await;
        assert!(decision.emit);
        assert_eq!(decision.authority_tier, AuthorityTier::Warning);
        assert_eq!(decision.route, Some(Route::Fallback));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);

        let events = engine.session_deliveries("s1").await;
        assert_eq!(events[0].synth_mode, Some(SynthMode::Deterministic));
        assert_eq!(events[0].error_code, Some(ErrorCode::SynthFallback));
        assert_eq!(engine.status().await.badge, DeliveryBadge::Fallback);
    }

    #[tokio::test]
    async fn test_selective_low_tier_stays_live() {
        let mut config = scenario_config();
        config.synthesis.mode = SynthMode::Selective;
        config.synthesis.min_authority = AuthorityTier::Warning;
        let llm = Arc::new(CountingLlm {
            calls: AtomicUsize::new(0),
        });
        let weak = AdviceCandidate::new("cognitive", "Consider a smaller diff")
            .with_confidence(0.6)
            .with_context_match(0.6);
        let map: HashMap<String, Vec<AdviceCandidate>> = [("Edit".to_string(), vec![weak])].into();
        let engine = AdvisoryEngine::builder(config)
            .evidence(Arc::new(StaticEvidenceProvider::from_map(map)))
            .llm(llm.clone())
            .build()
            .unwrap();

        let decision = engine.decide("s1", "Edit", &DecisionContext::new("refactor")).await;
        assert!(decision.emit);
        assert!(decision.authority_tier < AuthorityTier::Warning);
        assert_eq!(decision.route, Some(Route::Live));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);

        let events = engine.session_deliveries("s1").await;
        assert_eq!(events[0].error_code, None);
    }

    #[tokio::test]
    async fn test_maintenance_drops_links_of_evicted_deliveries() {
        let mut config = scenario_config();
        config.delivery.history_capacity = 2;
        let engine = engine_with(config, vec![("Edit", vec![strong("Validate JWT audience claims")])]).await;
        let ctx = DecisionContext::new("auth");

        for session in ["s1", "s2", "s3"] {
            let d = engine.decide(session, "Edit", &ctx).await;
            assert!(d.emit);
            let result = engine
                .process_outcome(OutcomeRecord::new(&d.trace_id, "Edit", Polarity::Good))
                .await;
            assert!(matches!(result, LinkResult::Linked(_)));
        }
        assert_eq!(engine.inner.linker.linked_count().await, 3);

        engine.run_maintenance().await;
        assert_eq!(engine.inner.linker.linked_count().await, 2);
    }

    #[tokio::test]
    async fn test_no_evidence() {
        let engine = engine_with(AdvisoryConfig::default(), vec![]).await;
        let decision = engine.decide("s1", "Edit", &DecisionContext::new("x")).await;
        assert!(!decision.emit);
        assert_eq!(decision.reason, GateReason::NoEvidence);
        assert_eq!(decision.route, None);
        assert_eq!(decision.authority_tier, AuthorityTier::Silent);
    }

    #[tokio::test]
    async fn test_below_threshold_recorded_not_emitted() {
        let weak = AdviceCandidate::new("bank", "Maybe look at logs")
            .with_confidence(0.1)
            .with_context_match(0.1)
            .with_reliability(0.1);
        let engine = engine_with(AdvisoryConfig::default(), vec![("Bash", vec![weak])]).await;

        let decision = engine.decide("s1", "Bash", &DecisionContext::new("x")).await;
        assert!(!decision.emit);
        assert_eq!(decision.reason, GateReason::BelowThreshold);
        assert_eq!(engine.status().await.delivery.total, 1);
    }

    #[tokio::test]
    async fn test_evidence_failure_tagged() {
        let engine = AdvisoryEngine::builder(AdvisoryConfig::default())
            .evidence(Arc::new(FailingEvidence))
            .build()
            .unwrap();
        let decision = engine.decide("s1", "Edit", &DecisionContext::new("x")).await;
        assert!(!decision.emit);

        let events = engine.session_deliveries("s1").await;
        assert_eq!(events[0].error_code, Some(ErrorCode::EvidenceUnavailable));
        assert_eq!(
            engine.status().await.delivery.by_error.get("EVIDENCE_UNAVAILABLE"),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_hanging_evidence_bounded_by_budget() {
        let mut config = AdvisoryConfig::default();
        config.engine.budget_ms = 200;
        config.engine.evidence_timeout_ms = 1500;
        let engine = AdvisoryEngine::builder(config)
            .evidence(Arc::new(HangingEvidence))
            .build()
            .unwrap();

        let started = Instant::now();
        let decision = engine.decide("s1", "Edit", &DecisionContext::new("x")).await;
        assert!(started.elapsed() < Duration::from_millis(200 + 150));
        assert!(!decision.emit);
    }

    #[tokio::test]
    async fn test_hanging_llm_falls_back_within_budget() {
        let mut config = scenario_config();
        config.engine.budget_ms = 300;
        config.synthesis.mode = SynthMode::Ai;
        let map: HashMap<String, Vec<AdviceCandidate>> =
            [("Edit".to_string(), vec![strong("Validate JWT audience claims")])].into();
        let engine = AdvisoryEngine::builder(config)
            .evidence(Arc::new(StaticEvidenceProvider::from_map(map)))
            .llm(Arc::new(HangingLlm))
            .build()
            .unwrap();

        let started = Instant::now();
        let decision = engine.decide("s1", "Edit", &DecisionContext::new("auth")).await;
        assert!(started.elapsed() < Duration::from_millis(300 + 150));
        assert!(decision.emit);
        assert_eq!(decision.route, Some(Route::Fallback));
        assert_eq!(
            decision.text.as_deref(),
            Some("Warning: Validate JWT audience claims.")
        );

        let events = engine.session_deliveries("s1").await;
        assert_eq!(events[0].synth_mode, Some(SynthMode::Deterministic));
        assert_eq!(events[0].error_code, Some(ErrorCode::SynthFallback));
    }

    #[tokio::test]
    async fn test_ai_path_caches_packet() {
        let mut config = scenario_config();
        config.synthesis.mode = SynthMode::Ai;
        let llm = Arc::new(CountingLlm {
            calls: AtomicUsize::new(0),
        });
        let map: HashMap<String, Vec<AdviceCandidate>> =
            [("Edit".to_string(), vec![strong("Validate JWT audience claims")])].into();
        let engine = AdvisoryEngine::builder(config)
            .evidence(Arc::new(StaticEvidenceProvider::from_map(map)))
            .llm(llm.clone())
            .build()
            .unwrap();
        let ctx = DecisionContext::new("auth");

        let first = engine.decide("s1", "Edit", &ctx).await;
        assert_eq!(first.route, Some(Route::Live));
        assert_eq!(first.text.as_deref(), Some("Prefer the shared auth middleware."));

        let second = engine.decide("s2", "Edit", &ctx).await;
        assert_eq!(second.route, Some(Route::CacheExact));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_outcome_feedback_updates_boost_and_packet() {
        let engine = engine_with(
            scenario_config(),
            vec![("Edit", vec![strong("Validate JWT audience claims")])],
        )
        .await;
        let decision = engine.decide("s1", "Edit", &DecisionContext::new("auth")).await;

        let result = engine
            .process_outcome(OutcomeRecord::new(&decision.trace_id, "Edit", Polarity::Good))
            .await;
        assert!(matches!(result, LinkResult::Linked(_)));

        let events = engine.session_deliveries("s1").await;
        let packet_id = events[0].packet_id.clone().unwrap();
        let packet = engine.inner.cache.peek(&packet_id).await.unwrap();
        assert!((packet.effectiveness_score - 0.6).abs() < 1e-9);
        assert_eq!(packet.usage_count, 1);
        assert!((engine.inner.boosts.get("cognitive").await - 1.02).abs() < 1e-9);

        let status = engine.status().await;
        assert_eq!(status.outcomes.linked, 1);
        assert_eq!(status.replay_buckets, 1);
    }

    #[tokio::test]
    async fn test_unknown_trace_discarded() {
        let engine = engine_with(AdvisoryConfig::default(), vec![]).await;
        let result = engine
            .process_outcome(OutcomeRecord::new("adv-missing", "Edit", Polarity::Bad))
            .await;
        assert_eq!(result, LinkResult::Discarded(ErrorCode::TraceUnmatched));
    }

    #[tokio::test]
    async fn test_replay_candidate_flows_into_next_cycle() {
        let mut config = scenario_config();
        config.gate.session_cooldown_secs = 0;
        config.gate.global_cooldown_secs = 0;
        config.outcome.replay_min_samples = 2;
        let dominant = strong("Use the legacy deploy script").with_provenance("legacy");
        let engine = engine_with(config, vec![("Bash", vec![dominant])]).await;

        // Dominant pattern: 3 strict outcomes, all bad
        for i in 0..3 {
            let d = engine
                .decide(&format!("s{}", i), "Bash", &DecisionContext::new("deploy"))
                .await;
            assert!(d.emit);
            engine
                .process_outcome(OutcomeRecord::new(&d.trace_id, "Bash", Polarity::Bad))
                .await;
        }
        // Alternative pattern recorded directly: 2 strict successes
        let now = Utc::now();
        engine.inner.linker.replay().record("Bash", "canary", true, now).await;
        engine.inner.linker.replay().record("Bash", "canary", true, now).await;
        let emitted = engine.inner.linker.replay().evaluate("Bash", 2, 0.2, now).await;
        assert_eq!(emitted.len(), 1);

        let next = engine
            .decide("s9", "Bash", &DecisionContext::new("deploy"))
            .await;
        assert!(next.emit);
        let events = engine.session_deliveries("s9").await;
        assert!(events[0].source_types.iter().any(|s| s == "replay"));
    }

    #[tokio::test]
    async fn test_invalidate_forces_live_synthesis() {
        let engine = engine_with(
            scenario_config(),
            vec![("Edit", vec![strong("Validate JWT audience claims")])],
        )
        .await;
        let ctx = DecisionContext::new("auth").with_file("src/auth/jwt.rs");
        engine.decide("s1", "Edit", &ctx).await;

        assert_eq!(engine.invalidate_packets("file:src/auth").await, 1);
        let next = engine.decide("s2", "Edit", &ctx).await;
        assert_eq!(next.route, Some(Route::Live));
    }

    #[tokio::test]
    async fn test_prefetch_warms_cache() {
        let engine = engine_with(
            scenario_config(),
            vec![("Edit", vec![strong("Validate JWT audience claims")])],
        )
        .await;
        let mut request = PrefetchRequest::new("s1", "Edit", "auth_security", 5);
        request.domain_category = Some("backend".to_string());

        assert_eq!(
            engine.run_prefetch(request.clone()).await.unwrap(),
            PrefetchStatus::Completed
        );
        assert_eq!(
            engine.run_prefetch(request).await.unwrap(),
            PrefetchStatus::SkippedFresh
        );

        let ctx = DecisionContext {
            intent_cluster: Some("auth_security".to_string()),
            file_path: Some("src/auth.rs".to_string()),
            ..DecisionContext::new("auth")
        };
        let decision = engine.decide("s1", "Edit", &ctx).await;
        assert_eq!(decision.route, Some(Route::CacheExact));
    }

    #[tokio::test]
    async fn test_full_intake_rejects_outcome() {
        let mut config = AdvisoryConfig::default();
        config.outcome.channel_capacity = 1;
        let engine = engine_with(config, vec![]).await;

        assert!(engine
            .record_outcome(OutcomeRecord::new("adv-1", "Edit", Polarity::Good))
            .is_ok());
        let second = engine.record_outcome(OutcomeRecord::new("adv-2", "Edit", Polarity::Good));
        assert!(matches!(second, Err(Error::Outcome(_))));
    }

    #[tokio::test]
    async fn test_background_intake_links_outcome() {
        let engine = engine_with(
            scenario_config(),
            vec![("Edit", vec![strong("Validate JWT audience claims")])],
        )
        .await;
        engine.start().await.unwrap();
        assert!(engine.start().await.is_err());

        let decision = engine.decide("s1", "Edit", &DecisionContext::new("auth")).await;
        assert!(engine
            .record_outcome(OutcomeRecord::new(&decision.trace_id, "Edit", Polarity::Good))
            .is_ok());

        let mut linked = 0;
        for _ in 0..100 {
            linked = engine.status().await.outcomes.linked;
            if linked == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(linked, 1);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_roundtrip_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let map = vec![("Edit", vec![strong("Validate JWT audience claims")])];

        let engine = AdvisoryEngine::builder(scenario_config())
            .evidence(Arc::new(StaticEvidenceProvider::from_map(
                map.iter().map(|(t, c)| (t.to_string(), c.clone())).collect(),
            )))
            .state_store(StateStore::open(dir.path().to_path_buf()).await.unwrap())
            .build()
            .unwrap();
        let first = engine.decide("s1", "Edit", &DecisionContext::new("auth")).await;
        assert!(first.emit);
        engine.save_state().await.unwrap();

        let restored = AdvisoryEngine::builder(scenario_config())
            .evidence(Arc::new(StaticEvidenceProvider::from_map(
                map.iter().map(|(t, c)| (t.to_string(), c.clone())).collect(),
            )))
            .state_store(StateStore::open(dir.path().to_path_buf()).await.unwrap())
            .build()
            .unwrap();
        restored.load_state().await.unwrap();

        // Cooldown survives the restart
        let again = restored.decide("s1", "Edit", &DecisionContext::new("auth")).await;
        assert_eq!(again.reason, GateReason::CooldownActive);
        assert_eq!(restored.status().await.cache.entries, 1);
    }

    #[tokio::test]
    async fn test_contention_flag_in_status() {
        let engine = engine_with(AdvisoryConfig::default(), vec![]).await;
        engine.set_contended(true);
        assert!(engine.status().await.contended);
        engine.set_contended(false);
        assert!(!engine.status().await.prefetch.paused);
    }
}
