//! Advice synthesis
//!
//! Three modes:
//!
//! 1. **Deterministic**: template composition from the selected candidates.
//!    Constant time, always succeeds.
//! 2. **AI**: an LLM call bounded by the remaining budget. The call runs in a
//!    detached task; on timeout or error the deterministic text for the same
//!    candidates is substituted and the cycle is tagged `SYNTH_FALLBACK`.
//! 3. **Selective**: AI only when the tier is high enough. A low tier gets
//!    deterministic text on the live route; a high tier without enough
//!    budget falls back the same way AI mode does.
//!
//! Synthesized text is cached per candidate-set signature for a short TTL.

use crate::advisory::fingerprint::fingerprint;
use crate::advisory::gate::SelectedCandidate;
use crate::advisory::llm::LlmBackend;
use crate::advisory::types::{AuthorityTier, ErrorCode, Route, SynthMode};
use crate::config::SynthesisConfig;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Input for one synthesis
pub struct SynthesisRequest<'a> {
    pub mode: SynthMode,
    pub tier: AuthorityTier,
    pub selected: &'a [SelectedCandidate],
    pub tool: &'a str,
    pub intent_context: &'a str,
    /// Time left for the AI call
    pub remaining: Duration,
}

/// Synthesized advice and how it was produced
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOutput {
    pub text: String,
    /// Mode that actually produced the text
    pub mode: SynthMode,
    pub route: Route,
    pub error_code: Option<ErrorCode>,
    /// Served from the synthesis cache
    pub cached: bool,
}

/// Synthesis counters exposed in the status snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SynthesisStats {
    pub deterministic: u64,
    pub ai_calls: u64,
    pub ai_success: u64,
    pub ai_timeouts: u64,
    pub ai_errors: u64,
    pub fallbacks: u64,
    pub cache_hits: u64,
    pub late_results: u64,
}

#[derive(Default)]
struct Counters {
    deterministic: AtomicU64,
    ai_calls: AtomicU64,
    ai_success: AtomicU64,
    ai_timeouts: AtomicU64,
    ai_errors: AtomicU64,
    fallbacks: AtomicU64,
    cache_hits: AtomicU64,
    warm_inserts: Arc<AtomicU64>,
}

/// How a request reaches the LLM, if at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiPlan {
    /// Deterministic by choice: mode or tier does not call for AI
    Skip,
    /// AI was called for but the budget cannot cover it
    Starved,
    Call,
}

/// Plan the AI path for a request.
pub fn plan_ai(
    mode: SynthMode,
    tier: AuthorityTier,
    remaining: Duration,
    config: &SynthesisConfig,
) -> AiPlan {
    match mode {
        SynthMode::Deterministic => AiPlan::Skip,
        SynthMode::Ai if remaining.is_zero() => AiPlan::Starved,
        SynthMode::Ai => AiPlan::Call,
        SynthMode::Selective if tier < config.min_authority => AiPlan::Skip,
        SynthMode::Selective
            if remaining < Duration::from_millis(config.min_remaining_ms)
                || remaining.is_zero() =>
        {
            AiPlan::Starved
        }
        SynthMode::Selective => AiPlan::Call,
    }
}

/// Whether a request should go to the LLM
pub fn wants_ai(
    mode: SynthMode,
    tier: AuthorityTier,
    remaining: Duration,
    config: &SynthesisConfig,
) -> bool {
    plan_ai(mode, tier, remaining, config) == AiPlan::Call
}

/// Cut `text` to at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    let max_chars = max_chars.max(4);
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars - 3).collect();
    out.truncate(out.trim_end().len());
    out.push_str("...");
    out
}

fn clean(text: &str) -> &str {
    text.trim().trim_end_matches(|c: char| c == '.' || c.is_whitespace())
}

/// Template composition: `"<Label>: <top>. Also: <a>; <b>."`
pub fn compose_deterministic(
    tier: AuthorityTier,
    selected: &[SelectedCandidate],
    config: &SynthesisConfig,
) -> String {
    let mut texts = selected
        .iter()
        .map(|s| clean(&s.ranked.candidate.text))
        .filter(|t| !t.is_empty());

    let Some(top) = texts.next() else {
        return String::new();
    };

    let label = match tier {
        AuthorityTier::Silent => AuthorityTier::Whisper.label(),
        other => other.label(),
    };
    let mut text = format!("{}: {}.", label, top);

    let extra: Vec<&str> = texts.take(config.max_items.saturating_sub(1)).collect();
    if !extra.is_empty() {
        text.push_str(" Also: ");
        text.push_str(&extra.join("; "));
        text.push('.');
    }

    truncate_chars(&text, config.max_chars)
}

/// Stable signature of a candidate set
pub fn signature(tool: &str, tier: AuthorityTier, selected: &[SelectedCandidate]) -> String {
    let joined = selected
        .iter()
        .map(|s| s.ranked.fingerprint.as_str())
        .collect::<Vec<_>>()
        .join(",");
    fingerprint(&format!("{}|{}|{}", tool, tier.as_str(), joined))
}

fn build_prompt(request: &SynthesisRequest<'_>, max_chars: usize) -> String {
    let mut prompt = format!(
        "Tool: {}\nIntent: {}\nSeverity: {}\nAdvice items:\n",
        request.tool,
        request.intent_context,
        request.tier.label()
    );
    for (i, s) in request.selected.iter().enumerate() {
        prompt.push_str(&format!(
            "{}. [{}] {}\n",
            i + 1,
            s.ranked.candidate.source_type,
            s.ranked.candidate.text.trim()
        ));
    }
    prompt.push_str(&format!(
        "Combine these into at most {} characters of direct advice.",
        max_chars
    ));
    prompt
}

/// Synthesizer with an optional LLM backend
pub struct Synthesizer {
    backend: Option<Arc<dyn LlmBackend>>,
    cache: Cache<String, String>,
    counters: Counters,
}

impl Synthesizer {
    pub fn new(config: &SynthesisConfig, backend: Option<Arc<dyn LlmBackend>>) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity.max(1))
            .time_to_live(Duration::from_secs(config.cache_ttl_secs.max(1)))
            .build();
        Self {
            backend,
            cache,
            counters: Counters::default(),
        }
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    fn deterministic(
        &self,
        request: &SynthesisRequest<'_>,
        config: &SynthesisConfig,
        route: Route,
        error_code: Option<ErrorCode>,
    ) -> SynthesisOutput {
        self.counters.deterministic.fetch_add(1, Ordering::Relaxed);
        if error_code.is_some() {
            self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
        }
        SynthesisOutput {
            text: compose_deterministic(request.tier, request.selected, config),
            mode: SynthMode::Deterministic,
            route,
            error_code,
            cached: false,
        }
    }

    /// Synthesize advice for the selected candidates.
    ///
    /// Returns within `request.remaining` (plus scheduling jitter) regardless
    /// of how the backend behaves.
    pub async fn synthesize(
        &self,
        request: &SynthesisRequest<'_>,
        config: &SynthesisConfig,
    ) -> SynthesisOutput {
        let fallback = Some(ErrorCode::SynthFallback);
        match plan_ai(request.mode, request.tier, request.remaining, config) {
            AiPlan::Skip => return self.deterministic(request, config, Route::Live, None),
            AiPlan::Starved => {
                tracing::debug!(
                    remaining_ms = request.remaining.as_millis() as u64,
                    "Not enough budget for AI synthesis"
                );
                return self.deterministic(request, config, Route::Fallback, fallback);
            }
            AiPlan::Call => {}
        }

        let Some(backend) = self.backend.clone() else {
            tracing::debug!("No LLM backend configured, using deterministic synthesis");
            return self.deterministic(request, config, Route::Fallback, fallback);
        };

        let sig = signature(request.tool, request.tier, request.selected);
        if let Some(text) = self.cache.get(&sig) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return SynthesisOutput {
                text,
                mode: SynthMode::Ai,
                route: Route::Live,
                error_code: None,
                cached: true,
            };
        }

        self.counters.ai_calls.fetch_add(1, Ordering::Relaxed);
        let prompt = build_prompt(request, config.max_chars);
        let max_chars = config.max_chars;
        let warm = config.warm_on_late_result;
        let cache = self.cache.clone();
        let warm_inserts = self.counters.warm_inserts.clone();
        let task_sig = sig.clone();

        // Detached: a timeout on the caller side does not cancel the call
        let mut handle = tokio::spawn(async move {
            let result = backend.complete(&prompt).await;
            if let Ok(text) = &result {
                if warm && !text.trim().is_empty() {
                    cache.insert(task_sig, truncate_chars(text.trim(), max_chars));
                    warm_inserts.fetch_add(1, Ordering::Relaxed);
                }
            }
            result
        });

        match tokio::time::timeout(request.remaining, &mut handle).await {
            Ok(Ok(Ok(text))) if !text.trim().is_empty() => {
                self.counters.ai_success.fetch_add(1, Ordering::Relaxed);
                let text = truncate_chars(text.trim(), max_chars);
                self.cache.insert(sig, text.clone());
                SynthesisOutput {
                    text,
                    mode: SynthMode::Ai,
                    route: Route::Live,
                    error_code: None,
                    cached: false,
                }
            }
            Ok(Ok(Ok(_))) => {
                self.counters.ai_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("LLM returned empty text, falling back");
                self.deterministic(request, config, Route::Fallback, fallback)
            }
            Ok(Ok(Err(e))) => {
                self.counters.ai_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "AI synthesis failed, falling back");
                self.deterministic(request, config, Route::Fallback, fallback)
            }
            Ok(Err(e)) => {
                self.counters.ai_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "AI synthesis task aborted, falling back");
                self.deterministic(request, config, Route::Fallback, fallback)
            }
            Err(_) => {
                self.counters.ai_timeouts.fetch_add(1, Ordering::Relaxed);
                if !warm {
                    handle.abort();
                }
                tracing::warn!(
                    timeout_ms = request.remaining.as_millis() as u64,
                    "AI synthesis timed out, falling back"
                );
                self.deterministic(request, config, Route::Fallback, fallback)
            }
        }
    }

    pub fn stats(&self) -> SynthesisStats {
        let c = &self.counters;
        let warm_inserts = c.warm_inserts.load(Ordering::Relaxed);
        let on_time = c.ai_success.load(Ordering::Relaxed);
        SynthesisStats {
            deterministic: c.deterministic.load(Ordering::Relaxed),
            ai_calls: c.ai_calls.load(Ordering::Relaxed),
            ai_success: on_time,
            ai_timeouts: c.ai_timeouts.load(Ordering::Relaxed),
            ai_errors: c.ai_errors.load(Ordering::Relaxed),
            fallbacks: c.fallbacks.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            late_results: warm_inserts.saturating_sub(on_time),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::ranker::RankedCandidate;
    use crate::advisory::types::AdviceCandidate;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn selected(texts: &[&str]) -> Vec<SelectedCandidate> {
        texts
            .iter()
            .map(|t| SelectedCandidate {
                ranked: RankedCandidate {
                    candidate: AdviceCandidate::new("cognitive", *t),
                    composite: 0.9,
                    fingerprint: fingerprint(t),
                },
                tier: AuthorityTier::Warning,
            })
            .collect()
    }

    fn request<'a>(
        mode: SynthMode,
        selected: &'a [SelectedCandidate],
        remaining_ms: u64,
    ) -> SynthesisRequest<'a> {
        SynthesisRequest {
            mode,
            tier: AuthorityTier::Warning,
            selected,
            tool: "Edit",
            intent_context: "auth",
            remaining: Duration::from_millis(remaining_ms),
        }
    }

    struct EchoBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmBackend for EchoBackend {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("Rotate the signing key before editing.".to_string())
        }
        fn name(&self) -> &str {
            "echo"
        }
    }

    struct HangingBackend;

    #[async_trait]
    impl LlmBackend for HangingBackend {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("never".to_string())
        }
        fn name(&self) -> &str {
            "hanging"
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl LlmBackend for SlowBackend {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok("Late but useful.".to_string())
        }
        fn name(&self) -> &str {
            "slow"
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl LlmBackend for FailingBackend {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            Err(Error::Synthesis("boom".to_string()))
        }
        fn name(&self) -> &str {
            "failing"
        }
    }

    #[test]
    fn test_compose_deterministic() {
        let config = SynthesisConfig::default();
        let items = selected(&["Validate the JWT audience.", "Run auth tests", "Ignored third"]);
        let text = compose_deterministic(AuthorityTier::Warning, &items, &config);
        assert_eq!(text, "Warning: Validate the JWT audience. Also: Run auth tests.");
    }

    #[test]
    fn test_compose_truncates() {
        let config = SynthesisConfig {
            max_chars: 20,
            ..Default::default()
        };
        let items = selected(&["A very long piece of advice that keeps going"]);
        let text = compose_deterministic(AuthorityTier::Note, &items, &config);
        assert!(text.chars().count() <= 20);
        assert!(text.ends_with("..."));
    }

    #[test]
    fn test_selective_plan() {
        let config = SynthesisConfig::default();
        let plenty = Duration::from_millis(config.min_remaining_ms);
        assert!(wants_ai(SynthMode::Selective, AuthorityTier::Warning, plenty, &config));
        assert!(!wants_ai(SynthMode::Selective, AuthorityTier::Whisper, plenty, &config));
        assert!(!wants_ai(
            SynthMode::Selective,
            AuthorityTier::Warning,
            Duration::from_millis(10),
            &config
        ));
        assert!(!wants_ai(SynthMode::Ai, AuthorityTier::Whisper, Duration::ZERO, &config));
        assert!(wants_ai(
            SynthMode::Ai,
            AuthorityTier::Whisper,
            Duration::from_millis(1),
            &config
        ));
        assert!(!wants_ai(SynthMode::Deterministic, AuthorityTier::Warning, plenty, &config));
    }

    #[tokio::test]
    async fn test_selective_starved_falls_back() {
        let config = SynthesisConfig {
            mode: SynthMode::Selective,
            ..Default::default()
        };
        let backend = Arc::new(EchoBackend {
            calls: AtomicUsize::new(0),
        });
        let synth = Synthesizer::new(&config, Some(backend.clone()));
        let items = selected(&["Check token expiry"]);

        let out = synth
            .synthesize(&request(SynthMode::Selective, &items, 500), &config)
            .await;
        assert_eq!(out.mode, SynthMode::Deterministic);
        assert_eq!(out.route, Route::Fallback);
        assert_eq!(out.error_code, Some(ErrorCode::SynthFallback));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

        // Low tier is deterministic by choice
        let mut low = request(SynthMode::Selective, &items, 5000);
        low.tier = AuthorityTier::Whisper;
        let out = synth.synthesize(&low, &config).await;
        assert_eq!(out.route, Route::Live);
        assert_eq!(out.error_code, None);
        assert_eq!(
            plan_ai(SynthMode::Selective, AuthorityTier::Warning, Duration::from_millis(500), &config),
            AiPlan::Starved
        );
    }

    #[tokio::test]
    async fn test_ai_success_and_cache() {
        let config = SynthesisConfig::default();
        let backend = Arc::new(EchoBackend {
            calls: AtomicUsize::new(0),
        });
        let synth = Synthesizer::new(&config, Some(backend.clone()));
        let items = selected(&["Check token expiry"]);

        let out = synth.synthesize(&request(SynthMode::Ai, &items, 1000), &config).await;
        assert_eq!(out.mode, SynthMode::Ai);
        assert_eq!(out.route, Route::Live);
        assert_eq!(out.text, "Rotate the signing key before editing.");
        assert!(!out.cached);

        let again = synth.synthesize(&request(SynthMode::Ai, &items, 1000), &config).await;
        assert!(again.cached);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_budget_falls_back() {
        let config = SynthesisConfig::default();
        let synth = Synthesizer::new(
            &config,
            Some(Arc::new(EchoBackend {
                calls: AtomicUsize::new(0),
            })),
        );
        let items = selected(&["Check token expiry"]);

        let out = synth.synthesize(&request(SynthMode::Ai, &items, 0), &config).await;
        assert_eq!(out.mode, SynthMode::Deterministic);
        assert_eq!(out.route, Route::Fallback);
        assert_eq!(out.error_code, Some(ErrorCode::SynthFallback));
        assert!(!out.text.is_empty());
    }

    #[tokio::test]
    async fn test_hanging_backend_bounded() {
        let config = SynthesisConfig::default();
        let synth = Synthesizer::new(&config, Some(Arc::new(HangingBackend)));
        let items = selected(&["Check token expiry"]);

        let started = std::time::Instant::now();
        let out = synth.synthesize(&request(SynthMode::Ai, &items, 50), &config).await;
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(out.route, Route::Fallback);
        assert_eq!(out.text, "Warning: Check token expiry.");
        assert_eq!(synth.stats().ai_timeouts, 1);
    }

    #[tokio::test]
    async fn test_failing_backend_falls_back() {
        let config = SynthesisConfig::default();
        let synth = Synthesizer::new(&config, Some(Arc::new(FailingBackend)));
        let items = selected(&["Check token expiry"]);

        let out = synth.synthesize(&request(SynthMode::Ai, &items, 500), &config).await;
        assert_eq!(out.route, Route::Fallback);
        assert_eq!(out.error_code, Some(ErrorCode::SynthFallback));
        assert_eq!(synth.stats().ai_errors, 1);
    }

    #[tokio::test]
    async fn test_no_backend_falls_back() {
        let config = SynthesisConfig::default();
        let synth = Synthesizer::new(&config, None);
        let items = selected(&["Check token expiry"]);

        let out = synth.synthesize(&request(SynthMode::Ai, &items, 500), &config).await;
        assert_eq!(out.route, Route::Fallback);

        // Deterministic mode is a planned route, not a fallback
        let out = synth
            .synthesize(&request(SynthMode::Deterministic, &items, 500), &config)
            .await;
        assert_eq!(out.route, Route::Live);
        assert_eq!(out.error_code, None);
    }

    #[tokio::test]
    async fn test_late_result_warms_cache() {
        let config = SynthesisConfig::default();
        let synth = Synthesizer::new(&config, Some(Arc::new(SlowBackend)));
        let items = selected(&["Check token expiry"]);

        let first = synth.synthesize(&request(SynthMode::Ai, &items, 10), &config).await;
        assert_eq!(first.route, Route::Fallback);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let second = synth.synthesize(&request(SynthMode::Ai, &items, 10), &config).await;
        assert!(second.cached);
        assert_eq!(second.text, "Late but useful.");
    }
}
