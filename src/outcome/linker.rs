//! Outcome attribution
//!
//! An outcome is linked only when its trace identifies exactly one emitted
//! delivery for the same tool and it arrived within the attribution window.
//! Everything else is discarded with a reason code; nothing is guessed.

use crate::advisory::types::{DeliveryEvent, ErrorCode, OutcomeRecord, Polarity};
use crate::history::{BoundedLog, Traced};
use crate::outcome::replay::ReplayEngine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::{Mutex, RwLock};

/// Processed outcome, kept in the bounded outcome history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEntry {
    pub record: OutcomeRecord,
    pub linked: bool,
    pub discard_reason: Option<ErrorCode>,
    pub processed_at: DateTime<Utc>,
}

impl Traced for OutcomeEntry {
    fn trace_id(&self) -> &str {
        &self.record.trace_id
    }
}

/// Result of processing one outcome
#[derive(Debug, Clone, PartialEq)]
pub enum LinkResult {
    /// Strictly attributed to this delivery
    Linked(Box<DeliveryEvent>),
    Discarded(ErrorCode),
}

/// Trace coverage counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkStats {
    pub received: u64,
    pub linked: u64,
    pub discarded: BTreeMap<String, u64>,
    pub pending_deliveries: usize,
    pub unused_decayed: u64,
}

/// Strict attribution rule.
///
/// `deliveries` are all recorded events carrying the outcome's trace id.
pub fn attribute<'a>(
    record: &OutcomeRecord,
    deliveries: &'a [DeliveryEvent],
    already_linked: bool,
    window: Duration,
) -> std::result::Result<&'a DeliveryEvent, ErrorCode> {
    if !record.strict {
        return Err(ErrorCode::WeakLink);
    }
    let delivery = match deliveries {
        [] => return Err(ErrorCode::TraceUnmatched),
        [one] => one,
        _ => return Err(ErrorCode::TraceAmbiguous),
    };
    if already_linked {
        return Err(ErrorCode::TraceAmbiguous);
    }
    if !delivery.emitted {
        return Err(ErrorCode::NotEmitted);
    }
    if delivery.tool != record.tool {
        return Err(ErrorCode::TraceAmbiguous);
    }
    let elapsed = record.observed_at - delivery.created_at;
    if elapsed < Duration::zero() || elapsed > window {
        return Err(ErrorCode::TraceAmbiguous);
    }
    Ok(delivery)
}

#[derive(Debug, Clone)]
struct PendingDelivery {
    packet_id: String,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Counters {
    received: u64,
    linked: u64,
    discarded: BTreeMap<String, u64>,
    unused_decayed: u64,
}

/// Links outcomes to deliveries and feeds the replay aggregates
pub struct OutcomeLinker {
    history: RwLock<BoundedLog<OutcomeEntry>>,
    linked_traces: RwLock<HashSet<String>>,
    /// Emitted deliveries with a packet, awaiting an outcome
    pending: Mutex<HashMap<String, PendingDelivery>>,
    counters: RwLock<Counters>,
    replay: ReplayEngine,
}

impl OutcomeLinker {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            history: RwLock::new(BoundedLog::new(history_capacity)),
            linked_traces: RwLock::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            counters: RwLock::new(Counters::default()),
            replay: ReplayEngine::new(),
        }
    }

    pub fn replay(&self) -> &ReplayEngine {
        &self.replay
    }

    /// Remember an emitted delivery so the sweep can decay its packet if no
    /// outcome ever arrives.
    pub async fn track_delivery(&self, event: &DeliveryEvent) {
        if !event.emitted {
            return;
        }
        if let Some(packet_id) = &event.packet_id {
            self.pending.lock().await.insert(
                event.trace_id.clone(),
                PendingDelivery {
                    packet_id: packet_id.clone(),
                    created_at: event.created_at,
                },
            );
        }
    }

    /// Attribute one outcome and, when linked, update the replay bucket.
    ///
    /// Packet and source-boost feedback is left to the caller, which owns
    /// those structures.
    pub async fn process(
        &self,
        record: OutcomeRecord,
        deliveries: &[DeliveryEvent],
        window: Duration,
        now: DateTime<Utc>,
    ) -> LinkResult {
        let already_linked = self.linked_traces.read().await.contains(&record.trace_id);
        let result = match attribute(&record, deliveries, already_linked, window) {
            Ok(delivery) => LinkResult::Linked(Box::new(delivery.clone())),
            Err(code) => LinkResult::Discarded(code),
        };

        {
            let mut counters = self.counters.write().await;
            counters.received += 1;
            match &result {
                LinkResult::Linked(_) => counters.linked += 1,
                LinkResult::Discarded(code) => {
                    *counters.discarded.entry(code.as_str().to_string()).or_default() += 1
                }
            }
        }

        match &result {
            LinkResult::Linked(delivery) => {
                self.linked_traces
                    .write()
                    .await
                    .insert(record.trace_id.clone());
                self.pending.lock().await.remove(&record.trace_id);

                if let Some(pattern) = &delivery.pattern_key {
                    self.replay
                        .record(
                            &record.tool,
                            pattern,
                            record.polarity == Polarity::Good,
                            record.observed_at,
                        )
                        .await;
                }
                tracing::debug!(
                    trace_id = %record.trace_id,
                    tool = %record.tool,
                    polarity = ?record.polarity,
                    "Outcome linked"
                );
            }
            LinkResult::Discarded(code) => {
                tracing::debug!(
                    trace_id = %record.trace_id,
                    tool = %record.tool,
                    reason = %code,
                    "Outcome discarded"
                );
            }
        }

        let entry = OutcomeEntry {
            linked: matches!(result, LinkResult::Linked(_)),
            discard_reason: match &result {
                LinkResult::Discarded(code) => Some(*code),
                LinkResult::Linked(_) => None,
            },
            record,
            processed_at: now,
        };
        self.history.write().await.push(entry);
        result
    }

    /// Remove and return packet ids of deliveries whose window elapsed
    /// without any outcome.
    pub async fn sweep_unused(&self, window: Duration, now: DateTime<Utc>) -> Vec<String> {
        let mut pending = self.pending.lock().await;
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, p)| now - p.created_at > window)
            .map(|(trace, _)| trace.clone())
            .collect();

        let packets: Vec<String> = expired
            .iter()
            .filter_map(|trace| pending.remove(trace))
            .map(|p| p.packet_id)
            .collect();
        drop(pending);

        if !packets.is_empty() {
            self.counters.write().await.unused_decayed += packets.len() as u64;
        }
        packets
    }

    /// Forget linked traces whose delivery left the delivery log. An
    /// outcome for such a trace can no longer match and is discarded as
    /// unmatched, so the duplicate guard is not needed for it.
    pub async fn retain_linked(&self, retained: &HashSet<String>) -> usize {
        let mut linked = self.linked_traces.write().await;
        let before = linked.len();
        linked.retain(|trace| retained.contains(trace));
        before - linked.len()
    }

    pub async fn linked_count(&self) -> usize {
        self.linked_traces.read().await.len()
    }

    pub async fn stats(&self) -> LinkStats {
        let counters = self.counters.read().await;
        LinkStats {
            received: counters.received,
            linked: counters.linked,
            discarded: counters.discarded.clone(),
            pending_deliveries: self.pending.lock().await.len(),
            unused_decayed: counters.unused_decayed,
        }
    }

    pub async fn history_len(&self) -> usize {
        self.history.read().await.len()
    }

    /// Export processed outcomes for persistence
    pub async fn export(&self) -> Vec<OutcomeEntry> {
        self.history.read().await.export()
    }

    /// Reload processed outcomes; linked traces and counters are rebuilt
    pub async fn import(&self, entries: Vec<OutcomeEntry>) {
        let mut history = self.history.write().await;
        let mut linked = self.linked_traces.write().await;
        let mut counters = self.counters.write().await;
        for entry in entries {
            counters.received += 1;
            if entry.linked {
                counters.linked += 1;
                linked.insert(entry.record.trace_id.clone());
            } else if let Some(code) = entry.discard_reason {
                *counters.discarded.entry(code.as_str().to_string()).or_default() += 1;
            }
            history.push(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::types::{AuthorityTier, GateReason, Route, SynthMode};

    fn delivery(trace: &str, tool: &str, emitted: bool, at: DateTime<Utc>) -> DeliveryEvent {
        DeliveryEvent {
            trace_id: trace.to_string(),
            session_id: "s1".to_string(),
            tool: tool.to_string(),
            authority_tier: AuthorityTier::Warning,
            route: emitted.then_some(Route::Live),
            synth_mode: Some(SynthMode::Deterministic),
            elapsed_ms: 1,
            emitted,
            text: emitted.then(|| "Warning: x.".to_string()),
            error_code: None,
            reason: GateReason::Ok,
            packet_id: Some("pkt-1".to_string()),
            pattern_key: Some("pattern-a".to_string()),
            source_types: vec!["cognitive".to_string()],
            fingerprints: vec![],
            created_at: at,
        }
    }

    fn outcome(trace: &str, tool: &str, at: DateTime<Utc>) -> OutcomeRecord {
        OutcomeRecord {
            trace_id: trace.to_string(),
            tool: tool.to_string(),
            polarity: Polarity::Good,
            observed_at: at,
            strict: true,
        }
    }

    #[test]
    fn test_attribution_rules() {
        let now = Utc::now();
        let window = Duration::seconds(1800);
        let d = vec![delivery("t1", "Edit", true, now)];

        let ok = outcome("t1", "Edit", now + Duration::seconds(60));
        assert!(attribute(&ok, &d, false, window).is_ok());

        let mut weak = ok.clone();
        weak.strict = false;
        assert_eq!(attribute(&weak, &d, false, window), Err(ErrorCode::WeakLink));

        assert_eq!(attribute(&ok, &[], false, window), Err(ErrorCode::TraceUnmatched));

        let dup = vec![d[0].clone(), d[0].clone()];
        assert_eq!(attribute(&ok, &dup, false, window), Err(ErrorCode::TraceAmbiguous));

        assert_eq!(attribute(&ok, &d, true, window), Err(ErrorCode::TraceAmbiguous));

        let wrong_tool = outcome("t1", "Bash", now + Duration::seconds(60));
        assert_eq!(attribute(&wrong_tool, &d, false, window), Err(ErrorCode::TraceAmbiguous));

        let late = outcome("t1", "Edit", now + Duration::seconds(1801));
        assert_eq!(attribute(&late, &d, false, window), Err(ErrorCode::TraceAmbiguous));

        let early = outcome("t1", "Edit", now - Duration::seconds(1));
        assert_eq!(attribute(&early, &d, false, window), Err(ErrorCode::TraceAmbiguous));

        let silent = vec![delivery("t1", "Edit", false, now)];
        assert_eq!(attribute(&ok, &silent, false, window), Err(ErrorCode::NotEmitted));
    }

    #[tokio::test]
    async fn test_linked_outcome_updates_bucket_once() {
        let linker = OutcomeLinker::new(100);
        let now = Utc::now();
        let window = Duration::seconds(1800);
        let d = vec![delivery("t1", "Edit", true, now)];

        let first = linker
            .process(outcome("t1", "Edit", now + Duration::seconds(5)), &d, window, now)
            .await;
        assert!(matches!(first, LinkResult::Linked(_)));

        let second = linker
            .process(outcome("t1", "Edit", now + Duration::seconds(6)), &d, window, now)
            .await;
        assert_eq!(second, LinkResult::Discarded(ErrorCode::TraceAmbiguous));

        let bucket = linker.replay().bucket("Edit", "pattern-a").await.unwrap();
        assert_eq!(bucket.strict_total_count, 1);

        let stats = linker.stats().await;
        assert_eq!(stats.received, 2);
        assert_eq!(stats.linked, 1);
        assert_eq!(stats.discarded.get("TRACE_AMBIGUOUS"), Some(&1));
    }

    #[tokio::test]
    async fn test_out_of_window_does_not_touch_buckets() {
        let linker = OutcomeLinker::new(100);
        let now = Utc::now();
        let window = Duration::seconds(1800);
        let d = vec![delivery("t1", "Edit", true, now)];

        let result = linker
            .process(outcome("t1", "Edit", now + Duration::hours(2)), &d, window, now)
            .await;
        assert_eq!(result, LinkResult::Discarded(ErrorCode::TraceAmbiguous));
        assert!(linker.replay().bucket("Edit", "pattern-a").await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_unused() {
        let linker = OutcomeLinker::new(100);
        let now = Utc::now();
        let window = Duration::seconds(1800);

        linker
            .track_delivery(&delivery("old", "Edit", true, now - Duration::hours(1)))
            .await;
        linker.track_delivery(&delivery("new", "Edit", true, now)).await;
        linker
            .track_delivery(&delivery("silent", "Edit", false, now - Duration::hours(1)))
            .await;

        let swept = linker.sweep_unused(window, now).await;
        assert_eq!(swept, vec!["pkt-1".to_string()]);
        assert_eq!(linker.stats().await.pending_deliveries, 1);
        assert!(linker.sweep_unused(window, now).await.is_empty());
    }

    #[tokio::test]
    async fn test_linked_traces_follow_delivery_log() {
        let linker = OutcomeLinker::new(100);
        let now = Utc::now();
        let window = Duration::seconds(1800);
        for trace in ["t1", "t2", "t3"] {
            let d = vec![delivery(trace, "Edit", true, now)];
            linker
                .process(outcome(trace, "Edit", now), &d, window, now)
                .await;
        }
        assert_eq!(linker.linked_count().await, 3);

        let retained: HashSet<String> = ["t3".to_string()].into();
        assert_eq!(linker.retain_linked(&retained).await, 2);
        assert_eq!(linker.linked_count().await, 1);

        // Evicted delivery: the outcome has nothing to match
        let evicted = linker
            .process(outcome("t1", "Edit", now), &[], window, now)
            .await;
        assert_eq!(evicted, LinkResult::Discarded(ErrorCode::TraceUnmatched));

        // Retained delivery keeps its duplicate guard
        let d = vec![delivery("t3", "Edit", true, now)];
        let dup = linker
            .process(outcome("t3", "Edit", now), &d, window, now)
            .await;
        assert_eq!(dup, LinkResult::Discarded(ErrorCode::TraceAmbiguous));
    }

    #[tokio::test]
    async fn test_import_rebuilds_linked_traces() {
        let linker = OutcomeLinker::new(100);
        let now = Utc::now();
        let window = Duration::seconds(1800);
        let d = vec![delivery("t1", "Edit", true, now)];
        linker
            .process(outcome("t1", "Edit", now), &d, window, now)
            .await;

        let restored = OutcomeLinker::new(100);
        restored.import(linker.export().await).await;
        let again = restored
            .process(outcome("t1", "Edit", now), &d, window, now)
            .await;
        assert_eq!(again, LinkResult::Discarded(ErrorCode::TraceAmbiguous));
    }
}
