//! Bounded append-only log indexed by trace and session
//!
//! Oldest records are dropped once the log reaches capacity. Records are
//! never mutated after they are appended.

use std::collections::{HashMap, VecDeque};

/// Default capacity for history logs.
pub const DEFAULT_CAPACITY: usize = 5_000;

/// Records that can be looked up by trace and session
pub trait Traced {
    fn trace_id(&self) -> &str;
    fn session_id(&self) -> Option<&str> {
        None
    }
}

/// Capacity-limited log with secondary indexes.
///
/// Each record gets a monotonically increasing sequence number; indexes map
/// to sequence numbers so eviction never shifts them.
pub struct BoundedLog<T: Traced> {
    records: VecDeque<(u64, T)>,
    by_trace: HashMap<String, Vec<u64>>,
    by_session: HashMap<String, Vec<u64>>,
    next_seq: u64,
    capacity: usize,
    evicted: u64,
}

impl<T: Traced + Clone> BoundedLog<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            by_trace: HashMap::new(),
            by_session: HashMap::new(),
            next_seq: 0,
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Append a record, evicting the oldest when full.
    pub fn push(&mut self, record: T) {
        if self.records.len() >= self.capacity {
            self.evict_oldest();
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        self.by_trace
            .entry(record.trace_id().to_string())
            .or_default()
            .push(seq);
        if let Some(session) = record.session_id() {
            self.by_session
                .entry(session.to_string())
                .or_default()
                .push(seq);
        }
        self.records.push_back((seq, record));
    }

    fn evict_oldest(&mut self) {
        let Some((seq, record)) = self.records.pop_front() else {
            return;
        };
        Self::unindex(&mut self.by_trace, record.trace_id(), seq);
        if let Some(session) = record.session_id() {
            Self::unindex(&mut self.by_session, session, seq);
        }
        self.evicted += 1;
    }

    fn unindex(index: &mut HashMap<String, Vec<u64>>, key: &str, seq: u64) {
        if let Some(seqs) = index.get_mut(key) {
            seqs.retain(|s| *s != seq);
            if seqs.is_empty() {
                index.remove(key);
            }
        }
    }

    fn get_seq(&self, seq: u64) -> Option<&T> {
        let first = self.records.front()?.0;
        let idx = seq.checked_sub(first)? as usize;
        self.records.get(idx).map(|(_, r)| r)
    }

    /// All records sharing a trace id, oldest first
    pub fn by_trace(&self, trace_id: &str) -> Vec<&T> {
        self.by_trace
            .get(trace_id)
            .map(|seqs| seqs.iter().filter_map(|s| self.get_seq(*s)).collect())
            .unwrap_or_default()
    }

    /// Number of records sharing a trace id
    pub fn trace_count(&self, trace_id: &str) -> usize {
        self.by_trace.get(trace_id).map(Vec::len).unwrap_or(0)
    }

    /// Distinct trace ids currently retained
    pub fn trace_ids(&self) -> impl Iterator<Item = &str> {
        self.by_trace.keys().map(String::as_str)
    }

    /// All records of a session, oldest first
    pub fn by_session(&self, session_id: &str) -> Vec<&T> {
        self.by_session
            .get(session_id)
            .map(|seqs| seqs.iter().filter_map(|s| self.get_seq(*s)).collect())
            .unwrap_or_default()
    }

    /// The newest `n` records, newest first
    pub fn recent(&self, n: usize) -> Vec<&T> {
        self.records.iter().rev().take(n).map(|(_, r)| r).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.records.iter().map(|(_, r)| r)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records dropped by eviction
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Records oldest first, for persistence
    pub fn export(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}
