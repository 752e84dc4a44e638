//! Cross-session dedupe registry for low-authority advice
//!
//! Whisper and Note advisories are suppressed when another session surfaced
//! the same fingerprint for the same tool recently. Warnings bypass it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Persisted registry entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupeEntry {
    pub tool: String,
    pub fingerprint: String,
    pub last_emit: DateTime<Utc>,
    pub session_id: String,
}

/// Registry of recently surfaced low-authority fingerprints
pub struct DedupeRegistry {
    entries: RwLock<HashMap<String, DedupeEntry>>,
}

fn key(tool: &str, fingerprint: &str) -> String {
    format!("{}:{}", tool, fingerprint)
}

impl DedupeRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Whether another session surfaced `fingerprint` for `tool` within `window`.
    ///
    /// Emissions by `session_id` itself are left to the session cooldown.
    pub async fn recently_shown_elsewhere(
        &self,
        session_id: &str,
        tool: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> bool {
        self.entries
            .read()
            .await
            .get(&key(tool, fingerprint))
            .map(|e| e.session_id != session_id && now - e.last_emit < window)
            .unwrap_or(false)
    }

    /// Record an emission
    pub async fn record(&self, session_id: &str, tool: &str, fingerprint: &str, now: DateTime<Utc>) {
        self.entries.write().await.insert(
            key(tool, fingerprint),
            DedupeEntry {
                tool: tool.to_string(),
                fingerprint: fingerprint.to_string(),
                last_emit: now,
                session_id: session_id.to_string(),
            },
        );
    }

    /// Drop entries older than `cutoff`
    pub async fn prune(&self, cutoff: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.last_emit >= cutoff);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Export entries for persistence
    pub async fn export(&self) -> Vec<DedupeEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Load persisted entries
    pub async fn import(&self, entries: Vec<DedupeEntry>) {
        let mut map = self.entries.write().await;
        for entry in entries {
            map.insert(key(&entry.tool, &entry.fingerprint), entry);
        }
    }
}

impl Default for DedupeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
