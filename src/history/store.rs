//! JSON state snapshots
//!
//! Directory layout:
//! ```text
//! ~/.advisory/state/
//! ├── packets.json
//! ├── sessions.json
//! ├── deliveries.json
//! ├── outcomes.json
//! ├── replay.json
//! ├── dedupe.json
//! └── boosts.json
//! ```
//!
//! Each file is written to a temporary sibling and renamed into place, so a
//! crash mid-write leaves the previous snapshot intact. Unreadable files are
//! skipped with a warning.

use crate::advisory::types::DeliveryEvent;
use crate::cache::AdvisoryPacket;
use crate::error::{Error, Result};
use crate::outcome::{OutcomeEntry, ReplaySnapshot};
use crate::session::{DedupeEntry, SessionState};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const PACKETS_FILE: &str = "packets.json";
const SESSIONS_FILE: &str = "sessions.json";
const DELIVERIES_FILE: &str = "deliveries.json";
const OUTCOMES_FILE: &str = "outcomes.json";
const REPLAY_FILE: &str = "replay.json";
const DEDUPE_FILE: &str = "dedupe.json";
const BOOSTS_FILE: &str = "boosts.json";

/// Everything the engine persists
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub packets: Vec<AdvisoryPacket>,
    pub sessions: Vec<SessionState>,
    pub deliveries: Vec<DeliveryEvent>,
    pub outcomes: Vec<OutcomeEntry>,
    pub replay: ReplaySnapshot,
    pub dedupe: Vec<DedupeEntry>,
    pub boosts: HashMap<String, f64>,
}

/// File-backed snapshot store
pub struct StateStore {
    base_dir: PathBuf,
}

impl StateStore {
    /// Open (and create) the state directory
    pub async fn open(base_dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&base_dir).await.map_err(|e| {
            Error::Storage(format!(
                "Failed to create state directory {}: {}",
                base_dir.display(),
                e
            ))
        })?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Write all snapshot files
    pub async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        self.write_json(PACKETS_FILE, &snapshot.packets).await?;
        self.write_json(SESSIONS_FILE, &snapshot.sessions).await?;
        self.write_json(DELIVERIES_FILE, &snapshot.deliveries).await?;
        self.write_json(OUTCOMES_FILE, &snapshot.outcomes).await?;
        self.write_json(REPLAY_FILE, &snapshot.replay).await?;
        self.write_json(DEDUPE_FILE, &snapshot.dedupe).await?;
        self.write_json(BOOSTS_FILE, &snapshot.boosts).await?;

        tracing::debug!(
            dir = %self.base_dir.display(),
            packets = snapshot.packets.len(),
            sessions = snapshot.sessions.len(),
            deliveries = snapshot.deliveries.len(),
            "Saved advisory state"
        );
        Ok(())
    }

    /// Read whatever snapshot files exist; missing or corrupt ones load empty.
    pub async fn load(&self) -> StateSnapshot {
        let snapshot = StateSnapshot {
            packets: self.read_json(PACKETS_FILE).await,
            sessions: self.read_json(SESSIONS_FILE).await,
            deliveries: self.read_json(DELIVERIES_FILE).await,
            outcomes: self.read_json(OUTCOMES_FILE).await,
            replay: self.read_json(REPLAY_FILE).await,
            dedupe: self.read_json(DEDUPE_FILE).await,
            boosts: self.read_json(BOOSTS_FILE).await,
        };
        tracing::info!(
            dir = %self.base_dir.display(),
            packets = snapshot.packets.len(),
            sessions = snapshot.sessions.len(),
            deliveries = snapshot.deliveries.len(),
            outcomes = snapshot.outcomes.len(),
            "Loaded advisory state"
        );
        snapshot
    }

    async fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.base_dir.join(name);
        let tmp = self.base_dir.join(format!(".{}.tmp", name));
        let json = serde_json::to_string_pretty(value)?;

        tokio::fs::write(&tmp, json).await.map_err(|e| {
            Error::Storage(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            Error::Storage(format!("Failed to replace {}: {}", path.display(), e))
        })?;
        Ok(())
    }

    async fn read_json<T: DeserializeOwned + Default>(&self, name: &str) -> T {
        let path = self.base_dir.join(name);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", path.display(), e);
                return T::default();
            }
        };
        match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Skipping corrupt state file {}: {}", path.display(), e);
                T::default()
            }
        }
    }
}
