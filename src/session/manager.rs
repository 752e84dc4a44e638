//! Session management
//!
//! Each session's state has exactly one writer at a time: the manager hands
//! out a per-session async mutex, held only long enough to take a snapshot at
//! the start of a cycle and to commit the single mutation at its end.
//! Different sessions never contend with each other.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Number of recent tool events considered for phase inference
const PHASE_WINDOW: usize = 8;

/// Coarse working phase inferred from recent tool usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Reading and searching
    Exploration,
    /// Editing and writing files
    Implementation,
    /// Running commands and tests
    Testing,
    /// Shipping changes
    Deployment,
    /// Not enough history
    #[default]
    Unknown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Exploration => "exploration",
            Phase::Implementation => "implementation",
            Phase::Testing => "testing",
            Phase::Deployment => "deployment",
            Phase::Unknown => "unknown",
        }
    }

    /// Phase a single tool name points to.
    pub fn of_tool(tool: &str) -> Phase {
        let tool = tool.to_ascii_lowercase();
        if ["deploy", "release", "publish", "push"]
            .iter()
            .any(|k| tool.contains(k))
        {
            Phase::Deployment
        } else if tool.contains("test") || tool.contains("bash") || tool.contains("shell") {
            Phase::Testing
        } else if tool.contains("edit") || tool.contains("write") {
            Phase::Implementation
        } else if ["read", "grep", "glob", "search", "fetch", "ls"]
            .iter()
            .any(|k| tool.contains(k))
        {
            Phase::Exploration
        } else {
            Phase::Unknown
        }
    }

    /// Majority phase over the most recent tool events; ties go to the most recent.
    pub fn infer(history: &VecDeque<ToolEvent>) -> Phase {
        let mut counts: HashMap<Phase, usize> = HashMap::new();
        let recent: Vec<Phase> = history
            .iter()
            .rev()
            .take(PHASE_WINDOW)
            .map(|e| Phase::of_tool(&e.tool))
            .filter(|p| *p != Phase::Unknown)
            .collect();

        for phase in &recent {
            *counts.entry(*phase).or_default() += 1;
        }

        let best = counts.values().copied().max().unwrap_or(0);
        recent
            .into_iter()
            .find(|p| counts.get(p).copied() == Some(best))
            .unwrap_or(Phase::Unknown)
    }
}

/// One tool invocation seen by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEvent {
    pub tool: String,
    pub at: DateTime<Utc>,
}

/// Record of a fingerprint surfaced for a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShownFingerprint {
    pub tool: String,
    pub fingerprint: String,
    pub last_emit: DateTime<Utc>,
    pub emit_count: u32,
}

/// Per-session advisory state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub tool_history: VecDeque<ToolEvent>,
    /// Keyed by `tool:fingerprint`
    pub shown_fingerprints: HashMap<String, ShownFingerprint>,
    pub phase: Phase,
    pub updated_at: DateTime<Utc>,
}

fn shown_key(tool: &str, fingerprint: &str) -> String {
    format!("{}:{}", tool, fingerprint)
}

impl SessionState {
    /// Create empty state for a session
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            tool_history: VecDeque::new(),
            shown_fingerprints: HashMap::new(),
            phase: Phase::Unknown,
            updated_at: Utc::now(),
        }
    }

    /// Last time `fingerprint` was emitted for `tool`.
    pub fn last_shown(&self, tool: &str, fingerprint: &str) -> Option<DateTime<Utc>> {
        self.shown_fingerprints
            .get(&shown_key(tool, fingerprint))
            .map(|s| s.last_emit)
    }

    /// Whether `fingerprint` was emitted for `tool` within `window` of `now`.
    pub fn in_cooldown(
        &self,
        tool: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> bool {
        self.last_shown(tool, fingerprint)
            .map(|at| now - at < window)
            .unwrap_or(false)
    }

    /// Total emissions of `fingerprint` in this session, across tools.
    pub fn emit_count(&self, fingerprint: &str) -> u32 {
        self.shown_fingerprints
            .values()
            .filter(|s| s.fingerprint == fingerprint)
            .map(|s| s.emit_count)
            .sum()
    }

    /// Append a tool event and refresh the inferred phase.
    pub fn record_tool(&mut self, tool: &str, now: DateTime<Utc>, max_len: usize) {
        self.tool_history.push_back(ToolEvent {
            tool: tool.to_string(),
            at: now,
        });
        while self.tool_history.len() > max_len.max(1) {
            self.tool_history.pop_front();
        }
        self.phase = Phase::infer(&self.tool_history);
        self.updated_at = now;
    }

    /// Record that `fingerprint` was surfaced for `tool`.
    pub fn record_emit(&mut self, tool: &str, fingerprint: &str, now: DateTime<Utc>) {
        let entry = self
            .shown_fingerprints
            .entry(shown_key(tool, fingerprint))
            .or_insert_with(|| ShownFingerprint {
                tool: tool.to_string(),
                fingerprint: fingerprint.to_string(),
                last_emit: now,
                emit_count: 0,
            });
        entry.last_emit = now;
        entry.emit_count += 1;
        self.updated_at = now;
    }

    /// Drop shown entries last emitted before `cutoff`.
    pub fn prune_shown(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.shown_fingerprints.len();
        self.shown_fingerprints.retain(|_, s| s.last_emit >= cutoff);
        before - self.shown_fingerprints.len()
    }
}

/// Session manager
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Mutex<SessionState>>>>>,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get or create the state slot for a session
    async fn slot(&self, session_id: &str) -> Arc<Mutex<SessionState>> {
        if let Some(slot) = self.sessions.read().await.get(session_id) {
            return slot.clone();
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(session_id = %session_id, "Created advisory session");
                Arc::new(Mutex::new(SessionState::new(session_id)))
            })
            .clone()
    }

    /// Copy of the session's current state (created empty if unknown)
    pub async fn snapshot(&self, session_id: &str) -> SessionState {
        self.slot(session_id).await.lock().await.clone()
    }

    /// Apply a mutation as the session's single writer.
    pub async fn commit<F, R>(&self, session_id: &str, mutate: F) -> R
    where
        F: FnOnce(&mut SessionState) -> R,
    {
        let slot = self.slot(session_id).await;
        let mut state = slot.lock().await;
        mutate(&mut state)
    }

    /// Get session count
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Export all session states for persistence
    pub async fn export(&self) -> Vec<SessionState> {
        let slots: Vec<Arc<Mutex<SessionState>>> =
            self.sessions.read().await.values().cloned().collect();
        let mut states = Vec::with_capacity(slots.len());
        for slot in slots {
            states.push(slot.lock().await.clone());
        }
        states
    }

    /// Replace session states with persisted ones
    pub async fn import(&self, states: Vec<SessionState>) {
        let mut sessions = self.sessions.write().await;
        for state in states {
            sessions.insert(state.session_id.clone(), Arc::new(Mutex::new(state)));
        }
    }

    /// Remove sessions idle since before `cutoff` and prune old fingerprints
    pub async fn cleanup_idle(&self, cutoff: DateTime<Utc>) -> usize {
        let slots: Vec<(String, Arc<Mutex<SessionState>>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut idle = Vec::new();
        for (id, slot) in slots {
            let mut state = slot.lock().await;
            if state.updated_at < cutoff {
                idle.push(id);
            } else {
                state.prune_shown(cutoff);
            }
        }

        if !idle.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in &idle {
                sessions.remove(id);
            }
            tracing::info!("Cleaned up {} idle advisory sessions", idle.len());
        }
        idle.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
