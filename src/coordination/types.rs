//! Coordination state and session types.
//!
//! # State Transitions
//!
//! ```text
//!                 join / initiate
//! Disconnected ─────────────────→ Connecting ──────────┐
//!      ↑  ↑                           │                │
//!      │  │              (ready)      ↓                │ (timeout)
//!      │  └───────────────────── Synchronized ←──┐     │
//!      │                              │          │     │
//!      │                      (error) ↓  (ready) │     ↓
//!      │                          Degraded ──────┘   Failed
//!      │                              │                │
//!      └──────────────────────────────┴── (rejoin) ────┘
//! ```
//!
//! Every non-initial state may also fall back to `Disconnected`, and
//! `Failed` may go straight back to `Connecting` on rejoin. The table in
//! [`CoordinationState::valid_transitions`] is authoritative.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tokio::time::Instant;

/// State of one coordination relationship.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationState {
    /// No relationship. Initial state.
    #[default]
    Disconnected,

    /// Join or initiation in progress.
    Connecting,

    /// Children ready; commands may be executed.
    Synchronized,

    /// A child reported an error. Recovers on the next READY.
    Degraded,

    /// Heartbeat timeout or unrecoverable error. Recoverable via rejoin.
    Failed,
}

impl CoordinationState {
    pub const ALL: [CoordinationState; 5] = [
        CoordinationState::Disconnected,
        CoordinationState::Connecting,
        CoordinationState::Synchronized,
        CoordinationState::Degraded,
        CoordinationState::Failed,
    ];

    /// Legal successor states.
    pub fn valid_transitions(&self) -> &'static [CoordinationState] {
        use CoordinationState::*;
        match self {
            Disconnected => &[Connecting],
            Connecting => &[Synchronized, Failed, Disconnected],
            Synchronized => &[Degraded, Failed, Disconnected],
            Degraded => &[Synchronized, Failed, Disconnected],
            Failed => &[Disconnected, Connecting],
        }
    }

    pub fn can_transition_to(&self, to: CoordinationState) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// Synchronized or degraded: the relationship is live.
    pub fn is_active(&self) -> bool {
        matches!(self, CoordinationState::Synchronized | CoordinationState::Degraded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinationState::Disconnected => "disconnected",
            CoordinationState::Connecting => "connecting",
            CoordinationState::Synchronized => "synchronized",
            CoordinationState::Degraded => "degraded",
            CoordinationState::Failed => "failed",
        }
    }
}

impl fmt::Display for CoordinationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parent↔children coordination relationship.
#[derive(Debug, Clone)]
pub struct CoordinationSession {
    pub session_id: String,
    pub parent_id: String,
    pub child_ids: BTreeSet<String>,
    pub state: CoordinationState,
    pub created_at: Instant,
    pub last_heartbeat: Instant,
    pub metadata: HashMap<String, Value>,
}

impl CoordinationSession {
    pub fn new(
        session_id: impl Into<String>,
        parent_id: impl Into<String>,
        child_ids: impl IntoIterator<Item = String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            session_id: session_id.into(),
            parent_id: parent_id.into(),
            child_ids: child_ids.into_iter().collect(),
            state: CoordinationState::Disconnected,
            created_at: now,
            last_heartbeat: now,
            metadata: HashMap::new(),
        }
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn since_heartbeat(&self) -> std::time::Duration {
        self.last_heartbeat.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    pub fn has_child(&self, child_id: &str) -> bool {
        self.child_ids.contains(child_id)
    }
}

impl fmt::Display for CoordinationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Session({}, parent={}, children={}, state={})",
            self.session_id,
            self.parent_id,
            self.child_ids.len(),
            self.state
        )
    }
}
