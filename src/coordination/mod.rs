//! Parent/child coordination protocol.
//!
//! - [`types`]: coordination states and the session record
//! - [`state`]: validating state machine with hooks and history
//! - [`protocol`]: message vocabulary, factories and sequencing rules
//! - [`backpressure`]: per-session queue-watermark flow control
//! - [`session`]: child-side join/leave/rejoin and heartbeat monitoring
//! - [`coordinator`]: parent-side session orchestration

pub mod backpressure;
pub mod coordinator;
pub mod protocol;
pub mod session;
pub mod state;
pub mod types;

pub use backpressure::{
    next_state, BackpressureListener, BackpressureManager, BackpressureMetrics, BackpressureState,
    BackpressureStats, QueueDepth, QueueMetrics, SharedDepth,
};
pub use coordinator::{Coordinator, CoordinatorListener, CoordinatorStats};
pub use protocol::{
    CoordinationMessage, CoordinationMessageType, CoordinationProtocol, Direction,
};
pub use session::{
    rejoin_backoff, SessionEvent, SessionListener, SessionManager, SessionMetrics, SessionStats,
};
pub use state::{StateManager, StateStats, StateTransition, TransitionHook};
pub use types::{CoordinationSession, CoordinationState};
