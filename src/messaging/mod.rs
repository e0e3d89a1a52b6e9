//! Reliable messaging layer.
//!
//! Leaves first:
//!
//! - [`retry`]: backoff computation and retry eligibility
//! - [`delivery`]: per-message delivery bookkeeping
//! - [`dedup`]: receive-side duplicate suppression
//! - [`failure`]: probability-gated fault injection for chaos tests
//! - [`router`]: retries, inflight limits and acknowledgments over a
//!   best-effort [`Transport`](crate::transport::Transport)

pub mod dedup;
pub mod delivery;
pub mod failure;
pub mod retry;
pub mod router;

pub use dedup::DedupCache;
pub use delivery::{DeliveryRecord, DeliveryStats, DeliveryStatus, DeliveryTracker};
pub use failure::{FailureInjector, FailureRule, FailureStats, FailureType, CORRUPTED_MARKER};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use router::{
    DeliveryEvent, ReceiveOutcome, ReliabilityLevel, ReliableMessage, ReliableMessageRouter,
    RouterStats,
};
