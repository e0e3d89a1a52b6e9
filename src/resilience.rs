//! Resilience utilities: concurrency limits and sliding-window rates.
//!
//! - [`Bulkhead`]: owned-permit inflight limit for the reliable router
//! - [`RateWindow`]: sliding-window event counter for backpressure rates
//!
//! ```rust
//! use coordination_engine::resilience::Bulkhead;
//!
//! let inflight = Bulkhead::new(2);
//! let permit = inflight.try_acquire();
//! assert!(permit.is_some());
//! assert_eq!(inflight.in_use(), 1);
//! drop(permit);
//! assert_eq!(inflight.in_use(), 0);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

// =============================================================================
// Bulkhead
// =============================================================================

/// Caps how many operations may hold a slot at once.
///
/// Permits are owned so a reliable send can park its permit next to the
/// pending acknowledgment. Dropping the permit frees the slot.
#[derive(Debug)]
pub struct Bulkhead {
    slots: Arc<Semaphore>,
    limit: usize,
}

impl Bulkhead {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Take a slot if one is free. Never waits.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.limit.saturating_sub(self.available())
    }

    pub fn max_concurrent(&self) -> usize {
        self.limit
    }

    pub fn is_full(&self) -> bool {
        self.available() == 0
    }
}

// =============================================================================
// RateWindow (Sliding-window counter)
// =============================================================================

/// Counts events over a sliding time window.
#[derive(Debug, Clone)]
pub struct RateWindow {
    window: Duration,
    events: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            events: VecDeque::new(),
        }
    }

    /// Record one event now.
    pub fn record(&mut self) {
        let now = Instant::now();
        self.events.push_back(now);
        self.prune(now);
    }

    /// Events inside the window.
    pub fn count(&mut self) -> usize {
        self.prune(Instant::now());
        self.events.len()
    }

    /// Events per second over the window.
    pub fn rate(&mut self) -> f64 {
        self.count() as f64 / self.window.as_secs_f64()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    fn prune(&mut self, now: Instant) {
        // An event exactly `window` old has left the window
        while let Some(oldest) = self.events.front() {
            if now.saturating_duration_since(*oldest) < self.window {
                break;
            }
            self.events.pop_front();
        }
    }
}
