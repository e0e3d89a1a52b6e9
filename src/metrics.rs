//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Coordination sessions and state transitions
//! - Heartbeats and heartbeat lag
//! - Backpressure state and flow-control signals
//! - Reliable delivery (sends, retries, outcomes, inflight)
//! - Injected failures (chaos testing)
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `coordination_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No recorder is installed by this crate. Without one every call is a no-op.
//!
//! # Usage
//!
//! ```rust,no_run
//! use coordination_engine::metrics;
//! use std::time::Duration;
//!
//! // After a reliable delivery is acknowledged
//! metrics::record_delivery_outcome("delivered", Duration::from_millis(12));
//!
//! // When a backpressure manager changes state
//! metrics::record_backpressure_state("session-a-0", "warning");
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// State machines and sessions
// =============================================================================

/// Record an applied state-machine transition.
pub fn record_state_transition(from: &str, to: &str) {
    counter!("coordination_state_transitions_total", "from" => from.to_string(), "to" => to.to_string())
        .increment(1);
}

/// Set the overall coordinator state.
pub fn set_coordination_state(node_id: &str, state: &str) {
    gauge!("coordination_coordinator_state", "node_id" => node_id.to_string(), "state" => state.to_string())
        .set(1.0);
}

/// Record a parent-side session lifecycle outcome (created, completed, failed).
pub fn record_coordination_session(outcome: &str) {
    counter!("coordination_sessions_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a command dispatched to a synchronized session.
pub fn record_command(command: &str) {
    counter!("coordination_commands_total", "command" => command.to_string()).increment(1);
}

/// Record a child-side session event (join_request, heartbeat_timeout, ...).
pub fn record_session_event(event: &str) {
    counter!("coordination_session_events_total", "event" => event.to_string()).increment(1);
}

/// Set the number of sessions a node participates in.
pub fn set_active_sessions(node_id: &str, count: usize) {
    gauge!("coordination_active_sessions", "node_id" => node_id.to_string()).set(count as f64);
}

/// Record a rejoin attempt and the backoff that preceded it.
pub fn record_rejoin_attempt(backoff: Duration) {
    counter!("coordination_rejoin_attempts_total").increment(1);
    histogram!("coordination_rejoin_backoff_seconds").record(backoff.as_secs_f64());
}

// =============================================================================
// Heartbeats
// =============================================================================

/// Record heartbeats sent or received.
pub fn record_heartbeats(direction: &str, count: usize) {
    if count == 0 {
        return;
    }
    counter!("coordination_heartbeats_total", "direction" => direction.to_string())
        .increment(count as u64);
}

/// Record time between a heartbeat sent and the next one received.
pub fn record_heartbeat_lag(lag: Duration) {
    histogram!("coordination_heartbeat_lag_seconds").record(lag.as_secs_f64());
}

// =============================================================================
// Backpressure
// =============================================================================

/// Record a backpressure state change.
pub fn record_backpressure_state(session_id: &str, state: &str) {
    counter!("coordination_backpressure_transitions_total", "state" => state.to_string()).increment(1);
    let level = match state {
        "normal" => 0.0,
        "warning" => 1.0,
        "paused" => 2.0,
        _ => 3.0,
    };
    gauge!("coordination_backpressure_level", "session_id" => session_id.to_string()).set(level);
}

/// Record a PAUSE or RESUME signal taking effect.
pub fn record_backpressure_signal(action: &str) {
    counter!("coordination_backpressure_signals_total", "action" => action.to_string()).increment(1);
}

/// Record a refused enqueue.
pub fn record_enqueue_refused(reason: &str) {
    counter!("coordination_enqueue_refused_total", "reason" => reason.to_string()).increment(1);
}

// =============================================================================
// Reliable delivery
// =============================================================================

/// Record a reliable send request at the given reliability level.
pub fn record_reliable_send(level: &str) {
    counter!("coordination_reliable_sends_total", "level" => level.to_string()).increment(1);
}

/// Record a send that was queued because the inflight limit was reached.
pub fn record_inflight_limit_hit() {
    counter!("coordination_inflight_limit_hits_total").increment(1);
}

/// Record a duplicate suppressed on the receive path.
pub fn record_duplicate_detected() {
    counter!("coordination_duplicates_detected_total").increment(1);
}

/// Record a retry. `attempt` is the attempt about to be made.
pub fn record_retry(attempt: u32) {
    counter!("coordination_retries_total").increment(1);
    histogram!("coordination_retry_attempt").record(f64::from(attempt));
}

/// Record a terminal delivery outcome and its latency.
pub fn record_delivery_outcome(status: &str, latency: Duration) {
    counter!("coordination_deliveries_total", "status" => status.to_string()).increment(1);
    histogram!("coordination_delivery_latency_seconds", "status" => status.to_string())
        .record(latency.as_secs_f64());
}

/// Set the router's inflight and backlog sizes.
pub fn set_router_inflight(inflight: usize, queued: usize) {
    gauge!("coordination_router_inflight").set(inflight as f64);
    gauge!("coordination_router_queued").set(queued as f64);
}

// =============================================================================
// Chaos
// =============================================================================

/// Record an injected failure.
pub fn record_failure_injected(failure_type: &str) {
    counter!("coordination_failures_injected_total", "type" => failure_type.to_string()).increment(1);
}
