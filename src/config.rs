//! Configuration for the coordination engine.
//!
//! Configuration can be constructed programmatically or deserialized from
//! YAML/JSON. Every field has a serde default, so partial documents work.
//!
//! # Quick Start
//!
//! ```rust
//! use coordination_engine::config::CoordinationConfig;
//!
//! let config = CoordinationConfig {
//!     node_id: "node-1".into(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! CoordinationConfig
//! ├── node_id: String                  # This node's unique ID
//! ├── coordinator: CoordinatorConfig   # Parent-side heartbeat cadence, quorum
//! ├── session: SessionConfig           # Child-side join/rejoin/heartbeat timing
//! ├── backpressure: BackpressureConfig # Watermarks and rate limits
//! ├── router: RouterConfig             # Reliable delivery limits
//! └── delivery: DeliveryConfig         # Delivery record retention
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! node_id: "tree.node.root"
//!
//! coordinator:
//!   heartbeat_interval_ms: 30000
//!   ready_quorum: all
//!
//! session:
//!   heartbeat_timeout_ms: 90000
//!   session_ttl: "1h"
//!
//! backpressure:
//!   warning_threshold: 0.7
//!   pause_threshold: 0.9
//! ```

use crate::error::{CoordinationError, Result};
use crate::messaging::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// The identity of the local node.
    pub node_id: String,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub session: SessionConfig,

    /// Defaults used for every per-session backpressure manager.
    #[serde(default)]
    pub backpressure: BackpressureConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            node_id: "local.dev.node.default".to_string(),
            coordinator: CoordinatorConfig::default(),
            session: SessionConfig::default(),
            backpressure: BackpressureConfig::default(),
            router: RouterConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl CoordinationConfig {
    /// Create a config with short intervals for tests.
    pub fn for_testing(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            coordinator: CoordinatorConfig::for_testing(),
            session: SessionConfig::for_testing(),
            backpressure: BackpressureConfig::for_testing(),
            router: RouterConfig::for_testing(),
            delivery: DeliveryConfig::default(),
        }
    }

    /// Check the whole tree for inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(CoordinationError::Config("node_id must not be empty".into()));
        }
        self.coordinator.validate()?;
        self.session.validate()?;
        self.backpressure.validate()?;
        self.router.validate()?;
        self.delivery.validate()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CoordinatorConfig: parent-side orchestration
// ═══════════════════════════════════════════════════════════════════════════════

/// How many children of a session must report READY before it synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReadyQuorum {
    /// The first READY synchronizes the session.
    #[default]
    Any,
    /// Every child of the session must be ready.
    All,
    /// At least `n` children (capped at the session size).
    AtLeast(usize),
}

impl ReadyQuorum {
    /// Number of ready children required for a session of `child_count`.
    pub fn required(&self, child_count: usize) -> usize {
        let needed = match self {
            ReadyQuorum::Any => 1,
            ReadyQuorum::All => child_count,
            ReadyQuorum::AtLeast(n) => (*n).min(child_count),
        };
        needed.max(1)
    }
}

/// Parent-side coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Interval between heartbeats sent to synchronized/degraded sessions (ms).
    #[serde(default = "default_coordinator_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,

    /// Ready quorum for synchronizing a session.
    #[serde(default)]
    pub ready_quorum: ReadyQuorum,

    /// Reject (instead of only logging) out-of-sequence protocol messages.
    #[serde(default)]
    pub strict_sequencing: bool,
}

fn default_coordinator_heartbeat_ms() -> u64 {
    30_000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            ready_quorum: ReadyQuorum::Any,
            strict_sequencing: false,
        }
    }
}

impl CoordinatorConfig {
    pub fn for_testing() -> Self {
        Self {
            heartbeat_interval_ms: 100,
            ..Default::default()
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(CoordinationError::Config(
                "coordinator.heartbeat_interval_ms must be > 0".into(),
            ));
        }
        if self.ready_quorum == ReadyQuorum::AtLeast(0) {
            return Err(CoordinationError::Config(
                "coordinator.ready_quorum at_least must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SessionConfig: child-side session lifecycle
// ═══════════════════════════════════════════════════════════════════════════════

/// Session lifecycle settings.
///
/// Rejoin backoff for attempt `n` (0-based) is
/// `min(initial_backoff * multiplier^n, max_backoff) ± jitter`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a join may stay unconfirmed (ms).
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    /// Cadence of the heartbeat-timeout check (ms).
    #[serde(default = "default_session_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,

    /// A session with no heartbeat for this long is marked failed (ms).
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Maximum session lifetime (humantime, e.g. "1h", "90s").
    #[serde(default = "default_session_ttl")]
    pub session_ttl: String,

    /// Cadence of the expired-session sweep (ms).
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Fraction of the delay added or removed at random (0.1 = ±10%).
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    #[serde(default = "default_max_rejoin_attempts")]
    pub max_rejoin_attempts: u32,

    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
}

fn default_join_timeout_ms() -> u64 {
    30_000
}

fn default_session_heartbeat_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    90_000
}

fn default_session_ttl() -> String {
    "1h".to_string()
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_jitter() -> f64 {
    0.1
}

fn default_max_rejoin_attempts() -> u32 {
    5
}

fn default_max_concurrent_sessions() -> usize {
    100
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: default_join_timeout_ms(),
            heartbeat_interval_ms: default_session_heartbeat_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            session_ttl: default_session_ttl(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_jitter: default_backoff_jitter(),
            max_rejoin_attempts: default_max_rejoin_attempts(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
        }
    }
}

impl SessionConfig {
    /// Short timings, no jitter.
    pub fn for_testing() -> Self {
        Self {
            join_timeout_ms: 500,
            heartbeat_interval_ms: 50,
            heartbeat_timeout_ms: 200,
            session_ttl: "5s".to_string(),
            cleanup_interval_ms: 100,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            backoff_jitter: 0.0,
            ..Default::default()
        }
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Parse the session_ttl string to a Duration.
    pub fn session_ttl_duration(&self) -> Duration {
        humantime::parse_duration(&self.session_ttl).unwrap_or(Duration::from_secs(3600))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 || self.cleanup_interval_ms == 0 {
            return Err(CoordinationError::Config(
                "session check intervals must be > 0".into(),
            ));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(CoordinationError::Config(
                "session.max_concurrent_sessions must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(CoordinationError::Config(
                "session.backoff_jitter must be within [0, 1]".into(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(CoordinationError::Config(
                "session.backoff_multiplier must be >= 1".into(),
            ));
        }
        if humantime::parse_duration(&self.session_ttl).is_err() {
            return Err(CoordinationError::Config(format!(
                "session.session_ttl is not a duration: {}",
                self.session_ttl
            )));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BackpressureConfig: queue watermarks
// ═══════════════════════════════════════════════════════════════════════════════

/// Watermarks and rate limits for a backpressure manager.
///
/// Thresholds are queue utilizations in `[0, 1]` and must satisfy
/// `resume < warning <= pause <= critical`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    #[serde(default = "default_pause_threshold")]
    pub pause_threshold: f64,

    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,

    /// Utilization a pressured manager must fall to before returning to normal.
    #[serde(default = "default_resume_threshold")]
    pub resume_threshold: f64,

    /// Maximum enqueues per second across the session.
    #[serde(default = "default_max_enqueue_rate")]
    pub max_enqueue_rate: f64,

    /// Sliding window for rate calculation (ms).
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,

    /// Monitor tick interval (ms).
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

fn default_warning_threshold() -> f64 {
    0.7
}

fn default_pause_threshold() -> f64 {
    0.9
}

fn default_critical_threshold() -> f64 {
    0.95
}

fn default_resume_threshold() -> f64 {
    0.5
}

fn default_max_enqueue_rate() -> f64 {
    1000.0
}

fn default_rate_window_ms() -> u64 {
    1_000
}

fn default_check_interval_ms() -> u64 {
    1_000
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            warning_threshold: default_warning_threshold(),
            pause_threshold: default_pause_threshold(),
            critical_threshold: default_critical_threshold(),
            resume_threshold: default_resume_threshold(),
            max_enqueue_rate: default_max_enqueue_rate(),
            rate_window_ms: default_rate_window_ms(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl BackpressureConfig {
    pub fn for_testing() -> Self {
        Self {
            check_interval_ms: 50,
            ..Default::default()
        }
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let ordered = self.resume_threshold < self.warning_threshold
            && self.warning_threshold <= self.pause_threshold
            && self.pause_threshold <= self.critical_threshold
            && self.critical_threshold <= 1.0
            && self.resume_threshold >= 0.0;
        if !ordered {
            return Err(CoordinationError::Config(format!(
                "backpressure thresholds must satisfy resume < warning <= pause <= critical <= 1 \
                 (got resume={}, warning={}, pause={}, critical={})",
                self.resume_threshold,
                self.warning_threshold,
                self.pause_threshold,
                self.critical_threshold
            )));
        }
        if self.rate_window_ms == 0 || self.check_interval_ms == 0 {
            return Err(CoordinationError::Config(
                "backpressure windows and intervals must be > 0".into(),
            ));
        }
        if self.max_enqueue_rate <= 0.0 {
            return Err(CoordinationError::Config(
                "backpressure.max_enqueue_rate must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RouterConfig: reliable delivery
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for the reliable message router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Reliable sends allowed in flight before new sends are queued.
    #[serde(default = "default_max_inflight")]
    pub max_inflight_messages: usize,

    /// How long an acknowledged delivery waits for its ack (ms).
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Policy used when a send does not supply its own.
    #[serde(default)]
    pub default_retry_policy: RetryPolicy,

    /// Recently seen message ids kept for exactly-once deduplication.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// How long a seen message id is remembered (ms).
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,

    /// Cadence of delivery-record garbage collection (ms).
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
}

fn default_max_inflight() -> usize {
    100
}

fn default_ack_timeout_ms() -> u64 {
    30_000
}

fn default_dedup_capacity() -> usize {
    10_000
}

fn default_dedup_window_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_maintenance_interval_ms() -> u64 {
    60_000
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_inflight_messages: default_max_inflight(),
            ack_timeout_ms: default_ack_timeout_ms(),
            default_retry_policy: RetryPolicy::default(),
            dedup_capacity: default_dedup_capacity(),
            dedup_window_ms: default_dedup_window_ms(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
        }
    }
}

impl RouterConfig {
    pub fn for_testing() -> Self {
        Self {
            ack_timeout_ms: 500,
            default_retry_policy: RetryPolicy::fixed_delay(Duration::from_millis(10), 3),
            maintenance_interval_ms: 1_000,
            ..Default::default()
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_inflight_messages == 0 {
            return Err(CoordinationError::Config(
                "router.max_inflight_messages must be > 0".into(),
            ));
        }
        if self.dedup_capacity == 0 {
            return Err(CoordinationError::Config(
                "router.dedup_capacity must be > 0".into(),
            ));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(CoordinationError::Config(
                "router.maintenance_interval_ms must be > 0".into(),
            ));
        }
        self.default_retry_policy.validate()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DeliveryConfig: delivery record retention
// ═══════════════════════════════════════════════════════════════════════════════

/// Retention settings for the delivery tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Records kept before oldest-first eviction of settled ones.
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// Extra records removed per eviction pass.
    #[serde(default = "default_eviction_margin")]
    pub eviction_margin: usize,

    /// Terminal records older than this are garbage-collected (sec).
    #[serde(default = "default_record_max_age_sec")]
    pub record_max_age_sec: u64,
}

fn default_max_records() -> usize {
    10_000
}

fn default_eviction_margin() -> usize {
    100
}

fn default_record_max_age_sec() -> u64 {
    3_600
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            eviction_margin: default_eviction_margin(),
            record_max_age_sec: default_record_max_age_sec(),
        }
    }
}

impl DeliveryConfig {
    pub fn record_max_age(&self) -> Duration {
        Duration::from_secs(self.record_max_age_sec)
    }

    fn validate(&self) -> Result<()> {
        if self.max_records == 0 {
            return Err(CoordinationError::Config(
                "delivery.max_records must be > 0".into(),
            ));
        }
        Ok(())
    }
}
