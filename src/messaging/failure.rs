//! Controlled failure injection for resilience testing.
//!
//! A [`FailureInjector`] holds named [`FailureRule`]s. Each rule is gated by
//! a probability and optionally by a regular expression matched against the
//! message's display form plus its serialized payload. The first enabled rule
//! whose roll succeeds decides the failure type.
//!
//! Injected failures never reach production paths on their own: the
//! injector only acts when a test harness routes sends through it (see
//! [`ChaosTransport`](crate::transport::ChaosTransport)).
//!
//! Seed the injector with [`FailureInjector::with_seed`] for reproducible runs.

use crate::error::{CoordinationError, Result};
use crate::message::Message;
use crate::metrics;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Kinds of failure the injector can simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureType {
    /// Drop the message as if the network timed out.
    NetworkTimeout,
    /// Drop the message as if the connection went away.
    ConnectionLost,
    /// Tag the payload as corrupted and deliver it anyway.
    MessageCorruption,
    /// Drop half the time.
    PartialFailure,
    /// Delay, then deliver.
    SlowResponse,
    /// Deliver, and keep a copy for a later duplicate delivery.
    DuplicateDelivery,
    /// Hold the message and release it later.
    OutOfOrder,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureType::NetworkTimeout => "network_timeout",
            FailureType::ConnectionLost => "connection_lost",
            FailureType::MessageCorruption => "message_corruption",
            FailureType::PartialFailure => "partial_failure",
            FailureType::SlowResponse => "slow_response",
            FailureType::DuplicateDelivery => "duplicate_delivery",
            FailureType::OutOfOrder => "out_of_order",
        };
        f.write_str(name)
    }
}

/// Payload key set on corrupted messages.
pub const CORRUPTED_MARKER: &str = "__corrupted__";

/// One chaos-injection rule.
#[derive(Debug, Clone)]
pub struct FailureRule {
    pub failure_type: FailureType,
    /// Chance in `[0, 1]` that a matching message triggers the failure.
    pub probability: f64,
    pub target_pattern: Option<Regex>,
    /// Bounds for the SLOW_RESPONSE delay.
    pub delay_range: (Duration, Duration),
    pub enabled: bool,
}

impl FailureRule {
    pub fn new(failure_type: FailureType, probability: f64) -> Self {
        Self {
            failure_type,
            probability: probability.clamp(0.0, 1.0),
            target_pattern: None,
            delay_range: (Duration::from_secs(1), Duration::from_secs(5)),
            enabled: true,
        }
    }

    /// Only apply the rule to messages matching `pattern`.
    pub fn with_target(mut self, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| CoordinationError::Config(format!("invalid target pattern: {}", e)))?;
        self.target_pattern = Some(regex);
        Ok(self)
    }

    #[must_use]
    pub fn with_delay_range(mut self, min: Duration, max: Duration) -> Self {
        self.delay_range = if min <= max { (min, max) } else { (max, min) };
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn matches(&self, message: &Message) -> bool {
        match &self.target_pattern {
            None => true,
            Some(pattern) => {
                let text = format!("{} {}", message, message.payload);
                pattern.is_match(&text)
            }
        }
    }
}

/// Injection counters and backlog sizes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureStats {
    pub failures_injected: u64,
    pub timeouts_injected: u64,
    pub corruptions_injected: u64,
    pub duplicates_injected: u64,
    pub delays_injected: u64,
    pub enabled: bool,
    pub active_rules: usize,
    pub delayed_messages: usize,
    pub duplicate_candidates: usize,
}

struct InjectorState {
    /// Insertion-ordered; the first matching rule wins.
    rules: Vec<(String, FailureRule)>,
    rng: StdRng,
    stats: FailureStats,
    duplicates: Vec<Message>,
    delayed: Vec<(Message, Instant)>,
}

/// Probability-gated fault injector.
pub struct FailureInjector {
    enabled: AtomicBool,
    state: Mutex<InjectorState>,
}

impl Default for FailureInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureInjector {
    /// Disabled injector seeded from OS entropy.
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_os_rng())
    }

    /// Disabled injector with a fixed seed.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            state: Mutex::new(InjectorState {
                rules: Vec::new(),
                rng,
                stats: FailureStats::default(),
                duplicates: Vec::new(),
                delayed: Vec::new(),
            }),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
        info!("Failure injection enabled");
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        info!("Failure injection disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Add or replace a named rule.
    pub fn add_rule(&self, name: impl Into<String>, rule: FailureRule) {
        let name = name.into();
        let mut state = self.state.lock();
        if let Some(slot) = state.rules.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = rule;
        } else {
            state.rules.push((name, rule));
        }
    }

    /// Remove a named rule. Returns `true` if it existed.
    pub fn remove_rule(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.rules.len();
        state.rules.retain(|(n, _)| n != name);
        state.rules.len() != before
    }

    pub fn clear_rules(&self) {
        self.state.lock().rules.clear();
    }

    /// Decide whether `message` should fail, and how.
    ///
    /// Iterates enabled rules in insertion order and returns the first
    /// failure type whose probability roll succeeds.
    pub fn should_inject_failure(&self, message: &Message) -> Option<FailureType> {
        if !self.is_enabled() {
            return None;
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        for (name, rule) in &state.rules {
            if !rule.enabled || !rule.matches(message) {
                continue;
            }
            if state.rng.random::<f64>() < rule.probability {
                state.stats.failures_injected += 1;
                debug!(rule = %name, failure = %rule.failure_type, message = %message, "Injecting failure");
                metrics::record_failure_injected(&rule.failure_type.to_string());
                return Some(rule.failure_type);
            }
        }
        None
    }

    /// Apply `failure_type` to `message`.
    ///
    /// Returns `true` if the message should be dropped (the send fails),
    /// `false` if it should continue, possibly modified or delayed.
    pub async fn inject_failure(&self, message: &mut Message, failure_type: FailureType) -> bool {
        match failure_type {
            FailureType::NetworkTimeout => {
                self.state.lock().stats.timeouts_injected += 1;
                true
            }
            FailureType::ConnectionLost => true,
            FailureType::MessageCorruption => {
                self.state.lock().stats.corruptions_injected += 1;
                match message.payload.as_object_mut() {
                    Some(object) => {
                        object.insert(CORRUPTED_MARKER.to_string(), Value::Bool(true));
                    }
                    None => {
                        message.metadata.insert(CORRUPTED_MARKER.to_string(), Value::Bool(true));
                    }
                }
                false
            }
            FailureType::PartialFailure => self.state.lock().rng.random_bool(0.5),
            FailureType::SlowResponse => {
                let delay = {
                    let mut guard = self.state.lock();
                    let state = &mut *guard;
                    state.stats.delays_injected += 1;
                    let (min, max) = state
                        .rules
                        .iter()
                        .find(|(_, r)| r.enabled && r.failure_type == FailureType::SlowResponse)
                        .map(|(_, r)| r.delay_range)
                        .unwrap_or((Duration::from_secs(1), Duration::from_secs(5)));
                    if min == max {
                        min
                    } else {
                        state.rng.random_range(min..=max)
                    }
                };
                tokio::time::sleep(delay).await;
                false
            }
            FailureType::DuplicateDelivery => {
                let mut state = self.state.lock();
                state.stats.duplicates_injected += 1;
                state.duplicates.push(message.clone());
                false
            }
            FailureType::OutOfOrder => {
                let mut state = self.state.lock();
                let hold = Duration::from_millis(state.rng.random_range(500..=2_000));
                state.delayed.push((message.clone(), Instant::now() + hold));
                true
            }
        }
    }

    /// Release held (out-of-order) messages whose hold time has passed.
    pub fn process_delayed_messages(&self) -> Vec<Message> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let (ready, waiting): (Vec<_>, Vec<_>) =
            state.delayed.drain(..).partition(|(_, until)| *until <= now);
        state.delayed = waiting;
        ready.into_iter().map(|(message, _)| message).collect()
    }

    /// Take the copies stashed for duplicate delivery.
    pub fn take_duplicate_messages(&self) -> Vec<Message> {
        std::mem::take(&mut self.state.lock().duplicates)
    }

    /// Mixed low-probability rules: timeouts, corruption, slow responses, duplicates.
    pub fn add_chaos_rules(&self) {
        self.add_rule("chaos_timeout", FailureRule::new(FailureType::NetworkTimeout, 0.1));
        self.add_rule("chaos_corruption", FailureRule::new(FailureType::MessageCorruption, 0.05));
        self.add_rule("chaos_slow", FailureRule::new(FailureType::SlowResponse, 0.15));
        self.add_rule("chaos_duplicate", FailureRule::new(FailureType::DuplicateDelivery, 0.08));
    }

    /// High-probability timeouts and disconnects.
    pub fn add_network_partition_rules(&self) {
        self.add_rule("partition_timeout", FailureRule::new(FailureType::NetworkTimeout, 0.8));
        self.add_rule("partition_connection", FailureRule::new(FailureType::ConnectionLost, 0.3));
    }

    pub fn statistics(&self) -> FailureStats {
        let state = self.state.lock();
        FailureStats {
            enabled: self.is_enabled(),
            active_rules: state.rules.iter().filter(|(_, r)| r.enabled).count(),
            delayed_messages: state.delayed.len(),
            duplicate_candidates: state.duplicates.len(),
            ..state.stats.clone()
        }
    }

    /// Zero the injection counters. Rules and backlogs are kept.
    pub fn reset_statistics(&self) {
        self.state.lock().stats = FailureStats::default();
    }
}

impl fmt::Display for FailureInjector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.statistics();
        write!(
            f,
            "FailureInjector(enabled={}, rules={}, failures={})",
            stats.enabled, stats.active_rules, stats.failures_injected
        )
    }
}
