//! Child-side session lifecycle.
//!
//! A [`SessionManager`] runs on a node taking part in one or more
//! coordination sessions under a parent. It owns, per session:
//!
//! - the [`CoordinationSession`] record and its state
//! - a [`SessionMetrics`] record (heartbeats, messages, errors, lag, ...)
//! - a dedicated, running [`BackpressureManager`]
//! - rejoin bookkeeping (attempts, last backoff)
//!
//! Two background loops run between `start()` and `stop()`: a heartbeat
//! monitor that fails sessions whose parent went quiet, and a sweep that
//! expires sessions older than the configured TTL.
//!
//! # Session states
//!
//! ```text
//! request_join ──→ Connecting ──confirm_join──→ Synchronized
//!                      │                            │
//!                      └──── heartbeat timeout ─────┴──→ Failed
//!                                                          │
//!                      Connecting ←──── request_rejoin ────┘
//! ```

use super::backpressure::BackpressureManager;
use super::protocol::CoordinationProtocol;
use super::types::{CoordinationSession, CoordinationState};
use crate::config::{BackpressureConfig, SessionConfig};
use crate::error::{CoordinationError, Result};
use crate::lifecycle::{guard_listener, shutdown_signalled, TaskSet};
use crate::message::Message;
use crate::metrics;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    JoinRequest,
    JoinAccepted,
    JoinRejected,
    LeaveRequest,
    LeaveConfirmed,
    RejoinRequest,
    HeartbeatTimeout,
    SessionExpired,
}

impl SessionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEvent::JoinRequest => "join_request",
            SessionEvent::JoinAccepted => "join_accepted",
            SessionEvent::JoinRejected => "join_rejected",
            SessionEvent::LeaveRequest => "leave_request",
            SessionEvent::LeaveConfirmed => "leave_confirmed",
            SessionEvent::RejoinRequest => "rejoin_request",
            SessionEvent::HeartbeatTimeout => "heartbeat_timeout",
            SessionEvent::SessionExpired => "session_expired",
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer for session lifecycle events.
///
/// `session_id` is `None` only for [`SessionEvent::JoinRejected`], where no
/// session was created.
pub trait SessionListener: Send + Sync {
    fn on_event(&self, event: SessionEvent, session_id: Option<&str>, data: &Value);
}

impl<F> SessionListener for F
where
    F: Fn(SessionEvent, Option<&str>, &Value) + Send + Sync,
{
    fn on_event(&self, event: SessionEvent, session_id: Option<&str>, data: &Value) {
        self(event, session_id, data)
    }
}

/// Per-session counters.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMetrics {
    pub session_id: String,
    pub state: CoordinationState,
    pub joined_at: Instant,
    pub last_heartbeat: Instant,
    pub heartbeat_count: u64,
    pub message_count: u64,
    pub error_count: u64,
    pub rejoin_attempts: u32,
    /// Time between our last heartbeat and the parent's latest one.
    pub lag: Option<Duration>,
    pub drops: u64,
    pub requeues: u64,
}

impl SessionMetrics {
    fn new(session_id: &str, now: Instant) -> Self {
        Self {
            session_id: session_id.to_string(),
            state: CoordinationState::Connecting,
            joined_at: now,
            last_heartbeat: now,
            heartbeat_count: 0,
            message_count: 0,
            error_count: 0,
            rejoin_attempts: 0,
            lag: None,
            drops: 0,
            requeues: 0,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.joined_at.elapsed()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    pub sessions_created: u64,
    pub sessions_joined: u64,
    pub sessions_left: u64,
    pub sessions_expired: u64,
    pub join_rejections: u64,
    pub rejoin_attempts: u64,
    pub heartbeat_timeouts: u64,
    pub active_sessions: usize,
    pub average_session_age: Duration,
    pub session_states: BTreeMap<CoordinationState, usize>,
}

/// Rejoin delay for a session that has made `attempts` rejoin attempts.
///
/// `min(initial * multiplier^attempts, max)`, then ± `jitter` of itself.
pub fn rejoin_backoff<R: Rng>(config: &SessionConfig, attempts: u32, rng: &mut R) -> Duration {
    let max_ms = config.max_backoff_ms as f64;
    let base_ms = config.initial_backoff_ms as f64
        * config
            .backoff_multiplier
            .powi(attempts.min(i32::MAX as u32) as i32);
    let capped = if base_ms.is_finite() {
        base_ms.min(max_ms)
    } else {
        max_ms
    };
    let jitter = if config.backoff_jitter > 0.0 {
        capped * config.backoff_jitter * rng.random_range(-1.0_f64..=1.0)
    } else {
        0.0
    };
    Duration::from_nanos(((capped + jitter).max(0.0) * 1_000_000.0).round() as u64)
}

struct SessionEntry {
    session: CoordinationSession,
    metrics: SessionMetrics,
    backpressure: Arc<BackpressureManager>,
    rejoin_attempts: u32,
    last_backoff: Option<Duration>,
    last_sent_heartbeat: Option<Instant>,
}

impl SessionEntry {
    fn set_state(&mut self, state: CoordinationState) {
        self.session.state = state;
        self.metrics.state = state;
    }
}

#[derive(Default)]
struct Counters {
    sessions_created: AtomicU64,
    sessions_joined: AtomicU64,
    sessions_left: AtomicU64,
    sessions_expired: AtomicU64,
    join_rejections: AtomicU64,
    rejoin_attempts: AtomicU64,
    heartbeat_timeouts: AtomicU64,
}

struct SessionInner {
    node_id: String,
    config: SessionConfig,
    backpressure_config: BackpressureConfig,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    next_session: AtomicU64,
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
    counters: Counters,
}

/// Session lifecycle manager for one participating node.
pub struct SessionManager {
    inner: Arc<SessionInner>,
    tasks: TaskSet,
}

impl SessionManager {
    pub fn new(node_id: impl Into<String>, config: SessionConfig) -> Self {
        Self::with_backpressure_config(node_id, config, BackpressureConfig::default())
    }

    /// Use `backpressure` for every per-session backpressure manager.
    pub fn with_backpressure_config(
        node_id: impl Into<String>,
        config: SessionConfig,
        backpressure: BackpressureConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                node_id: node_id.into(),
                config,
                backpressure_config: backpressure,
                sessions: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(0),
                listeners: RwLock::new(Vec::new()),
                counters: Counters::default(),
            }),
            tasks: TaskSet::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Spawn the heartbeat-timeout and TTL loops. No-op if already running.
    pub fn start(&self) {
        let Some(shutdown_rx) = self.tasks.begin() else {
            return;
        };

        let inner = Arc::clone(&self.inner);
        let mut rx = shutdown_rx.clone();
        let span = info_span!("session_heartbeat_monitor", node_id = %inner.node_id);
        self.tasks.push(tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(inner.config.heartbeat_interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_signalled(&mut rx) => break,
                        _ = ticker.tick() => {
                            inner.check_heartbeat_timeouts();
                        }
                    }
                }
                debug!("Heartbeat monitor exiting");
            }
            .instrument(span),
        ));

        let inner = Arc::clone(&self.inner);
        let mut rx = shutdown_rx;
        let span = info_span!("session_cleanup", node_id = %inner.node_id);
        self.tasks.push(tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(inner.config.cleanup_interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_signalled(&mut rx) => break,
                        _ = ticker.tick() => {
                            inner.cleanup_expired_sessions().await;
                        }
                    }
                }
                debug!("Session cleanup exiting");
            }
            .instrument(span),
        ));

        info!(node_id = %self.inner.node_id, "Session manager started");
    }

    /// Stop both loops and every per-session backpressure monitor.
    ///
    /// Sessions themselves are kept. Idempotent.
    pub async fn stop(&self) {
        if !self.tasks.stop("session_manager").await {
            return;
        }
        let managers: Vec<_> = self
            .inner
            .sessions
            .lock()
            .values()
            .map(|e| Arc::clone(&e.backpressure))
            .collect();
        for manager in managers {
            manager.stop().await;
        }
        info!(node_id = %self.inner.node_id, "Session manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.tasks.is_running()
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// Ask to join a session under `parent_id`.
    ///
    /// Creates the session in `Connecting` with this node as its only child,
    /// plus its metrics and a started backpressure manager. Fails with
    /// [`CoordinationError::SessionLimit`] once `max_concurrent_sessions`
    /// sessions exist; that refusal fires `JoinRejected`.
    pub async fn request_join(
        &self,
        parent_id: &str,
        metadata: Option<HashMap<String, Value>>,
    ) -> Result<String> {
        let inner = &self.inner;
        let max = inner.config.max_concurrent_sessions;
        let now = Instant::now();

        let created = {
            let mut sessions = inner.sessions.lock();
            if sessions.len() >= max {
                None
            } else {
                let n = inner.next_session.fetch_add(1, Ordering::Relaxed);
                let session_id = format!("session-{}-{}", inner.node_id, n);

                let mut session = CoordinationSession::new(
                    session_id.clone(),
                    parent_id,
                    [inner.node_id.clone()],
                );
                session.state = CoordinationState::Connecting;
                session.metadata = metadata.unwrap_or_default();

                let backpressure = Arc::new(BackpressureManager::new(
                    session_id.clone(),
                    inner.backpressure_config.clone(),
                ));
                sessions.insert(
                    session_id.clone(),
                    SessionEntry {
                        session,
                        metrics: SessionMetrics::new(&session_id, now),
                        backpressure: Arc::clone(&backpressure),
                        rejoin_attempts: 0,
                        last_backoff: None,
                        last_sent_heartbeat: None,
                    },
                );
                metrics::set_active_sessions(&inner.node_id, sessions.len());
                Some((session_id, backpressure))
            }
        };

        let Some((session_id, backpressure)) = created else {
            inner.counters.join_rejections.fetch_add(1, Ordering::Relaxed);
            warn!(node_id = %inner.node_id, parent_id, max, "Maximum concurrent sessions reached");
            inner.fire(
                SessionEvent::JoinRejected,
                None,
                json!({ "parent_id": parent_id, "reason": "session_limit" }),
            );
            return Err(CoordinationError::SessionLimit { max });
        };

        backpressure.start();
        inner.counters.sessions_created.fetch_add(1, Ordering::Relaxed);
        inner.counters.sessions_joined.fetch_add(1, Ordering::Relaxed);
        inner.fire(
            SessionEvent::JoinRequest,
            Some(&session_id),
            json!({ "parent_id": parent_id }),
        );
        info!(node_id = %inner.node_id, session_id = %session_id, parent_id, "Requested to join session");
        Ok(session_id)
    }

    /// The parent accepted our join: `Connecting` → `Synchronized`.
    ///
    /// Also resets the session's rejoin attempts.
    pub fn confirm_join(&self, session_id: &str) -> Result<()> {
        let inner = &self.inner;
        {
            let mut sessions = inner.sessions.lock();
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| CoordinationError::SessionNotFound(session_id.to_string()))?;
            let from = entry.session.state;
            if from != CoordinationState::Connecting {
                return Err(CoordinationError::InvalidTransition {
                    from,
                    to: CoordinationState::Synchronized,
                });
            }
            entry.set_state(CoordinationState::Synchronized);
            entry.session.touch();
            entry.metrics.last_heartbeat = entry.session.last_heartbeat;
            entry.rejoin_attempts = 0;
            entry.metrics.rejoin_attempts = 0;
            entry.last_backoff = None;
        }
        inner.fire(SessionEvent::JoinAccepted, Some(session_id), json!({}));
        info!(node_id = %inner.node_id, session_id, "Join accepted");
        Ok(())
    }

    /// Leave a session and release everything it owns.
    pub async fn leave_session(&self, session_id: &str, reason: &str) -> Result<()> {
        let inner = &self.inner;
        {
            let mut sessions = inner.sessions.lock();
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| CoordinationError::SessionNotFound(session_id.to_string()))?;
            entry.set_state(CoordinationState::Disconnected);
        }
        inner.fire(SessionEvent::LeaveRequest, Some(session_id), json!({ "reason": reason }));

        inner.release(session_id).await;
        inner.counters.sessions_left.fetch_add(1, Ordering::Relaxed);
        inner.fire(SessionEvent::LeaveConfirmed, Some(session_id), json!({ "reason": reason }));
        info!(node_id = %inner.node_id, session_id, reason, "Left session");
        Ok(())
    }

    /// Rejoin after a failure or disconnect.
    ///
    /// Waits out the exponential backoff for the next attempt, then counts the
    /// attempt and moves a `Failed`/`Disconnected` session back to
    /// `Connecting`. Returns the attempt number. Fails with
    /// [`CoordinationError::RejoinExhausted`] once `max_rejoin_attempts`
    /// attempts have been made.
    pub async fn request_rejoin(&self, session_id: &str) -> Result<u32> {
        let inner = &self.inner;
        let max_attempts = inner.config.max_rejoin_attempts;

        let delay = {
            let mut sessions = inner.sessions.lock();
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| CoordinationError::SessionNotFound(session_id.to_string()))?;
            if entry.rejoin_attempts >= max_attempts {
                warn!(node_id = %inner.node_id, session_id, attempts = entry.rejoin_attempts, "Maximum rejoin attempts reached");
                return Err(CoordinationError::RejoinExhausted {
                    session_id: session_id.to_string(),
                    attempts: entry.rejoin_attempts,
                });
            }
            let delay = rejoin_backoff(&inner.config, entry.rejoin_attempts, &mut rand::rng());
            entry.last_backoff = Some(delay);
            delay
        };

        if !delay.is_zero() {
            info!(
                node_id = %inner.node_id,
                session_id,
                delay_ms = delay.as_millis() as u64,
                "Waiting before rejoin attempt"
            );
            tokio::time::sleep(delay).await;
        }

        let attempt = {
            let mut sessions = inner.sessions.lock();
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| CoordinationError::SessionNotFound(session_id.to_string()))?;
            // A concurrent rejoin may have used the last attempt while we slept
            if entry.rejoin_attempts >= max_attempts {
                return Err(CoordinationError::RejoinExhausted {
                    session_id: session_id.to_string(),
                    attempts: entry.rejoin_attempts,
                });
            }
            entry.rejoin_attempts += 1;
            entry.metrics.rejoin_attempts = entry.rejoin_attempts;
            if entry.session.state.can_transition_to(CoordinationState::Connecting) {
                entry.set_state(CoordinationState::Connecting);
                entry.session.touch();
                entry.metrics.last_heartbeat = entry.session.last_heartbeat;
            }
            entry.rejoin_attempts
        };

        inner.counters.rejoin_attempts.fetch_add(1, Ordering::Relaxed);
        metrics::record_rejoin_attempt(delay);
        inner.fire(SessionEvent::RejoinRequest, Some(session_id), json!({ "attempt": attempt }));
        info!(node_id = %inner.node_id, session_id, attempt, "Requesting rejoin");
        Ok(attempt)
    }

    /// Record a heartbeat from the parent.
    ///
    /// Lag is measured from the last heartbeat this node built for the
    /// session, if any.
    pub fn handle_heartbeat(&self, session_id: &str, sender_id: &str) -> Result<()> {
        let now = Instant::now();
        let mut sessions = self.inner.sessions.lock();
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| CoordinationError::SessionNotFound(session_id.to_string()))?;

        entry.session.last_heartbeat = now;
        entry.metrics.last_heartbeat = now;
        entry.metrics.heartbeat_count += 1;
        if let Some(sent) = entry.last_sent_heartbeat {
            let lag = now.saturating_duration_since(sent);
            entry.metrics.lag = Some(lag);
            metrics::record_heartbeat_lag(lag);
        }
        metrics::record_heartbeats("received", 1);
        debug!(session_id, sender_id, "Received heartbeat");
        Ok(())
    }

    /// Heartbeat from this node to the session's parent.
    pub fn build_heartbeat(&self, session_id: &str) -> Result<Message> {
        let mut sessions = self.inner.sessions.lock();
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| CoordinationError::SessionNotFound(session_id.to_string()))?;
        entry.last_sent_heartbeat = Some(Instant::now());
        metrics::record_heartbeats("sent", 1);
        Ok(CoordinationProtocol::create_heartbeat_message(
            session_id,
            &self.inner.node_id,
            &entry.session.parent_id,
        )
        .to_message())
    }

    pub fn record_message(&self, session_id: &str) -> bool {
        self.with_metrics(session_id, |m| m.message_count += 1)
    }

    pub fn record_error(&self, session_id: &str, error: &str) -> bool {
        warn!(node_id = %self.inner.node_id, session_id, error, "Error recorded for session");
        self.with_metrics(session_id, |m| m.error_count += 1)
    }

    pub fn record_drop(&self, session_id: &str) -> bool {
        self.with_metrics(session_id, |m| m.drops += 1)
    }

    pub fn record_requeue(&self, session_id: &str) -> bool {
        self.with_metrics(session_id, |m| m.requeues += 1)
    }

    fn with_metrics(&self, session_id: &str, f: impl FnOnce(&mut SessionMetrics)) -> bool {
        match self.inner.sessions.lock().get_mut(session_id) {
            Some(entry) => {
                f(&mut entry.metrics);
                true
            }
            None => false,
        }
    }

    pub fn session(&self, session_id: &str) -> Option<CoordinationSession> {
        self.inner
            .sessions
            .lock()
            .get(session_id)
            .map(|e| e.session.clone())
    }

    pub fn session_state(&self, session_id: &str) -> Option<CoordinationState> {
        self.inner.sessions.lock().get(session_id).map(|e| e.session.state)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.inner.sessions.lock().keys().cloned().collect()
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// The session's backpressure manager.
    pub fn backpressure(&self, session_id: &str) -> Option<Arc<BackpressureManager>> {
        self.inner
            .sessions
            .lock()
            .get(session_id)
            .map(|e| Arc::clone(&e.backpressure))
    }

    /// Delay used before the session's latest rejoin attempt.
    pub fn last_backoff(&self, session_id: &str) -> Option<Duration> {
        self.inner.sessions.lock().get(session_id).and_then(|e| e.last_backoff)
    }

    pub fn session_metrics(&self, session_id: &str) -> Option<SessionMetrics> {
        self.inner
            .sessions
            .lock()
            .get(session_id)
            .map(|e| e.metrics.clone())
    }

    pub fn all_session_metrics(&self) -> HashMap<String, SessionMetrics> {
        self.inner
            .sessions
            .lock()
            .iter()
            .map(|(id, e)| (id.clone(), e.metrics.clone()))
            .collect()
    }

    /// Run one heartbeat-timeout check now. Returns the sessions failed.
    pub fn check_heartbeat_timeouts(&self) -> Vec<String> {
        self.inner.check_heartbeat_timeouts()
    }

    /// Run one TTL sweep now. Returns the number of sessions expired.
    pub async fn cleanup_expired_sessions(&self) -> usize {
        self.inner.cleanup_expired_sessions().await
    }

    pub fn statistics(&self) -> SessionStats {
        let c = &self.inner.counters;
        let sessions = self.inner.sessions.lock();

        let mut session_states = BTreeMap::new();
        let mut total_age = Duration::ZERO;
        for entry in sessions.values() {
            *session_states.entry(entry.session.state).or_insert(0) += 1;
            total_age += entry.session.age();
        }
        let average_session_age = if sessions.is_empty() {
            Duration::ZERO
        } else {
            total_age / sessions.len() as u32
        };

        SessionStats {
            sessions_created: c.sessions_created.load(Ordering::Relaxed),
            sessions_joined: c.sessions_joined.load(Ordering::Relaxed),
            sessions_left: c.sessions_left.load(Ordering::Relaxed),
            sessions_expired: c.sessions_expired.load(Ordering::Relaxed),
            join_rejections: c.join_rejections.load(Ordering::Relaxed),
            rejoin_attempts: c.rejoin_attempts.load(Ordering::Relaxed),
            heartbeat_timeouts: c.heartbeat_timeouts.load(Ordering::Relaxed),
            active_sessions: sessions.len(),
            average_session_age,
            session_states,
        }
    }
}

impl SessionInner {
    fn fire(&self, event: SessionEvent, session_id: Option<&str>, data: Value) {
        metrics::record_session_event(event.as_str());
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            guard_listener("session_event", || listener.on_event(event, session_id, &data));
        }
    }

    /// Drop a session's state and stop its backpressure monitor.
    async fn release(&self, session_id: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock();
            let removed = sessions.remove(session_id);
            metrics::set_active_sessions(&self.node_id, sessions.len());
            removed
        };
        match removed {
            Some(entry) => {
                entry.backpressure.stop().await;
                debug!(session_id, "Cleaned up session");
                true
            }
            None => false,
        }
    }

    fn check_heartbeat_timeouts(&self) -> Vec<String> {
        let timeout = self.config.heartbeat_timeout();
        let timed_out: Vec<(String, Duration)> = {
            let mut sessions = self.sessions.lock();
            sessions
                .iter_mut()
                .filter(|(_, e)| e.session.state.can_transition_to(CoordinationState::Failed))
                .filter_map(|(id, e)| {
                    let silent = e.session.since_heartbeat();
                    (silent > timeout).then(|| {
                        e.set_state(CoordinationState::Failed);
                        (id.clone(), silent)
                    })
                })
                .collect()
        };

        for (session_id, silent) in &timed_out {
            self.counters.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(
                node_id = %self.node_id,
                session_id = %session_id,
                silent_ms = silent.as_millis() as u64,
                "Heartbeat timeout"
            );
            self.fire(
                SessionEvent::HeartbeatTimeout,
                Some(session_id),
                json!({ "silent_ms": silent.as_millis() as u64 }),
            );
        }
        timed_out.into_iter().map(|(id, _)| id).collect()
    }

    async fn cleanup_expired_sessions(&self) -> usize {
        let ttl = self.config.session_ttl_duration();
        let expired: Vec<String> = self
            .sessions
            .lock()
            .iter()
            .filter(|(_, e)| e.session.age() > ttl)
            .map(|(id, _)| id.clone())
            .collect();

        let mut count = 0;
        for session_id in expired {
            self.fire(SessionEvent::SessionExpired, Some(&session_id), json!({}));
            if self.release(&session_id).await {
                count += 1;
                self.counters.sessions_expired.fetch_add(1, Ordering::Relaxed);
                info!(node_id = %self.node_id, session_id = %session_id, "Expired session");
            }
        }
        count
    }
}

impl fmt::Display for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SessionManager(node={}, sessions={})",
            self.inner.node_id,
            self.active_sessions()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::protocol::CoordinationMessageType;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn manager(config: SessionConfig) -> SessionManager {
        SessionManager::with_backpressure_config("child-1", config, BackpressureConfig::for_testing())
    }

    type EventLog = Arc<Mutex<Vec<(SessionEvent, Option<String>)>>>;

    fn record_events(manager: &SessionManager) -> EventLog {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        manager.add_listener(Arc::new(
            move |event: SessionEvent, session_id: Option<&str>, _: &Value| {
                l.lock().push((event, session_id.map(str::to_string)));
            },
        ));
        log
    }

    #[test]
    fn test_rejoin_backoff_growth_and_cap() {
        let config = SessionConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_jitter: 0.0,
            ..SessionConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<_> = (0..6)
            .map(|n| rejoin_backoff(&config, n, &mut rng).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_rejoin_backoff_jitter_bounds() {
        let config = SessionConfig::default();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let d = rejoin_backoff(&config, 1, &mut rng);
            assert!(d >= Duration::from_millis(1_800) && d <= Duration::from_millis(2_200));
        }
    }

    #[tokio::test]
    async fn test_join_creates_session() {
        let manager = manager(SessionConfig::for_testing());
        let events = record_events(&manager);

        let id = manager.request_join("parent", None).await.unwrap();
        assert_eq!(id, "session-child-1-0");

        let session = manager.session(&id).unwrap();
        assert_eq!(session.state, CoordinationState::Connecting);
        assert_eq!(session.parent_id, "parent");
        assert!(session.has_child("child-1"));
        assert!(manager.backpressure(&id).unwrap().is_running());
        assert_eq!(manager.session_metrics(&id).unwrap().heartbeat_count, 0);
        assert_eq!(*events.lock(), vec![(SessionEvent::JoinRequest, Some(id))]);
    }

    #[tokio::test]
    async fn test_session_limit() {
        let config = SessionConfig {
            max_concurrent_sessions: 2,
            ..SessionConfig::for_testing()
        };
        let manager = manager(config);
        let events = record_events(&manager);

        manager.request_join("p1", None).await.unwrap();
        manager.request_join("p2", None).await.unwrap();
        let err = manager.request_join("p3", None).await.unwrap_err();
        assert_eq!(err, CoordinationError::SessionLimit { max: 2 });
        assert_eq!(manager.active_sessions(), 2);
        assert_eq!(events.lock().last(), Some(&(SessionEvent::JoinRejected, None)));

        let stats = manager.statistics();
        assert_eq!(stats.sessions_created, 2);
        assert_eq!(stats.join_rejections, 1);
    }

    #[tokio::test]
    async fn test_session_ids_unique_after_leave() {
        let manager = manager(SessionConfig::for_testing());
        let a = manager.request_join("p", None).await.unwrap();
        manager.leave_session(&a, "done").await.unwrap();
        let b = manager.request_join("p", None).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_confirm_join() {
        let manager = manager(SessionConfig::for_testing());
        let id = manager.request_join("parent", None).await.unwrap();
        manager.confirm_join(&id).unwrap();
        assert_eq!(manager.session_state(&id), Some(CoordinationState::Synchronized));

        let err = manager.confirm_join(&id).unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidTransition { .. }));
        assert!(matches!(
            manager.confirm_join("nope"),
            Err(CoordinationError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_leave_releases_resources() {
        let manager = manager(SessionConfig::for_testing());
        let events = record_events(&manager);
        let id = manager.request_join("parent", None).await.unwrap();
        let bp = manager.backpressure(&id).unwrap();

        manager.leave_session(&id, "voluntary").await.unwrap();
        assert!(manager.session(&id).is_none());
        assert!(manager.session_metrics(&id).is_none());
        assert!(!bp.is_running());
        assert_eq!(manager.statistics().sessions_left, 1);

        let kinds: Vec<_> = events.lock().iter().map(|(e, _)| *e).collect();
        assert_eq!(
            kinds,
            vec![
                SessionEvent::JoinRequest,
                SessionEvent::LeaveRequest,
                SessionEvent::LeaveConfirmed
            ]
        );
        assert!(manager.leave_session(&id, "again").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_attempts_exhausted() {
        let config = SessionConfig {
            max_rejoin_attempts: 3,
            ..SessionConfig::for_testing()
        };
        let manager = manager(config);
        let id = manager.request_join("parent", None).await.unwrap();

        let start = Instant::now();
        for expected in 1..=3 {
            assert_eq!(manager.request_rejoin(&id).await.unwrap(), expected);
        }
        // 10 + 20 + 40 ms of backoff, no jitter
        assert!(start.elapsed() >= Duration::from_millis(70));
        assert_eq!(manager.last_backoff(&id), Some(Duration::from_millis(40)));

        let err = manager.request_rejoin(&id).await.unwrap_err();
        assert_eq!(
            err,
            CoordinationError::RejoinExhausted {
                session_id: id.clone(),
                attempts: 3
            }
        );
        assert_eq!(manager.statistics().rejoin_attempts, 3);
        assert_eq!(manager.session_metrics(&id).unwrap().rejoin_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_then_rejoin() {
        let manager = manager(SessionConfig::for_testing());
        let events = record_events(&manager);
        let id = manager.request_join("parent", None).await.unwrap();
        manager.confirm_join(&id).unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(manager.check_heartbeat_timeouts().is_empty());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(manager.check_heartbeat_timeouts(), vec![id.clone()]);
        assert_eq!(manager.session_state(&id), Some(CoordinationState::Failed));

        // Already failed: not timed out again
        assert!(manager.check_heartbeat_timeouts().is_empty());
        assert_eq!(manager.statistics().heartbeat_timeouts, 1);

        manager.request_rejoin(&id).await.unwrap();
        assert_eq!(manager.session_state(&id), Some(CoordinationState::Connecting));
        assert!(manager.check_heartbeat_timeouts().is_empty());

        let kinds: Vec<_> = events.lock().iter().map(|(e, _)| *e).collect();
        assert!(kinds.contains(&SessionEvent::HeartbeatTimeout));
        assert_eq!(kinds.last(), Some(&SessionEvent::RejoinRequest));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_lag() {
        let manager = manager(SessionConfig::for_testing());
        let id = manager.request_join("parent", None).await.unwrap();

        manager.handle_heartbeat(&id, "parent").unwrap();
        assert_eq!(manager.session_metrics(&id).unwrap().lag, None);

        let hb = manager.build_heartbeat(&id).unwrap();
        assert_eq!(hb.recipient_id.as_deref(), Some("parent"));
        assert_eq!(hb.session_id(), Some(id.as_str()));
        assert_eq!(
            hb.coordination_type(),
            Some(CoordinationMessageType::Heartbeat.wire_name())
        );

        tokio::time::advance(Duration::from_millis(30)).await;
        manager.handle_heartbeat(&id, "parent").unwrap();
        let metrics = manager.session_metrics(&id).unwrap();
        assert_eq!(metrics.heartbeat_count, 2);
        assert_eq!(metrics.lag, Some(Duration::from_millis(30)));

        assert!(manager.handle_heartbeat("unknown", "parent").is_err());
    }

    #[tokio::test]
    async fn test_counters() {
        let manager = manager(SessionConfig::for_testing());
        let id = manager.request_join("parent", None).await.unwrap();
        assert!(manager.record_message(&id));
        assert!(manager.record_message(&id));
        assert!(manager.record_error(&id, "bad payload"));
        assert!(manager.record_drop(&id));
        assert!(manager.record_requeue(&id));
        assert!(!manager.record_message("unknown"));

        let m = manager.session_metrics(&id).unwrap();
        assert_eq!((m.message_count, m.error_count, m.drops, m.requeues), (2, 1, 1, 1));
        assert_eq!(manager.all_session_metrics().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_cleanup() {
        let manager = manager(SessionConfig::for_testing());
        let events = record_events(&manager);
        let old = manager.request_join("parent", None).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        let young = manager.request_join("parent", None).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(manager.cleanup_expired_sessions().await, 1);
        assert!(manager.session(&old).is_none());
        assert!(manager.session(&young).is_some());
        assert_eq!(manager.statistics().sessions_expired, 1);
        assert!(events
            .lock()
            .contains(&(SessionEvent::SessionExpired, Some(old))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_statistics_histogram() {
        let manager = manager(SessionConfig::for_testing());
        let a = manager.request_join("p", None).await.unwrap();
        manager.request_join("p", None).await.unwrap();
        manager.confirm_join(&a).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let stats = manager.statistics();
        assert_eq!(stats.active_sessions, 2);
        assert_eq!(stats.session_states[&CoordinationState::Synchronized], 1);
        assert_eq!(stats.session_states[&CoordinationState::Connecting], 1);
        assert!(stats.average_session_age >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loops() {
        let manager = manager(SessionConfig::for_testing());
        let id = manager.request_join("parent", None).await.unwrap();
        manager.start();
        manager.start();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.session_state(&id), Some(CoordinationState::Failed));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(manager.session(&id).is_none());

        manager.stop().await;
        manager.stop().await;
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_panicking_listener_contained() {
        let manager = manager(SessionConfig::for_testing());
        manager.add_listener(Arc::new(|_: SessionEvent, _: Option<&str>, _: &Value| {
            panic!("listener bug")
        }));
        assert!(manager.request_join("parent", None).await.is_ok());
    }
}
