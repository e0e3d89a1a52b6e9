//! Queue-watermark flow control for one coordination session.
//!
//! A [`BackpressureManager`] watches a set of named queues through
//! [`QueueDepth`] probes. Every monitor tick it recomputes each queue's
//! utilization and enqueue/dequeue rates, takes the maximum utilization
//! across queues and maps it to a [`BackpressureState`]:
//!
//! ```text
//!  utilization  0 ─────── resume ─── warning ─────── pause ── critical ── 1
//!  rising          NORMAL              │   WARNING     │ PAUSED  │ CRITICAL
//!  falling from    NORMAL  │          WARNING (latched)          │
//!  PAUSED/CRIT.            └─ unlatch at <= resume
//! ```
//!
//! Reaching PAUSED or CRITICAL latches the manager. While latched it reports
//! at least WARNING until utilization falls to the resume threshold, so a
//! queue hovering around the pause watermark does not flap.
//!
//! PAUSE/RESUME are also exchanged between peers as protocol messages (see
//! [`create_pause_message`](BackpressureManager::create_pause_message)).
//! Receiving one flips [`is_paused`](BackpressureManager::is_paused), which
//! refuses enqueues until the matching RESUME arrives.

use crate::config::BackpressureConfig;
use crate::lifecycle::{guard_listener, shutdown_signalled, TaskSet};
use crate::message::{
    Message, MessagePriority, MessageType, META_BACKPRESSURE_SIGNAL, META_SESSION_ID,
};
use crate::metrics;
use crate::resilience::RateWindow;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

/// Payload action of a PAUSE signal.
pub const ACTION_PAUSE: &str = "PAUSE";
/// Payload action of a RESUME signal.
pub const ACTION_RESUME: &str = "RESUME";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackpressureState {
    #[default]
    Normal,
    Warning,
    Paused,
    Critical,
}

impl BackpressureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackpressureState::Normal => "normal",
            BackpressureState::Warning => "warning",
            BackpressureState::Paused => "paused",
            BackpressureState::Critical => "critical",
        }
    }

    /// Paused or critical: the peer feeding this session should be told to stop.
    pub fn blocks_enqueue(&self) -> bool {
        matches!(self, BackpressureState::Paused | BackpressureState::Critical)
    }
}

impl fmt::Display for BackpressureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Next state for `utilization`, given whether the manager is latched.
///
/// Returns the new state and the new latch flag.
pub fn next_state(
    config: &BackpressureConfig,
    latched: bool,
    utilization: f64,
) -> (BackpressureState, bool) {
    if utilization >= config.critical_threshold {
        return (BackpressureState::Critical, true);
    }
    if utilization >= config.pause_threshold {
        return (BackpressureState::Paused, true);
    }
    if latched && utilization > config.resume_threshold {
        return (BackpressureState::Warning, true);
    }
    if utilization >= config.warning_threshold {
        (BackpressureState::Warning, false)
    } else {
        (BackpressureState::Normal, false)
    }
}

// =============================================================================
// Queue probes
// =============================================================================

/// Current depth of a monitored queue.
pub trait QueueDepth: Send + Sync {
    fn depth(&self) -> usize;
}

impl<T: Send> QueueDepth for mpsc::Sender<T> {
    fn depth(&self) -> usize {
        self.max_capacity().saturating_sub(self.capacity())
    }
}

/// A depth counter shared with the queue's owner.
#[derive(Debug, Clone, Default)]
pub struct SharedDepth(Arc<AtomicUsize>);

impl SharedDepth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| Some(d.saturating_sub(1)));
    }

    pub fn set(&self, depth: usize) {
        self.0.store(depth, Ordering::Release);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

impl QueueDepth for SharedDepth {
    fn depth(&self) -> usize {
        self.get()
    }
}

/// Snapshot of one monitored queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMetrics {
    pub queue_size: usize,
    pub max_size: usize,
    /// `queue_size / max_size`, 0 when `max_size` is 0.
    pub utilization: f64,
    pub enqueue_rate: f64,
    pub dequeue_rate: f64,
}

/// Observer for backpressure events.
///
/// All methods default to no-ops.
pub trait BackpressureListener: Send + Sync {
    fn on_state_change(&self, _session_id: &str, _old: BackpressureState, _new: BackpressureState) {}
    fn on_pause(&self, _signal: &Message) {}
    fn on_resume(&self, _signal: &Message) {}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackpressureStats {
    pub state_changes: u64,
    pub pause_events: u64,
    pub resume_events: u64,
    pub rate_limit_hits: u64,
    pub refused_enqueues: u64,
}

/// Full manager snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct BackpressureMetrics {
    pub session_id: String,
    pub state: BackpressureState,
    pub is_paused: bool,
    pub max_utilization: f64,
    pub queues: HashMap<String, QueueMetrics>,
    pub stats: BackpressureStats,
}

// =============================================================================
// Manager
// =============================================================================

struct MonitoredQueue {
    probe: Arc<dyn QueueDepth>,
    max_size: usize,
    enqueues: RateWindow,
    dequeues: RateWindow,
    last: QueueMetrics,
}

impl MonitoredQueue {
    fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            self.probe.depth() as f64 / self.max_size as f64
        }
    }

    fn refresh(&mut self) -> &QueueMetrics {
        let queue_size = self.probe.depth();
        self.last = QueueMetrics {
            queue_size,
            max_size: self.max_size,
            utilization: self.utilization(),
            enqueue_rate: self.enqueues.rate(),
            dequeue_rate: self.dequeues.rate(),
        };
        &self.last
    }
}

struct MonitorState {
    current: BackpressureState,
    latched: bool,
    max_utilization: f64,
    queues: HashMap<String, MonitoredQueue>,
    /// Session-wide enqueues, for the rate limit.
    enqueues: RateWindow,
}

#[derive(Default)]
struct Counters {
    state_changes: AtomicU64,
    pause_events: AtomicU64,
    resume_events: AtomicU64,
    rate_limit_hits: AtomicU64,
    refused_enqueues: AtomicU64,
}

struct BackpressureInner {
    session_id: String,
    config: BackpressureConfig,
    state: Mutex<MonitorState>,
    paused: AtomicBool,
    listeners: RwLock<Vec<Arc<dyn BackpressureListener>>>,
    counters: Counters,
}

/// Per-session backpressure controller.
pub struct BackpressureManager {
    inner: Arc<BackpressureInner>,
    tasks: TaskSet,
}

impl BackpressureManager {
    pub fn new(session_id: impl Into<String>, config: BackpressureConfig) -> Self {
        let state = MonitorState {
            current: BackpressureState::Normal,
            latched: false,
            max_utilization: 0.0,
            queues: HashMap::new(),
            enqueues: RateWindow::new(config.rate_window()),
        };
        Self {
            inner: Arc::new(BackpressureInner {
                session_id: session_id.into(),
                config,
                state: Mutex::new(state),
                paused: AtomicBool::new(false),
                listeners: RwLock::new(Vec::new()),
                counters: Counters::default(),
            }),
            tasks: TaskSet::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.inner.config
    }

    /// Spawn the monitor loop. No-op if already running.
    pub fn start(&self) {
        let Some(mut shutdown_rx) = self.tasks.begin() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let span = info_span!("backpressure_monitor", session_id = %inner.session_id);
        self.tasks.push(tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(inner.config.check_interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_signalled(&mut shutdown_rx) => break,
                        _ = ticker.tick() => {
                            inner.evaluate();
                        }
                    }
                }
                debug!("Backpressure monitor exiting");
            }
            .instrument(span),
        ));
        info!(session_id = %self.inner.session_id, "Backpressure manager started");
    }

    /// Stop the monitor loop. Idempotent.
    pub async fn stop(&self) {
        if self.tasks.stop("backpressure").await {
            info!(session_id = %self.inner.session_id, "Backpressure manager stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.tasks.is_running()
    }

    /// Watch a queue. Re-registering a name replaces its probe.
    pub fn register_queue(&self, name: impl Into<String>, probe: Arc<dyn QueueDepth>, max_size: usize) {
        let name = name.into();
        let window = self.inner.config.rate_window();
        let mut queue = MonitoredQueue {
            probe,
            max_size,
            enqueues: RateWindow::new(window),
            dequeues: RateWindow::new(window),
            last: QueueMetrics {
                queue_size: 0,
                max_size,
                utilization: 0.0,
                enqueue_rate: 0.0,
                dequeue_rate: 0.0,
            },
        };
        queue.refresh();
        debug!(session_id = %self.inner.session_id, queue = %name, max_size, "Registered queue");
        self.inner.state.lock().queues.insert(name, queue);
    }

    pub fn unregister_queue(&self, name: &str) -> bool {
        let removed = self.inner.state.lock().queues.remove(name).is_some();
        if removed {
            debug!(session_id = %self.inner.session_id, queue = name, "Unregistered queue");
        }
        removed
    }

    pub fn add_listener(&self, listener: Arc<dyn BackpressureListener>) {
        self.inner.listeners.write().push(listener);
    }

    pub fn current_state(&self) -> BackpressureState {
        self.inner.state.lock().current
    }

    /// True while a remote PAUSE is in effect.
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Run one monitor tick now. Returns the resulting state.
    pub fn evaluate(&self) -> BackpressureState {
        self.inner.evaluate()
    }

    /// Whether a producer may enqueue onto `queue` right now.
    ///
    /// Refused while a remote PAUSE is in effect, when the session's enqueue
    /// rate is above the limit, or when the queue itself is at the critical
    /// watermark. Every refusal is counted.
    ///
    /// The local state alone never refuses: a PAUSED session signals its peer
    /// with [`create_pause_message`](Self::create_pause_message) instead.
    pub fn check_enqueue_allowed(&self, queue: &str) -> bool {
        let inner = &self.inner;
        let refusal = {
            let mut state = inner.state.lock();
            if self.is_paused() {
                Some("paused")
            } else if state.enqueues.rate() > inner.config.max_enqueue_rate {
                inner.counters.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
                Some("rate_limited")
            } else if state
                .queues
                .get(queue)
                .is_some_and(|q| q.utilization() >= inner.config.critical_threshold)
            {
                Some("queue_critical")
            } else {
                None
            }
        };

        match refusal {
            Some(reason) => {
                inner.counters.refused_enqueues.fetch_add(1, Ordering::Relaxed);
                metrics::record_enqueue_refused(reason);
                debug!(session_id = %inner.session_id, queue, reason, "Enqueue refused");
                false
            }
            None => true,
        }
    }

    pub fn record_enqueue(&self, queue: &str) {
        let mut state = self.inner.state.lock();
        state.enqueues.record();
        if let Some(q) = state.queues.get_mut(queue) {
            q.enqueues.record();
        }
    }

    pub fn record_dequeue(&self, queue: &str) {
        if let Some(q) = self.inner.state.lock().queues.get_mut(queue) {
            q.dequeues.record();
        }
    }

    /// PAUSE signal from `sender_id` to `recipient_id`.
    pub fn create_pause_message(&self, sender_id: &str, recipient_id: &str) -> Message {
        self.signal_message(sender_id, recipient_id, ACTION_PAUSE, "backpressure")
    }

    /// RESUME signal from `sender_id` to `recipient_id`.
    pub fn create_resume_message(&self, sender_id: &str, recipient_id: &str) -> Message {
        self.signal_message(sender_id, recipient_id, ACTION_RESUME, "backpressure_relieved")
    }

    fn signal_message(&self, sender_id: &str, recipient_id: &str, action: &str, reason: &str) -> Message {
        Message::new(
            MessageType::Command,
            sender_id,
            json!({ "action": action, "reason": reason }),
        )
        .to(recipient_id)
        .with_priority(MessagePriority::High)
        .with_metadata(META_BACKPRESSURE_SIGNAL, true)
        .with_metadata(META_SESSION_ID, self.inner.session_id.as_str())
        .with_metadata("state", self.current_state().as_str())
    }

    /// Apply an incoming PAUSE/RESUME signal.
    ///
    /// Returns `true` if the message was a backpressure signal. Messages
    /// without the signal marker are ignored.
    pub fn handle_backpressure_message(&self, message: &Message) -> bool {
        if !message.metadata_flag(META_BACKPRESSURE_SIGNAL) {
            return false;
        }

        let inner = &self.inner;
        match message.payload.get("action").and_then(Value::as_str) {
            Some(ACTION_PAUSE) => {
                if !inner.paused.swap(true, Ordering::AcqRel) {
                    inner.counters.pause_events.fetch_add(1, Ordering::Relaxed);
                    metrics::record_backpressure_signal("pause");
                    info!(session_id = %inner.session_id, sender = %message.sender_id, "Received PAUSE signal");
                    for listener in inner.listeners_snapshot() {
                        guard_listener("backpressure_pause", || listener.on_pause(message));
                    }
                }
                true
            }
            Some(ACTION_RESUME) => {
                if inner.paused.swap(false, Ordering::AcqRel) {
                    inner.counters.resume_events.fetch_add(1, Ordering::Relaxed);
                    metrics::record_backpressure_signal("resume");
                    info!(session_id = %inner.session_id, sender = %message.sender_id, "Received RESUME signal");
                    for listener in inner.listeners_snapshot() {
                        guard_listener("backpressure_resume", || listener.on_resume(message));
                    }
                }
                true
            }
            other => {
                warn!(session_id = %inner.session_id, action = ?other, "Unknown backpressure action");
                false
            }
        }
    }

    pub fn stats(&self) -> BackpressureStats {
        self.inner.stats()
    }

    /// Snapshot as of the last monitor tick.
    pub fn metrics(&self) -> BackpressureMetrics {
        let state = self.inner.state.lock();
        BackpressureMetrics {
            session_id: self.inner.session_id.clone(),
            state: state.current,
            is_paused: self.is_paused(),
            max_utilization: state.max_utilization,
            queues: state
                .queues
                .iter()
                .map(|(name, q)| (name.clone(), q.last.clone()))
                .collect(),
            stats: self.inner.stats(),
        }
    }
}

impl BackpressureInner {
    fn listeners_snapshot(&self) -> Vec<Arc<dyn BackpressureListener>> {
        self.listeners.read().clone()
    }

    fn stats(&self) -> BackpressureStats {
        let c = &self.counters;
        BackpressureStats {
            state_changes: c.state_changes.load(Ordering::Relaxed),
            pause_events: c.pause_events.load(Ordering::Relaxed),
            resume_events: c.resume_events.load(Ordering::Relaxed),
            rate_limit_hits: c.rate_limit_hits.load(Ordering::Relaxed),
            refused_enqueues: c.refused_enqueues.load(Ordering::Relaxed),
        }
    }

    fn evaluate(&self) -> BackpressureState {
        let (old, new) = {
            let mut state = self.state.lock();
            let max_utilization = state
                .queues
                .values_mut()
                .map(|q| q.refresh().utilization)
                .fold(0.0_f64, f64::max);
            state.enqueues.count();
            state.max_utilization = max_utilization;

            let (new, latched) = next_state(&self.config, state.latched, max_utilization);
            let old = state.current;
            state.current = new;
            state.latched = latched;
            (old, new)
        };

        if old != new {
            self.counters.state_changes.fetch_add(1, Ordering::Relaxed);
            metrics::record_backpressure_state(&self.session_id, new.as_str());
            info!(session_id = %self.session_id, from = %old, to = %new, "Backpressure state transition");
            for listener in self.listeners_snapshot() {
                guard_listener("backpressure_state", || {
                    listener.on_state_change(&self.session_id, old, new)
                });
            }
        }
        new
    }
}

impl fmt::Display for BackpressureManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BackpressureManager(session={}, state={})",
            self.inner.session_id,
            self.current_state()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager() -> (BackpressureManager, SharedDepth) {
        let manager = BackpressureManager::new("s-1", BackpressureConfig::for_testing());
        let depth = SharedDepth::new();
        manager.register_queue("inbox", Arc::new(depth.clone()), 100);
        (manager, depth)
    }

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<(BackpressureState, BackpressureState)>>,
        pauses: AtomicU64,
        resumes: AtomicU64,
    }

    impl BackpressureListener for Recorder {
        fn on_state_change(&self, _session_id: &str, old: BackpressureState, new: BackpressureState) {
            self.changes.lock().push((old, new));
        }
        fn on_pause(&self, _signal: &Message) {
            self.pauses.fetch_add(1, Ordering::Relaxed);
        }
        fn on_resume(&self, _signal: &Message) {
            self.resumes.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_next_state_hysteresis() {
        let config = BackpressureConfig::default();
        let mut latched = false;
        let mut feed = |u: f64| {
            let (state, l) = next_state(&config, latched, u);
            latched = l;
            state
        };
        assert_eq!(feed(0.8), BackpressureState::Warning);
        assert_eq!(feed(0.95), BackpressureState::Critical);
        assert_eq!(feed(0.96), BackpressureState::Critical);
        assert_eq!(feed(0.6), BackpressureState::Warning);
        assert_eq!(feed(0.4), BackpressureState::Normal);
        // Unlatched again: 0.6 is plain normal
        assert_eq!(feed(0.6), BackpressureState::Normal);
    }

    #[test]
    fn test_paused_holds_warning_until_resume() {
        let config = BackpressureConfig::default();
        let (state, latched) = next_state(&config, false, 0.92);
        assert_eq!(state, BackpressureState::Paused);
        let (state, latched) = next_state(&config, latched, 0.85);
        assert_eq!(state, BackpressureState::Warning);
        let (state, latched) = next_state(&config, latched, 0.55);
        assert_eq!(state, BackpressureState::Warning);
        let (state, _) = next_state(&config, latched, 0.5);
        assert_eq!(state, BackpressureState::Normal);
    }

    #[test]
    fn test_evaluate_uses_max_queue() {
        let (manager, inbox) = manager();
        let outbox = SharedDepth::new();
        manager.register_queue("outbox", Arc::new(outbox.clone()), 10);

        inbox.set(10);
        outbox.set(8);
        assert_eq!(manager.evaluate(), BackpressureState::Warning);

        let metrics = manager.metrics();
        assert!((metrics.max_utilization - 0.8).abs() < 1e-9);
        assert_eq!(metrics.queues["outbox"].queue_size, 8);
        assert!((metrics.queues["inbox"].utilization - 0.1).abs() < 1e-9);

        assert!(manager.unregister_queue("outbox"));
        assert_eq!(manager.evaluate(), BackpressureState::Normal);
        assert_eq!(manager.stats().state_changes, 2);
    }

    #[test]
    fn test_state_listener_fired_on_change_only() {
        let (manager, depth) = manager();
        let recorder = Arc::new(Recorder::default());
        manager.add_listener(recorder.clone());

        depth.set(75);
        manager.evaluate();
        manager.evaluate();
        depth.set(96);
        manager.evaluate();

        assert_eq!(
            *recorder.changes.lock(),
            vec![
                (BackpressureState::Normal, BackpressureState::Warning),
                (BackpressureState::Warning, BackpressureState::Critical),
            ]
        );
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        struct Bad;
        impl BackpressureListener for Bad {
            fn on_state_change(&self, _: &str, _: BackpressureState, _: BackpressureState) {
                panic!("listener bug");
            }
        }
        let (manager, depth) = manager();
        manager.add_listener(Arc::new(Bad));
        depth.set(91);
        assert_eq!(manager.evaluate(), BackpressureState::Paused);
        assert_eq!(manager.current_state(), BackpressureState::Paused);
    }

    #[test]
    fn test_local_pause_does_not_refuse_enqueue() {
        let (manager, depth) = manager();
        let outbox = SharedDepth::new();
        manager.register_queue("outbox", Arc::new(outbox.clone()), 100);
        outbox.set(91);
        depth.set(92);
        assert_eq!(manager.evaluate(), BackpressureState::Paused);

        // Both queues are below critical and no PAUSE has arrived
        assert!(manager.check_enqueue_allowed("inbox"));
        assert!(manager.check_enqueue_allowed("outbox"));
        assert_eq!(manager.stats().refused_enqueues, 0);

        depth.set(95);
        assert_eq!(manager.evaluate(), BackpressureState::Critical);
        assert!(!manager.check_enqueue_allowed("inbox"));
        assert!(manager.check_enqueue_allowed("outbox"));
        assert_eq!(manager.stats().refused_enqueues, 1);
    }

    #[test]
    fn test_enqueue_refused_at_critical_queue_between_ticks() {
        let (manager, depth) = manager();
        depth.set(97);
        // No tick yet: state still normal, but the queue itself is critical
        assert_eq!(manager.current_state(), BackpressureState::Normal);
        assert!(!manager.check_enqueue_allowed("inbox"));
        // Unknown queues are only subject to the session-wide checks
        assert!(manager.check_enqueue_allowed("other"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit() {
        let config = BackpressureConfig {
            max_enqueue_rate: 5.0,
            ..BackpressureConfig::for_testing()
        };
        let manager = BackpressureManager::new("s-1", config);
        for _ in 0..5 {
            assert!(manager.check_enqueue_allowed("q"));
            manager.record_enqueue("q");
        }
        // 5/s is at the limit, not above it
        assert!(manager.check_enqueue_allowed("q"));
        manager.record_enqueue("q");
        assert!(!manager.check_enqueue_allowed("q"));
        assert_eq!(manager.stats().rate_limit_hits, 1);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(manager.check_enqueue_allowed("q"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_rates_reported() {
        let (manager, _depth) = manager();
        for _ in 0..4 {
            manager.record_enqueue("inbox");
        }
        manager.record_dequeue("inbox");
        manager.evaluate();
        let q = &manager.metrics().queues["inbox"];
        assert_eq!(q.enqueue_rate, 4.0);
        assert_eq!(q.dequeue_rate, 1.0);
    }

    #[test]
    fn test_pause_resume_signals() {
        let (manager, _depth) = manager();
        let recorder = Arc::new(Recorder::default());
        manager.add_listener(recorder.clone());

        let pause = manager.create_pause_message("parent", "child");
        assert_eq!(pause.priority, MessagePriority::High);
        assert_eq!(pause.payload["action"], "PAUSE");
        assert_eq!(pause.payload["reason"], "backpressure");
        assert!(pause.metadata_flag(META_BACKPRESSURE_SIGNAL));
        assert_eq!(pause.session_id(), Some("s-1"));
        assert_eq!(pause.metadata_str("state"), Some("normal"));

        assert!(manager.handle_backpressure_message(&pause));
        assert!(manager.is_paused());
        assert!(!manager.check_enqueue_allowed("inbox"));
        // Repeated PAUSE is not a new event
        manager.handle_backpressure_message(&pause);
        assert_eq!(recorder.pauses.load(Ordering::Relaxed), 1);

        let resume = manager.create_resume_message("parent", "child");
        assert_eq!(resume.payload["reason"], "backpressure_relieved");
        assert!(manager.handle_backpressure_message(&resume));
        assert!(!manager.is_paused());
        assert_eq!(recorder.resumes.load(Ordering::Relaxed), 1);

        let stats = manager.stats();
        assert_eq!((stats.pause_events, stats.resume_events), (1, 1));
    }

    #[test]
    fn test_unrelated_messages_ignored() {
        let (manager, _depth) = manager();
        let plain = Message::new(MessageType::Command, "p", json!({"action": "PAUSE"}));
        assert!(!manager.handle_backpressure_message(&plain));
        assert!(!manager.is_paused());

        let odd = plain.with_metadata(META_BACKPRESSURE_SIGNAL, true);
        let odd = Message {
            payload: json!({"action": "SLOW_DOWN"}),
            ..odd
        };
        assert!(!manager.handle_backpressure_message(&odd));
    }

    #[tokio::test]
    async fn test_mpsc_sender_depth() {
        let (tx, mut rx) = mpsc::channel::<u32>(4);
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        assert_eq!(tx.depth(), 2);
        rx.recv().await.unwrap();
        assert_eq!(tx.depth(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_loop_tracks_depth() {
        let (manager, depth) = manager();
        manager.start();
        manager.start();
        depth.set(80);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(manager.current_state(), BackpressureState::Warning);

        manager.stop().await;
        manager.stop().await;
        assert!(!manager.is_running());
    }
}
