//! Reliable delivery over a best-effort transport.
//!
//! The router wraps a [`Transport`] with three reliability levels:
//!
//! | Level | Retries | Delivered when |
//! |-------|---------|----------------|
//! | `BestEffort` | never | the transport accepts the send |
//! | `AtLeastOnce` | per policy | an acknowledgment arrives |
//! | `ExactlyOnce` | per policy | an acknowledgment arrives (receiver dedups) |
//!
//! # Architecture
//!
//! ```text
//!  send_reliable_message ──► Bulkhead ──full──► backlog ─┐
//!                               │                        │ Drain
//!                               ▼                        ▼
//!                           attempt() ◄──── Retry ◄── scheduler task
//!                               │                   (binary heap of due
//!              accepted ────────┼────── refused      times, fed by mpsc)
//!                │              │          │
//!      AckTimeout scheduled     │    backoff → Retry scheduled
//!                ▼              │          or FAILED
//!        ack ──► DELIVERED      │
//! ```
//!
//! Each in-flight message holds one bulkhead permit from its first attempt
//! until its terminal outcome, including while it waits out a backoff.
//! Sends beyond `max_inflight_messages` wait in the backlog and are started
//! as permits free up.
//!
//! Retries, acknowledgment timeouts and backlog draining are processed by
//! the scheduler task, so [`start()`](ReliableMessageRouter::start) must be
//! called for anything beyond a first attempt to happen.

use super::dedup::DedupCache;
use super::delivery::{DeliveryStats, DeliveryStatus, DeliveryTracker};
use super::retry::RetryPolicy;
use crate::config::{DeliveryConfig, RouterConfig};
use crate::error::{CoordinationError, Result};
use crate::lifecycle::{shutdown_signalled, TaskSet};
use crate::message::{Message, META_RELIABILITY};
use crate::metrics;
use crate::resilience::Bulkhead;
use crate::transport::Transport;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Delivery guarantee requested for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReliabilityLevel {
    /// One attempt, no acknowledgment.
    BestEffort,
    /// Retry until acknowledged or the policy is exhausted.
    #[default]
    AtLeastOnce,
    /// At-least-once plus receiver-side deduplication.
    ExactlyOnce,
}

impl ReliabilityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReliabilityLevel::BestEffort => "best_effort",
            ReliabilityLevel::AtLeastOnce => "at_least_once",
            ReliabilityLevel::ExactlyOnce => "exactly_once",
        }
    }

    /// Parse the metadata form written by [`as_str`](Self::as_str).
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "best_effort" => Some(ReliabilityLevel::BestEffort),
            "at_least_once" => Some(ReliabilityLevel::AtLeastOnce),
            "exactly_once" => Some(ReliabilityLevel::ExactlyOnce),
            _ => None,
        }
    }

    pub fn awaits_ack(&self) -> bool {
        !matches!(self, ReliabilityLevel::BestEffort)
    }
}

impl fmt::Display for ReliabilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message bound to its reliability contract.
#[derive(Debug, Clone)]
pub struct ReliableMessage {
    pub message: Message,
    pub level: ReliabilityLevel,
    pub policy: RetryPolicy,
    /// Attempts made so far. Never exceeds `policy.max_attempts`.
    pub attempt_count: u32,
    /// Set while waiting out a backoff.
    pub next_retry_at: Option<Instant>,
    pub deadline: Option<Instant>,
    pub tracking_id: String,
}

impl ReliableMessage {
    pub fn new(message: Message, level: ReliabilityLevel, policy: RetryPolicy) -> Self {
        let tracking_id = format!("reliable-{}", message.id);
        Self {
            message,
            level,
            policy,
            attempt_count: 0,
            next_retry_at: None,
            deadline: None,
            tracking_id,
        }
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn is_past_deadline(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

/// Terminal outcome of one reliable send, published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryEvent {
    pub tracking_id: String,
    pub message_id: String,
    pub recipient_id: Option<String>,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub reason: Option<String>,
}

/// What the receive path did with an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// New message; hand it to the application.
    Accepted,
    /// Already seen (exactly-once); re-acknowledged, not surfaced.
    Duplicate,
    /// An acknowledgment for one of our sends.
    Acknowledgment,
}

/// Router statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub messages_failed: u64,
    pub messages_expired: u64,
    pub retries_attempted: u64,
    pub duplicates_detected: u64,
    pub inflight_limit_hits: u64,
    pub acks_received: u64,
    /// Messages holding an inflight permit.
    pub inflight: usize,
    /// In-flight messages currently waiting out a backoff.
    pub retry_queue_depth: usize,
    /// Sends waiting for an inflight permit.
    pub queued: usize,
}

#[derive(Default)]
struct RouterCounters {
    sent: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
    retries: AtomicU64,
    duplicates: AtomicU64,
    inflight_limit_hits: AtomicU64,
    acks: AtomicU64,
}

struct PendingDelivery {
    reliable: ReliableMessage,
    permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
enum ScheduledKind {
    Retry { message_id: String },
    AckTimeout { message_id: String, attempt: u32 },
    Drain,
}

#[derive(Debug)]
struct ScheduledEntry {
    due: Instant,
    seq: u64,
    kind: ScheduledKind,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// Retry schedule, kept across scheduler runs so a restart resumes it.
struct SchedulerState {
    rx: mpsc::UnboundedReceiver<ScheduledEntry>,
    heap: BinaryHeap<Reverse<ScheduledEntry>>,
}

struct RouterInner<T: Transport> {
    node_id: String,
    transport: T,
    config: RouterConfig,
    record_max_age: Duration,
    tracker: Mutex<DeliveryTracker>,
    dedup: Mutex<DedupCache>,
    bulkhead: Bulkhead,
    /// In-flight messages by message id.
    pending: DashMap<String, PendingDelivery>,
    backlog: Mutex<VecDeque<ReliableMessage>>,
    schedule_tx: mpsc::UnboundedSender<ScheduledEntry>,
    scheduler: tokio::sync::Mutex<SchedulerState>,
    schedule_seq: AtomicU64,
    events: broadcast::Sender<DeliveryEvent>,
    counters: RouterCounters,
    closed: AtomicBool,
}

/// Reliable-delivery layer over a best-effort [`Transport`].
pub struct ReliableMessageRouter<T: Transport> {
    inner: Arc<RouterInner<T>>,
    tasks: TaskSet,
}

impl<T: Transport> ReliableMessageRouter<T> {
    pub fn new(node_id: impl Into<String>, transport: T, config: RouterConfig) -> Self {
        Self::with_delivery_config(node_id, transport, config, &DeliveryConfig::default())
    }

    pub fn with_delivery_config(
        node_id: impl Into<String>,
        transport: T,
        config: RouterConfig,
        delivery: &DeliveryConfig,
    ) -> Self {
        let (schedule_tx, schedule_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(1024);
        let inner = RouterInner {
            node_id: node_id.into(),
            transport,
            record_max_age: delivery.record_max_age(),
            tracker: Mutex::new(DeliveryTracker::new(delivery)),
            dedup: Mutex::new(DedupCache::new(config.dedup_capacity, config.dedup_window())),
            bulkhead: Bulkhead::new(config.max_inflight_messages),
            pending: DashMap::new(),
            backlog: Mutex::new(VecDeque::new()),
            schedule_tx,
            scheduler: tokio::sync::Mutex::new(SchedulerState {
                rx: schedule_rx,
                heap: BinaryHeap::new(),
            }),
            schedule_seq: AtomicU64::new(0),
            events,
            counters: RouterCounters::default(),
            closed: AtomicBool::new(false),
            config,
        };
        Self {
            inner: Arc::new(inner),
            tasks: TaskSet::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn is_running(&self) -> bool {
        self.tasks.is_running()
    }

    /// Spawn the scheduler task. No-op if already running.
    pub fn start(&self) {
        let Some(shutdown_rx) = self.tasks.begin() else {
            return;
        };
        self.inner.closed.store(false, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        let span = info_span!("router_scheduler", node_id = %inner.node_id);
        self.tasks
            .push(tokio::spawn(run_scheduler(inner, shutdown_rx).instrument(span)));
        info!(
            node_id = %self.inner.node_id,
            max_inflight = self.inner.config.max_inflight_messages,
            "Reliable message router started"
        );
    }

    /// Stop the scheduler and refuse new sends. Idempotent.
    ///
    /// Messages still in flight keep their records as PENDING and their
    /// inflight permits. Their retries and acknowledgment timeouts stay
    /// scheduled and run, late, once [`start()`](Self::start) is called again.
    pub async fn stop(&self) {
        self.inner.closed.store(true, Ordering::Release);
        if self.tasks.stop("router").await {
            info!(
                node_id = %self.inner.node_id,
                inflight = self.inner.pending.len(),
                "Reliable message router stopped"
            );
        }
    }

    /// Send `message` with the given guarantee.
    ///
    /// Returns the tracking id. Transport failures never surface here: they
    /// are retried per policy and end as a FAILED delivery record. Fails after
    /// [`stop()`](Self::stop), and with `Config` for a policy that allows no
    /// attempts.
    pub async fn send_reliable_message(
        &self,
        message: Message,
        level: ReliabilityLevel,
        policy: Option<RetryPolicy>,
        deadline: Option<Duration>,
    ) -> Result<String> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(CoordinationError::Shutdown);
        }

        let policy = policy.unwrap_or_else(|| self.inner.config.default_retry_policy.clone());
        policy.validate()?;
        let mut message = message.with_metadata(META_RELIABILITY, level.as_str());
        if level.awaits_ack() {
            message.requires_ack = true;
        }

        let mut reliable = ReliableMessage::new(message, level, policy);
        if let Some(timeout) = deadline {
            reliable = reliable.with_deadline(Instant::now() + timeout);
        }
        let tracking_id = reliable.tracking_id.clone();

        self.inner.counters.sent.fetch_add(1, Ordering::Relaxed);
        metrics::record_reliable_send(level.as_str());

        // Anything already waiting goes first
        let backlog_waiting = !self.inner.backlog.lock().is_empty();
        let permit = if backlog_waiting {
            None
        } else {
            self.inner.bulkhead.try_acquire()
        };

        match permit {
            Some(permit) => self.inner.attempt(reliable, permit).await,
            None => {
                self.inner.counters.inflight_limit_hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_inflight_limit_hit();
                debug!(
                    tracking_id = %tracking_id,
                    max_inflight = self.inner.bulkhead.max_concurrent(),
                    "Inflight limit reached, queueing message"
                );
                self.inner.backlog.lock().push_back(reliable);
            }
        }

        Ok(tracking_id)
    }

    /// Resolve an acknowledgment by its `correlation_id`.
    ///
    /// Returns `true` if it matched an in-flight message.
    pub fn handle_acknowledgment(&self, ack: &Message) -> bool {
        self.inner.handle_acknowledgment(ack)
    }

    /// Receive path: acknowledgments, exactly-once dedup, and acking.
    pub async fn receive_message(&self, message: &Message) -> ReceiveOutcome {
        if message.is_ack() {
            self.inner.handle_acknowledgment(message);
            return ReceiveOutcome::Acknowledgment;
        }

        let exactly_once = message
            .metadata_str(META_RELIABILITY)
            .and_then(ReliabilityLevel::parse)
            == Some(ReliabilityLevel::ExactlyOnce);

        let duplicate = exactly_once && self.inner.dedup.lock().check_and_insert(&message.id);
        if duplicate {
            self.inner.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            metrics::record_duplicate_detected();
            debug!(message_id = %message.id, sender = %message.sender_id, "Duplicate message suppressed");
        }

        if message.requires_ack {
            let ack = message.create_ack(self.inner.node_id.as_str());
            if !self.inner.transport.send(ack).await {
                warn!(message_id = %message.id, sender = %message.sender_id, "Failed to send acknowledgment");
            }
        }

        if duplicate {
            ReceiveOutcome::Duplicate
        } else {
            ReceiveOutcome::Accepted
        }
    }

    /// Subscribe to terminal delivery outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.inner.events.subscribe()
    }

    pub fn delivery_status(&self, tracking_id: &str) -> Option<DeliveryStatus> {
        self.inner.tracker.lock().status(tracking_id)
    }

    /// Attempts recorded for a tracking id.
    pub fn delivery_attempts(&self, tracking_id: &str) -> Option<u32> {
        self.inner
            .tracker
            .lock()
            .record(tracking_id)
            .map(|record| record.attempt_count)
    }

    pub fn delivery_statistics(&self) -> DeliveryStats {
        self.inner.tracker.lock().statistics()
    }

    pub fn stats(&self) -> RouterStats {
        let c = &self.inner.counters;
        RouterStats {
            messages_sent: c.sent.load(Ordering::Relaxed),
            messages_delivered: c.delivered.load(Ordering::Relaxed),
            messages_failed: c.failed.load(Ordering::Relaxed),
            messages_expired: c.expired.load(Ordering::Relaxed),
            retries_attempted: c.retries.load(Ordering::Relaxed),
            duplicates_detected: c.duplicates.load(Ordering::Relaxed),
            inflight_limit_hits: c.inflight_limit_hits.load(Ordering::Relaxed),
            acks_received: c.acks.load(Ordering::Relaxed),
            inflight: self.inner.bulkhead.in_use(),
            retry_queue_depth: self
                .inner
                .pending
                .iter()
                .filter(|entry| entry.reliable.next_retry_at.is_some())
                .count(),
            queued: self.inner.backlog.lock().len(),
        }
    }
}

impl<T: Transport> RouterInner<T> {
    fn schedule(&self, due: Instant, kind: ScheduledKind) {
        let seq = self.schedule_seq.fetch_add(1, Ordering::Relaxed);
        // Receiver lives as long as self
        let _ = self.schedule_tx.send(ScheduledEntry { due, seq, kind });
    }

    async fn attempt(&self, mut reliable: ReliableMessage, permit: OwnedSemaphorePermit) {
        let now = Instant::now();
        if reliable.is_past_deadline(now) {
            if reliable.attempt_count == 0 {
                self.tracker.lock().start_delivery(&reliable.tracking_id, &reliable.message);
            }
            self.finish(reliable, DeliveryStatus::Expired, Some("deadline exceeded".into()));
            drop(permit);
            return;
        }

        reliable.attempt_count += 1;
        reliable.next_retry_at = None;
        self.tracker.lock().start_delivery(&reliable.tracking_id, &reliable.message);
        if reliable.attempt_count > 1 {
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            metrics::record_retry(reliable.attempt_count);
        }

        let message_id = reliable.message.id.clone();
        let attempt = reliable.attempt_count;
        let level = reliable.level;
        let outgoing = reliable.message.clone();

        // Registered before the send so an ack racing the send result still resolves
        self.pending.insert(
            message_id.clone(),
            PendingDelivery {
                reliable,
                permit,
            },
        );

        let accepted = self.transport.send(outgoing).await;
        debug!(message_id = %message_id, attempt, accepted, "Send attempt");

        if accepted && level.awaits_ack() {
            if self.pending.contains_key(&message_id) {
                self.schedule(
                    Instant::now() + self.config.ack_timeout(),
                    ScheduledKind::AckTimeout { message_id, attempt },
                );
            }
            return;
        }

        let Some((_, pending)) = self.pending.remove(&message_id) else {
            return;
        };
        if accepted {
            self.finish(pending.reliable, DeliveryStatus::Delivered, None);
        } else {
            self.handle_failure(pending, "send failed");
        }
    }

    fn should_retry(&self, reliable: &ReliableMessage) -> bool {
        reliable.level.awaits_ack()
            && reliable.policy.should_retry(reliable.attempt_count)
            && !reliable.is_past_deadline(Instant::now())
    }

    fn handle_failure(&self, mut pending: PendingDelivery, reason: &str) {
        if !self.should_retry(&pending.reliable) {
            if pending.reliable.is_past_deadline(Instant::now()) {
                self.finish(pending.reliable, DeliveryStatus::Expired, Some(reason.to_string()));
            } else {
                self.finish(pending.reliable, DeliveryStatus::Failed, Some(reason.to_string()));
            }
            return;
        }

        let attempt = pending.reliable.attempt_count;
        let delay = pending.reliable.policy.calculate_backoff(attempt);
        let due = Instant::now() + delay;
        pending.reliable.next_retry_at = Some(due);

        let message_id = pending.reliable.message.id.clone();
        debug!(
            message_id = %message_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            reason,
            "Scheduling retry"
        );
        self.pending.insert(message_id.clone(), pending);
        self.schedule(due, ScheduledKind::Retry { message_id });
    }

    fn handle_acknowledgment(&self, ack: &Message) -> bool {
        let Some(original_id) = ack.correlation_id.as_deref() else {
            debug!(message_id = %ack.id, "Acknowledgment without correlation id ignored");
            return false;
        };
        self.counters.acks.fetch_add(1, Ordering::Relaxed);

        match self.pending.remove(original_id) {
            Some((_, pending)) => {
                self.finish(pending.reliable, DeliveryStatus::Delivered, None);
                true
            }
            None => {
                debug!(original_id, "Acknowledgment for unknown or settled message");
                false
            }
        }
    }

    /// Record a terminal outcome. The caller drops the permit.
    ///
    /// Callers own the message (it has left `pending`), so this runs once per
    /// send. Counters and the event do not depend on the tracker still holding
    /// a record for it.
    fn finish(&self, reliable: ReliableMessage, status: DeliveryStatus, reason: Option<String>) {
        let tracking_id = reliable.tracking_id.as_str();
        let latency = {
            let mut tracker = self.tracker.lock();
            let marked = match status {
                DeliveryStatus::Delivered => tracker.mark_delivered(tracking_id),
                DeliveryStatus::Failed => {
                    tracker.mark_failed(tracking_id, reason.as_deref().unwrap_or("unknown"))
                }
                DeliveryStatus::Expired => tracker.mark_expired(tracking_id),
                DeliveryStatus::Pending => false,
            };
            if !marked {
                debug!(tracking_id, status = %status, "No pending delivery record to settle");
            }
            tracker.record(tracking_id).map(|record| record.created_at.elapsed())
        };

        match status {
            DeliveryStatus::Delivered => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(tracking_id, attempts = reliable.attempt_count, "Message delivered");
            }
            DeliveryStatus::Failed => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    tracking_id,
                    recipient = %reliable.message.recipient_label(),
                    attempts = reliable.attempt_count,
                    reason = reason.as_deref().unwrap_or("unknown"),
                    "Message delivery failed permanently"
                );
            }
            DeliveryStatus::Expired => {
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
                warn!(tracking_id, attempts = reliable.attempt_count, "Message expired before delivery");
            }
            DeliveryStatus::Pending => {}
        }
        metrics::record_delivery_outcome(&status.to_string(), latency.unwrap_or_default());

        let _ = self.events.send(DeliveryEvent {
            tracking_id: reliable.tracking_id.clone(),
            message_id: reliable.message.id.clone(),
            recipient_id: reliable.message.recipient_id.clone(),
            status,
            attempts: reliable.attempt_count,
            reason,
        });

        if !self.backlog.lock().is_empty() {
            self.schedule(Instant::now(), ScheduledKind::Drain);
        }
    }

    async fn drain_backlog(&self) {
        loop {
            let Some(permit) = self.bulkhead.try_acquire() else {
                return;
            };
            let next = self.backlog.lock().pop_front();
            match next {
                Some(reliable) => self.attempt(reliable, permit).await,
                None => return,
            }
        }
    }

    async fn process(&self, entry: ScheduledEntry) {
        match entry.kind {
            ScheduledKind::Retry { message_id } => {
                let Some((_, pending)) = self.pending.remove(&message_id) else {
                    // Acknowledged while waiting out the backoff
                    return;
                };
                let PendingDelivery { reliable, permit } = pending;
                if reliable.is_past_deadline(Instant::now()) {
                    self.finish(reliable, DeliveryStatus::Expired, Some("deadline exceeded".into()));
                    return;
                }
                self.attempt(reliable, permit).await;
            }
            ScheduledKind::AckTimeout { message_id, attempt } => {
                let timed_out = self.pending.get(&message_id).is_some_and(|p| {
                    p.reliable.attempt_count == attempt && p.reliable.next_retry_at.is_none()
                });
                if !timed_out {
                    return;
                }
                if let Some((_, pending)) = self.pending.remove(&message_id) {
                    warn!(message_id = %message_id, attempt, "Acknowledgment timeout");
                    self.handle_failure(pending, "acknowledgment timeout");
                }
            }
            ScheduledKind::Drain => self.drain_backlog().await,
        }
    }

    fn run_maintenance(&self) {
        let removed = self.tracker.lock().cleanup_expired_deliveries(self.record_max_age);
        if removed > 0 {
            debug!(removed, "Cleaned up settled delivery records");
        }
        metrics::set_router_inflight(self.bulkhead.in_use(), self.backlog.lock().len());
    }
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

/// Drives the retry schedule until shutdown.
///
/// Entries left over from a previous run are past due and fire first.
async fn run_scheduler<T: Transport>(
    inner: Arc<RouterInner<T>>,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    let mut state = inner.scheduler.lock().await;
    let SchedulerState { rx, heap } = &mut *state;
    if !heap.is_empty() {
        debug!(scheduled = heap.len(), "Resuming retry schedule");
    }

    let mut maintenance = tokio::time::interval(inner.config.maintenance_interval());
    maintenance.set_missed_tick_behavior(MissedTickBehavior::Skip);
    maintenance.tick().await;

    // Sends queued before start() get a chance to go out
    inner.drain_backlog().await;

    loop {
        let next_due = heap.peek().map(|Reverse(entry)| entry.due);
        tokio::select! {
            biased;
            _ = shutdown_signalled(&mut shutdown_rx) => {
                debug!(scheduled = heap.len(), "Router scheduler shutting down");
                break;
            }
            entry = rx.recv() => match entry {
                Some(entry) => heap.push(Reverse(entry)),
                None => break,
            },
            _ = sleep_until_due(next_due) => {
                let now = Instant::now();
                while heap.peek().is_some_and(|Reverse(entry)| entry.due <= now) {
                    if let Some(Reverse(entry)) = heap.pop() {
                        inner.process(entry).await;
                    }
                }
            }
            _ = maintenance.tick() => inner.run_maintenance(),
        }
    }
}
