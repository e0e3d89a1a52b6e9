//! Delivery bookkeeping for reliable sends.
//!
//! A [`DeliveryRecord`] starts PENDING and advances at most once into a
//! terminal state (DELIVERED, FAILED or EXPIRED). PENDING is the only
//! re-enterable state: starting a delivery again for a pending tracking id
//! counts another attempt on the same record.
//!
//! The tracker is a plain owned structure. Callers that share it across
//! tasks wrap it in a lock (see [`ReliableMessageRouter`](super::ReliableMessageRouter)).

use crate::config::DeliveryConfig;
use crate::message::Message;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Delivery status of one tracked message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
    Expired,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Delivered => write!(f, "delivered"),
            DeliveryStatus::Failed => write!(f, "failed"),
            DeliveryStatus::Expired => write!(f, "expired"),
        }
    }
}

/// Lifecycle of one tracked delivery.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub tracking_id: String,
    pub message_id: String,
    pub recipient_id: Option<String>,
    pub status: DeliveryStatus,
    pub created_at: Instant,
    pub delivered_at: Option<Instant>,
    /// Set for FAILED and EXPIRED.
    pub failed_at: Option<Instant>,
    pub failure_reason: Option<String>,
    pub attempt_count: u32,
    pub last_attempt: Option<Instant>,
}

/// Aggregate tracker statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryStats {
    /// Distinct deliveries started.
    pub total_deliveries: u64,
    pub successful_deliveries: u64,
    pub failed_deliveries: u64,
    pub expired_deliveries: u64,
    /// Running mean over successful deliveries.
    pub average_delivery_time: Duration,
    pub active_records: usize,
    pub pending_deliveries: usize,
    /// successful / total, as a percentage.
    pub success_rate: f64,
}

/// Tracks delivery attempts and outcomes keyed by tracking id.
#[derive(Debug)]
pub struct DeliveryTracker {
    max_records: usize,
    eviction_margin: usize,
    records: HashMap<String, DeliveryRecord>,
    total: u64,
    successful: u64,
    failed: u64,
    expired: u64,
    average_delivery_secs: f64,
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new(&DeliveryConfig::default())
    }
}

impl DeliveryTracker {
    pub fn new(config: &DeliveryConfig) -> Self {
        Self {
            max_records: config.max_records.max(1),
            eviction_margin: config.eviction_margin,
            records: HashMap::new(),
            total: 0,
            successful: 0,
            failed: 0,
            expired: 0,
            average_delivery_secs: 0.0,
        }
    }

    /// Start (or re-attempt) a delivery.
    ///
    /// Creates a PENDING record with one attempt. If a PENDING record already
    /// exists for `tracking_id`, another attempt is counted on it. Terminal
    /// records are left alone.
    pub fn start_delivery(&mut self, tracking_id: &str, message: &Message) {
        let now = Instant::now();
        if let Some(record) = self.records.get_mut(tracking_id) {
            if record.status == DeliveryStatus::Pending {
                record.attempt_count += 1;
                record.last_attempt = Some(now);
            }
            return;
        }

        self.records.insert(
            tracking_id.to_string(),
            DeliveryRecord {
                tracking_id: tracking_id.to_string(),
                message_id: message.id.clone(),
                recipient_id: message.recipient_id.clone(),
                status: DeliveryStatus::Pending,
                created_at: now,
                delivered_at: None,
                failed_at: None,
                failure_reason: None,
                attempt_count: 1,
                last_attempt: Some(now),
            },
        );
        self.total += 1;
        self.evict_oldest();
    }

    /// Count another attempt on a pending record.
    pub fn update_attempt(&mut self, tracking_id: &str) {
        if let Some(record) = self.pending_mut(tracking_id) {
            record.attempt_count += 1;
            record.last_attempt = Some(Instant::now());
        }
    }

    /// Mark a pending delivery DELIVERED. Returns `true` if the status changed.
    pub fn mark_delivered(&mut self, tracking_id: &str) -> bool {
        let now = Instant::now();
        let Some(record) = self.pending_mut(tracking_id) else {
            return false;
        };
        record.status = DeliveryStatus::Delivered;
        record.delivered_at = Some(now);
        let elapsed = now.saturating_duration_since(record.created_at).as_secs_f64();

        self.successful += 1;
        // Running mean: avg_n = avg_{n-1} + (x - avg_{n-1}) / n
        self.average_delivery_secs += (elapsed - self.average_delivery_secs) / self.successful as f64;
        true
    }

    /// Mark a pending delivery FAILED. Returns `true` if the status changed.
    pub fn mark_failed(&mut self, tracking_id: &str, reason: &str) -> bool {
        let Some(record) = self.pending_mut(tracking_id) else {
            return false;
        };
        record.status = DeliveryStatus::Failed;
        record.failed_at = Some(Instant::now());
        record.failure_reason = Some(reason.to_string());
        self.failed += 1;
        true
    }

    /// Mark a pending delivery EXPIRED. Returns `true` if the status changed.
    pub fn mark_expired(&mut self, tracking_id: &str) -> bool {
        let Some(record) = self.pending_mut(tracking_id) else {
            return false;
        };
        record.status = DeliveryStatus::Expired;
        record.failed_at = Some(Instant::now());
        record.failure_reason = Some("Delivery deadline expired".to_string());
        self.expired += 1;
        true
    }

    pub fn status(&self, tracking_id: &str) -> Option<DeliveryStatus> {
        self.records.get(tracking_id).map(|r| r.status)
    }

    pub fn record(&self, tracking_id: &str) -> Option<&DeliveryRecord> {
        self.records.get(tracking_id)
    }

    pub fn pending_deliveries(&self) -> Vec<&DeliveryRecord> {
        self.with_status(DeliveryStatus::Pending)
    }

    pub fn failed_deliveries(&self) -> Vec<&DeliveryRecord> {
        self.with_status(DeliveryStatus::Failed)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove terminal records older than `max_age`. Returns how many went.
    ///
    /// Pending records are never collected here, whatever their age.
    pub fn cleanup_expired_deliveries(&mut self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records.retain(|_, record| {
            !(record.status.is_terminal()
                && now.saturating_duration_since(record.created_at) > max_age)
        });
        let removed = before - self.records.len();
        if removed > 0 {
            debug!(removed, "Cleaned up old delivery records");
        }
        removed
    }

    /// Success rate as a percentage of distinct deliveries started.
    pub fn success_rate(&self) -> f64 {
        self.successful as f64 / self.total.max(1) as f64 * 100.0
    }

    pub fn statistics(&self) -> DeliveryStats {
        DeliveryStats {
            total_deliveries: self.total,
            successful_deliveries: self.successful,
            failed_deliveries: self.failed,
            expired_deliveries: self.expired,
            average_delivery_time: Duration::from_secs_f64(self.average_delivery_secs.max(0.0)),
            active_records: self.records.len(),
            pending_deliveries: self.with_status(DeliveryStatus::Pending).len(),
            success_rate: self.success_rate(),
        }
    }

    fn pending_mut(&mut self, tracking_id: &str) -> Option<&mut DeliveryRecord> {
        self.records
            .get_mut(tracking_id)
            .filter(|r| r.status == DeliveryStatus::Pending)
    }

    fn with_status(&self, status: DeliveryStatus) -> Vec<&DeliveryRecord> {
        self.records.values().filter(|r| r.status == status).collect()
    }

    /// Oldest-first eviction of settled records once over capacity, removing
    /// a margin of extra records so the next insert does not trigger another
    /// pass.
    ///
    /// PENDING records are never evicted: an in-flight delivery must still
    /// find its record when it settles. The router's inflight limit bounds
    /// how many of those can exist.
    fn evict_oldest(&mut self) {
        if self.records.len() <= self.max_records {
            return;
        }

        let wanted = self.records.len() - self.max_records + self.eviction_margin;
        let mut settled: Vec<(Instant, String)> = self
            .records
            .values()
            .filter(|r| r.status.is_terminal())
            .map(|r| (r.created_at, r.tracking_id.clone()))
            .collect();
        settled.sort();

        let evicted = wanted.min(settled.len());
        for (_, tracking_id) in settled.into_iter().take(evicted) {
            self.records.remove(&tracking_id);
        }
        if evicted > 0 {
            debug!(evicted, remaining = self.records.len(), "Evicted oldest delivery records");
        }
    }
}

impl fmt::Display for DeliveryTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DeliveryTracker(records={}, success_rate={:.1}%)",
            self.records.len(),
            self.success_rate()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use serde_json::json;

    fn msg() -> Message {
        Message::new(MessageType::Data, "a", json!({})).to("b")
    }

    fn tracker_with_capacity(max_records: usize, eviction_margin: usize) -> DeliveryTracker {
        DeliveryTracker::new(&DeliveryConfig {
            max_records,
            eviction_margin,
            ..Default::default()
        })
    }

    #[test]
    fn test_start_creates_pending() {
        let mut tracker = DeliveryTracker::default();
        let m = msg();
        tracker.start_delivery("t1", &m);

        let record = tracker.record("t1").unwrap();
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert_eq!(record.message_id, m.id);
        assert_eq!(record.recipient_id.as_deref(), Some("b"));
        assert_eq!(record.attempt_count, 1);
        assert_eq!(tracker.pending_deliveries().len(), 1);
    }

    #[test]
    fn test_restart_pending_counts_attempt() {
        let mut tracker = DeliveryTracker::default();
        let m = msg();
        tracker.start_delivery("t1", &m);
        tracker.start_delivery("t1", &m);
        tracker.update_attempt("t1");

        assert_eq!(tracker.record("t1").unwrap().attempt_count, 3);
        assert_eq!(tracker.statistics().total_deliveries, 1);
    }

    #[test]
    fn test_delivered_after_failed_is_noop() {
        let mut tracker = DeliveryTracker::default();
        tracker.start_delivery("t1", &msg());

        assert!(tracker.mark_failed("t1", "connection refused"));
        assert!(!tracker.mark_delivered("t1"));
        assert!(!tracker.mark_expired("t1"));

        let record = tracker.record("t1").unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.failure_reason.as_deref(), Some("connection refused"));
        let stats = tracker.statistics();
        assert_eq!(stats.failed_deliveries, 1);
        assert_eq!(stats.successful_deliveries, 0);
    }

    #[test]
    fn test_terminal_record_not_restarted() {
        let mut tracker = DeliveryTracker::default();
        tracker.start_delivery("t1", &msg());
        tracker.mark_delivered("t1");
        tracker.start_delivery("t1", &msg());
        tracker.update_attempt("t1");

        let record = tracker.record("t1").unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.attempt_count, 1);
    }

    #[test]
    fn test_unknown_ids_are_noops() {
        let mut tracker = DeliveryTracker::default();
        assert!(!tracker.mark_delivered("nope"));
        assert!(!tracker.mark_failed("nope", "x"));
        assert!(!tracker.mark_expired("nope"));
        tracker.update_attempt("nope");
        assert!(tracker.status("nope").is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_mark_expired_reason() {
        let mut tracker = DeliveryTracker::default();
        tracker.start_delivery("t1", &msg());
        assert!(tracker.mark_expired("t1"));
        let record = tracker.record("t1").unwrap();
        assert_eq!(record.status, DeliveryStatus::Expired);
        assert!(record.failed_at.is_some());
        assert_eq!(tracker.statistics().expired_deliveries, 1);
    }

    #[test]
    fn test_success_rate() {
        let mut tracker = DeliveryTracker::default();
        assert_eq!(tracker.success_rate(), 0.0);
        for i in 0..4 {
            tracker.start_delivery(&format!("t{}", i), &msg());
        }
        tracker.mark_delivered("t0");
        tracker.mark_delivered("t1");
        tracker.mark_delivered("t2");
        tracker.mark_failed("t3", "boom");

        assert_eq!(tracker.success_rate(), 75.0);
        assert_eq!(tracker.failed_deliveries().len(), 1);
        assert!(tracker.to_string().contains("75.0%"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_average_delivery_time() {
        let mut tracker = DeliveryTracker::default();
        tracker.start_delivery("fast", &msg());
        tracker.start_delivery("slow", &msg());

        tokio::time::advance(Duration::from_millis(100)).await;
        tracker.mark_delivered("fast");
        tokio::time::advance(Duration::from_millis(200)).await;
        tracker.mark_delivered("slow");

        let avg = tracker.statistics().average_delivery_time;
        // (100ms + 300ms) / 2
        assert!(avg >= Duration::from_millis(199) && avg <= Duration::from_millis(201), "{:?}", avg);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_oldest_first_with_margin() {
        let mut tracker = tracker_with_capacity(5, 2);
        for i in 0..5 {
            let id = format!("t{}", i);
            tracker.start_delivery(&id, &msg());
            tracker.mark_delivered(&id);
            tokio::time::advance(Duration::from_millis(1)).await;
        }
        assert_eq!(tracker.len(), 5);

        // Sixth record overflows by 1: evict 1 + margin 2 = 3 oldest
        tracker.start_delivery("t5", &msg());
        assert_eq!(tracker.len(), 3);
        assert!(tracker.record("t0").is_none());
        assert!(tracker.record("t1").is_none());
        assert!(tracker.record("t2").is_none());
        assert!(tracker.record("t3").is_some());
        assert!(tracker.record("t5").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_keeps_pending_records() {
        let mut tracker = tracker_with_capacity(2, 0);
        tracker.start_delivery("inflight", &msg());
        tokio::time::advance(Duration::from_millis(1)).await;
        tracker.start_delivery("settled", &msg());
        tracker.mark_failed("settled", "x");
        tokio::time::advance(Duration::from_millis(1)).await;

        // The oldest record is still pending, so the settled one goes instead
        tracker.start_delivery("next", &msg());
        assert_eq!(tracker.len(), 2);
        assert!(tracker.record("settled").is_none());

        // Nothing settled left to evict, so the table runs over capacity
        tracker.start_delivery("more", &msg());
        assert_eq!(tracker.len(), 3);
        assert!(tracker.mark_delivered("inflight"));
        assert_eq!(tracker.record("next").unwrap().status, DeliveryStatus::Pending);
        assert_eq!(tracker.statistics().total_deliveries, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_removes_only_old_terminal_records() {
        let mut tracker = DeliveryTracker::default();
        tracker.start_delivery("done", &msg());
        tracker.start_delivery("failed", &msg());
        tracker.start_delivery("pending", &msg());
        tracker.mark_delivered("done");
        tracker.mark_failed("failed", "x");

        assert_eq!(tracker.cleanup_expired_deliveries(Duration::from_secs(60)), 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        tracker.start_delivery("fresh", &msg());
        tracker.mark_delivered("fresh");

        assert_eq!(tracker.cleanup_expired_deliveries(Duration::from_secs(60)), 2);
        assert!(tracker.record("pending").is_some());
        assert!(tracker.record("fresh").is_some());
        assert_eq!(tracker.len(), 2);
    }
}
