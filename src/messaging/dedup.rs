//! Receive-side deduplication for exactly-once delivery.
//!
//! A bounded, time-windowed set of recently seen message ids. Ids are
//! forgotten once older than the retention window, and the oldest id is
//! dropped first when the cache is full.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Recently seen message ids.
#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    window: Duration,
    seen: HashMap<String, Instant>,
    /// Insertion order for expiry and eviction.
    order: VecDeque<(Instant, String)>,
}

impl DedupCache {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `message_id`. Returns `true` if it was already seen within
    /// the retention window.
    pub fn check_and_insert(&mut self, message_id: &str) -> bool {
        let now = Instant::now();
        self.purge_expired(now);

        if self.seen.contains_key(message_id) {
            return true;
        }

        while self.seen.len() >= self.capacity {
            match self.order.pop_front() {
                Some((_, oldest)) => {
                    self.seen.remove(&oldest);
                }
                None => break,
            }
        }

        self.seen.insert(message_id.to_string(), now);
        self.order.push_back((now, message_id.to_string()));
        false
    }

    /// True if `message_id` is currently remembered.
    pub fn contains(&self, message_id: &str) -> bool {
        self.seen
            .get(message_id)
            .is_some_and(|seen_at| seen_at.elapsed() <= self.window)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn purge_expired(&mut self, now: Instant) {
        while let Some((seen_at, _)) = self.order.front() {
            if now.saturating_duration_since(*seen_at) <= self.window {
                break;
            }
            if let Some((_, id)) = self.order.pop_front() {
                self.seen.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_duplicate() {
        let mut cache = DedupCache::new(10, Duration::from_secs(60));
        assert!(!cache.check_and_insert("m1"));
        assert!(cache.check_and_insert("m1"));
        assert!(!cache.check_and_insert("m2"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = DedupCache::new(2, Duration::from_secs(60));
        cache.check_and_insert("m1");
        cache.check_and_insert("m2");
        cache.check_and_insert("m3");

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("m1"));
        assert!(cache.contains("m2"));
        assert!(cache.contains("m3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry() {
        let mut cache = DedupCache::new(10, Duration::from_secs(5));
        cache.check_and_insert("m1");
        tokio::time::advance(Duration::from_secs(3)).await;
        cache.check_and_insert("m2");
        tokio::time::advance(Duration::from_secs(3)).await;

        assert!(!cache.contains("m1"));
        assert!(cache.contains("m2"));
        // m1 forgotten, so it is accepted again
        assert!(!cache.check_and_insert("m1"));
        assert_eq!(cache.len(), 2);
    }
}
