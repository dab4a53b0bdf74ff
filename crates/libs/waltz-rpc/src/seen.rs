//! Relays re-deliver on reconnect and flap; a time-windowed cache of
//! `(topic, request id)` pairs keeps each inbound request from being
//! handled twice.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use waltz_kms::Topic;

pub(crate) struct SeenCache {
    window: Duration,
    cap: usize,
    order: VecDeque<(Instant, Topic, u64)>,
    index: HashSet<(Topic, u64)>,
}

impl SeenCache {
    pub(crate) fn new(window: Duration, cap: usize) -> Self {
        Self { window, cap, order: VecDeque::new(), index: HashSet::new() }
    }

    /// Records the pair and reports whether it was seen for the first time.
    pub(crate) fn observe(&mut self, topic: Topic, id: u64) -> bool {
        self.evict(Instant::now());
        if !self.index.insert((topic, id)) {
            return false;
        }
        self.order.push_back((Instant::now(), topic, id));
        true
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(at, topic, id)) = self.order.front() {
            let expired = now.duration_since(at) >= self.window;
            if !expired && self.order.len() <= self.cap {
                break;
            }
            self.order.pop_front();
            self.index.remove(&(topic, id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(byte: u8) -> Topic {
        Topic::from_bytes([byte; 32])
    }

    #[test]
    fn repeat_within_window_is_a_duplicate() {
        let mut cache = SeenCache::new(Duration::from_secs(60), 16);
        assert!(cache.observe(topic(1), 10));
        assert!(!cache.observe(topic(1), 10));
        // Same id on another topic is distinct.
        assert!(cache.observe(topic(2), 10));
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let mut cache = SeenCache::new(Duration::from_secs(60), 2);
        assert!(cache.observe(topic(1), 1));
        assert!(cache.observe(topic(1), 2));
        assert!(cache.observe(topic(1), 3));
        // Entry 1 was displaced, so it reads as fresh again.
        assert!(cache.observe(topic(1), 1));
        assert!(!cache.observe(topic(1), 3));
    }
}
