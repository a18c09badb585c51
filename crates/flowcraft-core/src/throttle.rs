//! Latest-value buffers flushed on a fixed interval.
//!
//! High-frequency updates (node drags, cursor moves) are coalesced here: each
//! key keeps only its newest value, and the first push after a flush arms a
//! single deadline. Callers poll with the current time and take the batch once
//! the deadline has passed.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Throttle<K: Ord, V> {
    interval: Duration,
    pending: BTreeMap<K, V>,
    deadline: Option<Instant>,
}

impl<K: Ord, V> Throttle<K, V> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: BTreeMap::new(),
            deadline: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Buffer `value` for `key`, replacing any older value. Arms the deadline
    /// if it is not armed yet; an armed deadline is never pushed back.
    pub fn push(&mut self, key: K, value: V, now: Instant) {
        self.pending.insert(key, value);
        if self.deadline.is_none() {
            self.deadline = Some(now + self.interval);
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.pending.get(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.pending.remove(key);
        if self.pending.is_empty() {
            self.deadline = None;
        }
        value
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True when the deadline is armed and has passed.
    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Take the batch if it is due.
    pub fn take_due(&mut self, now: Instant) -> Option<BTreeMap<K, V>> {
        if self.is_due(now) {
            Some(self.take())
        } else {
            None
        }
    }

    /// Take everything buffered and disarm the deadline.
    pub fn take(&mut self) -> BTreeMap<K, V> {
        self.deadline = None;
        std::mem::take(&mut self.pending)
    }

    /// Iterate over buffered values without taking them.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.pending.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesces_latest_value() {
        let start = Instant::now();
        let mut throttle = Throttle::new(Duration::from_millis(50));
        throttle.push("n1", 1, start);
        throttle.push("n1", 2, start + Duration::from_millis(10));
        throttle.push("n2", 7, start + Duration::from_millis(20));

        assert!(throttle.take_due(start + Duration::from_millis(49)).is_none());
        let batch = throttle.take_due(start + Duration::from_millis(50)).unwrap();
        assert_eq!(batch.get("n1"), Some(&2));
        assert_eq!(batch.get("n2"), Some(&7));
        assert!(throttle.is_empty());
        assert!(throttle.deadline().is_none());
    }

    #[test]
    fn test_deadline_not_extended_by_later_pushes() {
        let start = Instant::now();
        let mut throttle = Throttle::new(Duration::from_millis(50));
        throttle.push((), 1, start);
        throttle.push((), 2, start + Duration::from_millis(40));
        assert_eq!(throttle.deadline(), Some(start + Duration::from_millis(50)));
    }

    #[test]
    fn test_remove_last_disarms() {
        let start = Instant::now();
        let mut throttle = Throttle::new(Duration::from_millis(50));
        throttle.push("a", 1, start);
        assert_eq!(throttle.remove(&"a"), Some(1));
        assert!(!throttle.is_due(start + Duration::from_secs(1)));
    }
}
