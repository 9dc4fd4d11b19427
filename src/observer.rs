//! Bounded observer that remembers recently seen impressions so repeats can
//! be tagged with their previous time and counted instead of re-sent.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

use crate::dtos::Impression;

/// Default observer capacity.
pub const DEFAULT_OBSERVER_SIZE: usize = 500_000;

/// 64-bit fingerprint of the identifying fields of an impression.
pub fn impression_fingerprint(feature: &str, impression: &Impression) -> u64 {
    let mut hasher = DefaultHasher::new();
    feature.hash(&mut hasher);
    impression.key_name.hash(&mut hasher);
    impression.change_number.hash(&mut hasher);
    impression.treatment.hash(&mut hasher);
    impression.label.hash(&mut hasher);
    hasher.finish()
}

struct Entry {
    last_time: i64,
    tick: u64,
}

/// Fixed-capacity LRU keyed by impression fingerprint.
///
/// Recency is tracked with a queue of `(tick, fingerprint)` pairs; stale
/// queue entries (whose tick no longer matches the live entry) are skipped
/// at eviction time rather than removed eagerly.
pub struct ImpressionObserver {
    entries: HashMap<u64, Entry>,
    order: VecDeque<(u64, u64)>,
    capacity: usize,
    tick: u64,
}

impl ImpressionObserver {
    pub fn new(capacity: usize) -> Self {
        ImpressionObserver {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            tick: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record `impression` and return the time of the previous identical
    /// impression, if one is still in the window.
    pub fn test_and_set(&mut self, feature: &str, impression: &Impression) -> Option<i64> {
        let fingerprint = impression_fingerprint(feature, impression);
        self.tick += 1;
        let tick = self.tick;

        let previous = match self.entries.get_mut(&fingerprint) {
            Some(entry) => {
                let seen = entry.last_time;
                entry.last_time = impression.time;
                entry.tick = tick;
                Some(seen)
            }
            None => {
                self.entries.insert(
                    fingerprint,
                    Entry {
                        last_time: impression.time,
                        tick,
                    },
                );
                None
            }
        };
        self.order.push_back((tick, fingerprint));
        self.evict();
        previous
    }

    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            let (tick, fingerprint) = match self.order.pop_front() {
                Some(front) => front,
                None => return,
            };
            match self.entries.get(&fingerprint) {
                Some(entry) if entry.tick == tick => {
                    self.entries.remove(&fingerprint);
                }
                _ => {} // stale queue entry, the live one is newer
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impression(key: &str, treatment: &str, time: i64) -> Impression {
        Impression {
            key_name: key.to_string(),
            bucketing_key: None,
            treatment: treatment.to_string(),
            time,
            change_number: 1,
            label: "rule".to_string(),
            previous_time: None,
        }
    }

    #[test]
    fn first_sight_has_no_previous_time() {
        let mut observer = ImpressionObserver::new(16);
        assert_eq!(observer.test_and_set("f", &impression("u", "on", 100)), None);
    }

    #[test]
    fn repeat_returns_previous_time() {
        let mut observer = ImpressionObserver::new(16);
        observer.test_and_set("f", &impression("u", "on", 100));
        assert_eq!(
            observer.test_and_set("f", &impression("u", "on", 200)),
            Some(100)
        );
        assert_eq!(
            observer.test_and_set("f", &impression("u", "on", 300)),
            Some(200)
        );
    }

    #[test]
    fn distinct_tuples_do_not_collide() {
        let mut observer = ImpressionObserver::new(16);
        observer.test_and_set("f", &impression("u", "on", 100));
        assert_eq!(observer.test_and_set("f", &impression("u", "off", 200)), None);
        assert_eq!(observer.test_and_set("g", &impression("u", "on", 200)), None);
    }

    #[test]
    fn capacity_is_enforced_oldest_first() {
        let mut observer = ImpressionObserver::new(2);
        observer.test_and_set("f", &impression("a", "on", 1));
        observer.test_and_set("f", &impression("b", "on", 2));
        observer.test_and_set("f", &impression("c", "on", 3));
        assert_eq!(observer.len(), 2);

        // "a" was evicted, "b" and "c" survive.
        assert_eq!(observer.test_and_set("f", &impression("b", "on", 4)), Some(2));
        assert_eq!(observer.test_and_set("f", &impression("a", "on", 5)), None);
    }

    #[test]
    fn touching_an_entry_refreshes_its_position() {
        let mut observer = ImpressionObserver::new(2);
        observer.test_and_set("f", &impression("a", "on", 1));
        observer.test_and_set("f", &impression("b", "on", 2));
        observer.test_and_set("f", &impression("a", "on", 3)); // refresh "a"
        observer.test_and_set("f", &impression("c", "on", 4)); // evicts "b"

        assert_eq!(observer.test_and_set("f", &impression("a", "on", 5)), Some(3));
        assert_eq!(observer.test_and_set("f", &impression("b", "on", 6)), None);
    }
}
