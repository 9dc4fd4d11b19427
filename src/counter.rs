//! Deduplicated impression counts, keyed by feature and hour bucket.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use crate::dtos::{FeatureCount, ImpressionCounts};

const SHARDS: usize = 8;
const HOUR_MILLIS: i64 = 3_600_000;

/// Truncate an epoch-millisecond timestamp to the start of its hour.
pub fn hour_bucket(time_ms: i64) -> i64 {
    time_ms - time_ms.rem_euclid(HOUR_MILLIS)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CounterKey {
    feature: String,
    time_frame: i64,
}

/// Counter of suppressed duplicate impressions. Sharded by feature so
/// concurrent recorders for different features do not serialize on one lock.
pub struct ImpressionsCounter {
    shards: Vec<Mutex<HashMap<CounterKey, i64>>>,
}

impl Default for ImpressionsCounter {
    fn default() -> Self {
        ImpressionsCounter::new()
    }
}

impl ImpressionsCounter {
    pub fn new() -> Self {
        ImpressionsCounter {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn inc(&self, feature: &str, time_ms: i64, amount: i64) {
        let key = CounterKey {
            feature: feature.to_string(),
            time_frame: hour_bucket(time_ms),
        };
        let shard = &self.shards[shard_index(feature)];
        let mut counts = shard.lock().expect("counter shard lock poisoned");
        *counts.entry(key).or_insert(0) += amount;
    }

    /// Drain all counters atomically per shard (read-and-zero).
    pub fn pop_all(&self) -> ImpressionCounts {
        let mut per_feature = Vec::new();
        for shard in &self.shards {
            let mut counts = shard.lock().expect("counter shard lock poisoned");
            for (key, count) in counts.drain() {
                per_feature.push(FeatureCount {
                    feature: key.feature,
                    time_frame: key.time_frame,
                    count,
                });
            }
        }
        per_feature.sort_by(|a, b| {
            a.feature
                .cmp(&b.feature)
                .then(a.time_frame.cmp(&b.time_frame))
        });
        ImpressionCounts { per_feature }
    }
}

fn shard_index(feature: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    feature.hash(&mut hasher);
    (hasher.finish() as usize) % SHARDS
}
