//! Impression pipeline: dedup through the observer, per-feature counting,
//! bulk grouping by SDK identity, retried upstream posts and the optional
//! listener fan-out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flagrelay_lib::{
    Impression, ImpressionObserver, ImpressionsCounter, Metadata, OperationBusy, OperationGate,
    OperationKind, TestImpressions,
};
use serde::Serialize;

use crate::server::config::{ImpressionsConfig, ImpressionsMode, SyncConfig};
use crate::server::error::{FlushError, UpstreamError};
use crate::server::metrics::metrics;
use crate::server::queue::{BoundedQueue, StoredImpression};
use crate::server::upstream::{relay_metadata, with_retries, EventsClient};

const IMPRESSIONS_BULK_PATH: &str = "/testImpressions/bulk";
const IMPRESSIONS_COUNT_PATH: &str = "/testImpressions/count";

/// JSON copy of one posted bulk, handed to the listener queue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerBulk {
    pub data: serde_json::Value,
    pub sdk_version: String,
    pub machine_ip: String,
    pub machine_name: String,
}

pub struct ImpressionsRecorder {
    queue: BoundedQueue<StoredImpression>,
    observer: Mutex<ImpressionObserver>,
    counter: ImpressionsCounter,
    client: Arc<EventsClient>,
    gate: Arc<OperationGate>,
    mode: ImpressionsMode,
    bulk_size: usize,
    retry_attempts: u32,
    retry_base: Duration,
    listener_queue: Option<Arc<BoundedQueue<ListenerBulk>>>,
}

impl ImpressionsRecorder {
    pub fn new(
        config: &ImpressionsConfig,
        sync: &SyncConfig,
        client: Arc<EventsClient>,
        gate: Arc<OperationGate>,
    ) -> Self {
        let listener_queue = config
            .listener_url
            .as_ref()
            .map(|_| Arc::new(BoundedQueue::new(config.listener_queue_size)));
        ImpressionsRecorder {
            queue: BoundedQueue::new(config.queue_size),
            observer: Mutex::new(ImpressionObserver::new(config.observer_size)),
            counter: ImpressionsCounter::new(),
            client,
            gate,
            mode: config.mode,
            bulk_size: config.bulk_size,
            retry_attempts: sync.retry_attempts,
            retry_base: Duration::from_millis(sync.retry_base_ms),
            listener_queue,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn listener_queue(&self) -> Option<Arc<BoundedQueue<ListenerBulk>>> {
        self.listener_queue.clone()
    }

    /// Accept an SDK-posted bulk into the queue.
    pub fn enqueue(&self, metadata: Metadata, bulks: Vec<TestImpressions>) {
        for bulk in bulks {
            for impression in bulk.key_impressions {
                let stored = StoredImpression {
                    metadata: metadata.clone(),
                    feature: bulk.test_name.clone(),
                    impression,
                };
                if self.queue.push(stored).is_err() {
                    metrics()
                        .queue_dropped
                        .with_label_values(&["impressions"])
                        .inc();
                }
            }
        }
        metrics()
            .queue_size
            .with_label_values(&["impressions"])
            .set(self.queue.len() as i64);
    }

    /// Scheduled drain: skipped entirely when a user-triggered flush holds
    /// the gate.
    pub async fn synchronize(&self) -> Result<usize, FlushError> {
        if self.gate.is_running(OperationKind::Impressions)
            || !self.gate.request(OperationKind::Impressions)
        {
            tracing::debug!("impressions flush in progress, skipping scheduled sync");
            return Ok(0);
        }
        let result = self.drain_once().await;
        self.gate.finish(OperationKind::Impressions);
        Ok(result?)
    }

    /// User-triggered flush: drains the whole queue or fails fast when the
    /// gate is already taken.
    pub async fn flush(&self) -> Result<usize, FlushError> {
        if !self.gate.request(OperationKind::Impressions) {
            return Err(OperationBusy(OperationKind::Impressions).into());
        }
        let timer = std::time::Instant::now();
        let mut sent = 0;
        let result = loop {
            match self.drain_once().await {
                Ok(0) => break Ok(sent),
                Ok(n) => sent += n,
                Err(err) => break Err(FlushError::from(err)),
            }
        };
        self.gate.finish(OperationKind::Impressions);
        metrics()
            .flush_duration
            .with_label_values(&["impressions"])
            .observe(timer.elapsed().as_secs_f64());
        result
    }

    /// Pop one bulk off the queue, dedup, group and post.
    async fn drain_once(&self) -> Result<usize, UpstreamError> {
        let stored = self.queue.pop_n(self.bulk_size);
        metrics()
            .queue_size
            .with_label_values(&["impressions"])
            .set(self.queue.len() as i64);
        if stored.is_empty() {
            return Ok(0);
        }

        let grouped = self.dedup_and_group(stored);
        let mut sent = 0;
        for (metadata, by_feature) in grouped {
            let bulks: Vec<TestImpressions> = by_feature
                .into_iter()
                .map(|(test_name, key_impressions)| TestImpressions {
                    test_name,
                    key_impressions,
                })
                .collect();
            if bulks.is_empty() {
                continue;
            }

            let post_metadata = Metadata {
                machine_name: metadata.machine_name_or_ip(),
                ..metadata.clone()
            };
            let outcome = with_retries(self.retry_attempts, self.retry_base, || {
                self.client.post_json(
                    IMPRESSIONS_BULK_PATH,
                    &post_metadata,
                    Some(self.mode.as_str()),
                    &bulks,
                )
            })
            .await;

            match outcome {
                Ok(()) => {
                    sent += bulks.iter().map(|b| b.key_impressions.len()).sum::<usize>();
                    metrics()
                        .posts_total
                        .with_label_values(&["impressions", "ok"])
                        .inc();
                    self.fan_out_to_listener(&post_metadata, &bulks);
                }
                Err(err) => {
                    metrics()
                        .posts_total
                        .with_label_values(&["impressions", "error"])
                        .inc();
                    return Err(err);
                }
            }
        }
        Ok(sent)
    }

    fn dedup_and_group(
        &self,
        stored: Vec<StoredImpression>,
    ) -> HashMap<Metadata, HashMap<String, Vec<Impression>>> {
        let mut observer = self.observer.lock().expect("observer lock poisoned");
        let mut grouped: HashMap<Metadata, HashMap<String, Vec<Impression>>> = HashMap::new();

        for item in stored {
            if item.metadata.sdk_version.is_empty() || item.metadata.machine_ip.is_empty() {
                continue;
            }

            let mut impression = item.impression;
            impression.previous_time = observer.test_and_set(&item.feature, &impression);
            if impression.previous_time.is_some() {
                self.counter.inc(&item.feature, impression.time, 1);
                if self.mode == ImpressionsMode::Optimized {
                    continue;
                }
            }

            grouped
                .entry(item.metadata)
                .or_default()
                .entry(item.feature)
                .or_default()
                .push(impression);
        }
        grouped
    }

    fn fan_out_to_listener(&self, metadata: &Metadata, bulks: &[TestImpressions]) {
        let Some(queue) = &self.listener_queue else {
            return;
        };
        let data = match serde_json::to_value(bulks) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(error = %err, "could not encode impressions for listener");
                return;
            }
        };
        let copy = ListenerBulk {
            data,
            sdk_version: metadata.sdk_version.clone(),
            machine_ip: metadata.machine_ip.clone(),
            machine_name: metadata.machine_name.clone(),
        };
        if queue.push(copy).is_err() {
            metrics()
                .queue_dropped
                .with_label_values(&["impressions_listener"])
                .inc();
        }
    }

    /// Flush the deduplicated counters as a single post. Empty flushes are
    /// skipped.
    pub async fn flush_counts(&self) -> Result<(), UpstreamError> {
        let counts = self.counter.pop_all();
        if counts.per_feature.is_empty() {
            return Ok(());
        }
        let metadata = relay_metadata();
        with_retries(self.retry_attempts, self.retry_base, || {
            self.client
                .post_json(IMPRESSIONS_COUNT_PATH, &metadata, None, &counts)
        })
        .await
    }

    /// Merge counts relayed by SDKs running their own dedup.
    pub fn absorb_counts(&self, counts: flagrelay_lib::ImpressionCounts) {
        for entry in counts.per_feature {
            self.counter.inc(&entry.feature, entry.time_frame, entry.count);
        }
    }
}

/// Drains the listener queue, relaying bulk copies to the configured URL.
/// Failures are logged and never block the primary path.
pub async fn run_listener_relay(
    queue: Arc<BoundedQueue<ListenerBulk>>,
    url: String,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for bulk in queue.pop_n(usize::MAX) {
                    let result = client.post(&url).json(&bulk).send().await;
                    match result {
                        Ok(response) if response.status().is_success() => {}
                        Ok(response) => {
                            tracing::warn!(status = %response.status(), "impression listener rejected bulk");
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "impression listener unreachable");
                        }
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flagrelay_lib::Impression;

    fn recorder(mode: ImpressionsMode) -> ImpressionsRecorder {
        let upstream = crate::server::config::UpstreamConfig {
            apikey: "test".to_string(),
            ..Default::default()
        };
        let config = ImpressionsConfig {
            mode,
            ..Default::default()
        };
        ImpressionsRecorder::new(
            &config,
            &SyncConfig::default(),
            Arc::new(EventsClient::new(&upstream).unwrap()),
            Arc::new(OperationGate::new()),
        )
    }

    fn metadata(suffix: &str) -> Metadata {
        Metadata {
            sdk_version: format!("rust-1.0.{suffix}"),
            machine_ip: "10.0.0.1".to_string(),
            machine_name: String::new(),
        }
    }

    fn stored(meta: &Metadata, feature: &str, key: &str, time: i64) -> StoredImpression {
        StoredImpression {
            metadata: meta.clone(),
            feature: feature.to_string(),
            impression: Impression {
                key_name: key.to_string(),
                bucketing_key: None,
                treatment: "on".to_string(),
                time,
                change_number: 1,
                label: "rule".to_string(),
                previous_time: None,
            },
        }
    }

    #[test]
    fn optimized_mode_forwards_only_the_first_of_identical_impressions() {
        let recorder = recorder(ImpressionsMode::Optimized);
        let meta = metadata("a");
        let stored: Vec<_> = (0..100)
            .map(|n| stored(&meta, "x", "u", 1_000 + n))
            .collect();

        let grouped = recorder.dedup_and_group(stored);
        let impressions = &grouped[&meta]["x"];
        assert_eq!(impressions.len(), 1);
        assert_eq!(impressions[0].previous_time, None);

        // The 99 suppressed repeats show up as one counter entry.
        let counts = recorder.counter.pop_all().per_feature;
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].feature, "x");
        assert_eq!(counts[0].count, 99);
    }

    #[test]
    fn debug_mode_forwards_repeats_with_previous_time() {
        let recorder = recorder(ImpressionsMode::Debug);
        let meta = metadata("a");
        let grouped = recorder.dedup_and_group(vec![
            stored(&meta, "x", "u", 1_000),
            stored(&meta, "x", "u", 2_000),
        ]);

        let impressions = &grouped[&meta]["x"];
        assert_eq!(impressions.len(), 2);
        assert_eq!(impressions[0].previous_time, None);
        assert_eq!(impressions[1].previous_time, Some(1_000));
        assert_eq!(recorder.counter.pop_all().per_feature[0].count, 1);
    }

    #[test]
    fn distinct_identities_group_separately() {
        let recorder = recorder(ImpressionsMode::Optimized);
        let meta_a = metadata("a");
        let meta_b = metadata("b");
        let grouped = recorder.dedup_and_group(vec![
            stored(&meta_a, "x", "u1", 1_000),
            stored(&meta_b, "x", "u2", 1_000),
            stored(&meta_a, "y", "u1", 1_000),
        ]);

        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&meta_a].len(), 2);
        assert_eq!(grouped[&meta_b].len(), 1);
    }

    #[test]
    fn impressions_without_identity_are_dropped() {
        let recorder = recorder(ImpressionsMode::Optimized);
        let anonymous = Metadata {
            sdk_version: String::new(),
            machine_ip: "10.0.0.1".to_string(),
            machine_name: String::new(),
        };
        let grouped = recorder.dedup_and_group(vec![stored(&anonymous, "x", "u", 1_000)]);
        assert!(grouped.is_empty());
    }

    #[tokio::test]
    async fn second_flush_is_rejected_while_first_holds_the_gate() {
        let recorder = recorder(ImpressionsMode::Optimized);
        assert!(recorder.gate.request(OperationKind::Impressions));

        let result = recorder.flush().await;
        match result {
            Err(FlushError::Busy(busy)) => assert_eq!(busy.0, OperationKind::Impressions),
            other => panic!("expected OperationBusy, got {other:?}"),
        }
        recorder.gate.finish(OperationKind::Impressions);
    }

    #[test]
    fn enqueue_flattens_bulks() {
        let recorder = recorder(ImpressionsMode::Optimized);
        let meta = metadata("a");
        recorder.enqueue(
            meta,
            vec![TestImpressions {
                test_name: "x".to_string(),
                key_impressions: vec![
                    stored(&metadata("a"), "x", "u1", 1).impression,
                    stored(&metadata("a"), "x", "u2", 2).impression,
                ],
            }],
        );
        assert_eq!(recorder.queue_len(), 2);
    }
}
