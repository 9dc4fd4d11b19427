//! Event pipeline: same bulk-by-identity grouping and retry policy as the
//! impression pipeline, without dedup or counting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use flagrelay_lib::{Event, Metadata, OperationBusy, OperationGate, OperationKind};

use crate::server::config::{EventsConfig, SyncConfig};
use crate::server::error::{FlushError, UpstreamError};
use crate::server::metrics::metrics;
use crate::server::queue::{BoundedQueue, StoredEvent};
use crate::server::upstream::{with_retries, EventsClient};

const EVENTS_BULK_PATH: &str = "/events/bulk";

pub struct EventsRecorder {
    queue: BoundedQueue<StoredEvent>,
    client: Arc<EventsClient>,
    gate: Arc<OperationGate>,
    bulk_size: usize,
    retry_attempts: u32,
    retry_base: Duration,
}

impl EventsRecorder {
    pub fn new(
        config: &EventsConfig,
        sync: &SyncConfig,
        client: Arc<EventsClient>,
        gate: Arc<OperationGate>,
    ) -> Self {
        EventsRecorder {
            queue: BoundedQueue::new(config.queue_size),
            client,
            gate,
            bulk_size: config.bulk_size,
            retry_attempts: sync.retry_attempts,
            retry_base: Duration::from_millis(sync.retry_base_ms),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn enqueue(&self, metadata: Metadata, events: Vec<Event>) {
        for event in events {
            let stored = StoredEvent {
                metadata: metadata.clone(),
                event,
            };
            if self.queue.push(stored).is_err() {
                metrics().queue_dropped.with_label_values(&["events"]).inc();
            }
        }
        metrics()
            .queue_size
            .with_label_values(&["events"])
            .set(self.queue.len() as i64);
    }

    pub async fn synchronize(&self) -> Result<usize, FlushError> {
        if self.gate.is_running(OperationKind::Events) || !self.gate.request(OperationKind::Events)
        {
            tracing::debug!("events flush in progress, skipping scheduled sync");
            return Ok(0);
        }
        let result = self.drain_once().await;
        self.gate.finish(OperationKind::Events);
        Ok(result?)
    }

    pub async fn flush(&self) -> Result<usize, FlushError> {
        if !self.gate.request(OperationKind::Events) {
            return Err(OperationBusy(OperationKind::Events).into());
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
        self.gate.finish(OperationKind::Events);
        metrics()
            .flush_duration
            .with_label_values(&["events"])
            .observe(timer.elapsed().as_secs_f64());
        result
    }

    async fn drain_once(&self) -> Result<usize, UpstreamError> {
        let stored = self.queue.pop_n(self.bulk_size);
        metrics()
            .queue_size
            .with_label_values(&["events"])
            .set(self.queue.len() as i64);
        if stored.is_empty() {
            return Ok(0);
        }

        let mut sent = 0;
        for (metadata, events) in group_by_identity(stored) {
            let count = events.len();
            let outcome = with_retries(self.retry_attempts, self.retry_base, || {
                self.client.post_json(EVENTS_BULK_PATH, &metadata, None, &events)
            })
            .await;
            match outcome {
                Ok(()) => {
                    sent += count;
                    metrics()
                        .posts_total
                        .with_label_values(&["events", "ok"])
                        .inc();
                }
                Err(err) => {
                    metrics()
                        .posts_total
                        .with_label_values(&["events", "error"])
                        .inc();
                    return Err(err);
                }
            }
        }
        Ok(sent)
    }
}

/// Group by origin identity, dropping events without one and defaulting the
/// machine name to `"unknown"`.
fn group_by_identity(stored: Vec<StoredEvent>) -> HashMap<Metadata, Vec<Event>> {
    let mut grouped: HashMap<Metadata, Vec<Event>> = HashMap::new();
    for item in stored {
        if item.metadata.sdk_version.is_empty() || item.metadata.machine_ip.is_empty() {
            continue;
        }
        let identity = Metadata {
            machine_name: item.metadata.machine_name_or_unknown().to_string(),
            ..item.metadata
        };
        grouped.entry(identity).or_default().push(item.event);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str) -> Event {
        Event {
            event_type_id: event_type.to_string(),
            traffic_type_name: "user".to_string(),
            key: "u1".to_string(),
            value: Some(1.5),
            timestamp: 1_000,
            properties: None,
        }
    }

    fn stored(sdk_version: &str, machine_ip: &str, machine_name: &str, event_type: &str) -> StoredEvent {
        StoredEvent {
            metadata: Metadata {
                sdk_version: sdk_version.to_string(),
                machine_ip: machine_ip.to_string(),
                machine_name: machine_name.to_string(),
            },
            event: event(event_type),
        }
    }

    #[test]
    fn events_without_identity_are_skipped() {
        let grouped = group_by_identity(vec![
            stored("", "10.0.0.1", "host", "a"),
            stored("rust-1.0.0", "", "host", "b"),
            stored("rust-1.0.0", "10.0.0.1", "host", "c"),
        ]);
        assert_eq!(grouped.len(), 1);
        let events = grouped.values().next().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type_id, "c");
    }

    #[test]
    fn machine_name_defaults_to_unknown_for_grouping() {
        let grouped = group_by_identity(vec![
            stored("rust-1.0.0", "10.0.0.1", "", "a"),
            stored("rust-1.0.0", "10.0.0.1", "unknown", "b"),
        ]);
        // Both land under the same identity.
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped.values().next().unwrap().len(), 2);
    }

    #[test]
    fn distinct_identities_stay_separate() {
        let grouped = group_by_identity(vec![
            stored("rust-1.0.0", "10.0.0.1", "host-a", "a"),
            stored("rust-1.1.0", "10.0.0.1", "host-a", "b"),
        ]);
        assert_eq!(grouped.len(), 2);
    }
}
