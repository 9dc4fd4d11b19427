//! Periodic push of the relay's own runtime telemetry upstream.

use std::sync::Arc;
use std::time::Duration;

use flagrelay_lib::{OperationGate, OperationKind, ProxyTelemetry};
use serde::Serialize;

use crate::server::config::SyncConfig;
use crate::server::error::UpstreamError;
use crate::server::upstream::{relay_metadata, with_retries, EventsClient};

const METRICS_TIMES_PATH: &str = "/metrics/times";
const METRICS_COUNTERS_PATH: &str = "/metrics/counters";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LatenciesEntry {
    name: &'static str,
    latencies: Vec<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CounterEntry {
    name: String,
    delta: u64,
}

pub struct TelemetryRecorder {
    telemetry: Arc<ProxyTelemetry>,
    client: Arc<EventsClient>,
    gate: Arc<OperationGate>,
    retry_attempts: u32,
    retry_base: Duration,
}

impl TelemetryRecorder {
    pub fn new(
        telemetry: Arc<ProxyTelemetry>,
        client: Arc<EventsClient>,
        gate: Arc<OperationGate>,
        sync: &SyncConfig,
    ) -> Self {
        TelemetryRecorder {
            telemetry,
            client,
            gate,
            retry_attempts: sync.retry_attempts,
            retry_base: Duration::from_millis(sync.retry_base_ms),
        }
    }

    /// Push global latency rings and status-code counters upstream.
    /// Skipped when another telemetry operation holds the gate.
    pub async fn flush(&self) -> Result<(), UpstreamError> {
        if self.gate.is_running(OperationKind::Telemetry)
            || !self.gate.request(OperationKind::Telemetry)
        {
            tracing::debug!("telemetry flush already running, skipping");
            return Ok(());
        }
        let result = self.flush_inner().await;
        self.gate.finish(OperationKind::Telemetry);
        result
    }

    async fn flush_inner(&self) -> Result<(), UpstreamError> {
        let metadata = relay_metadata();

        let times: Vec<LatenciesEntry> = self
            .telemetry
            .global_latencies()
            .into_iter()
            .filter(|(_, latencies)| !latencies.is_empty())
            .map(|(name, latencies)| LatenciesEntry { name, latencies })
            .collect();
        if !times.is_empty() {
            with_retries(self.retry_attempts, self.retry_base, || {
                self.client
                    .post_json(METRICS_TIMES_PATH, &metadata, None, &times)
            })
            .await?;
        }

        let counters: Vec<CounterEntry> = self
            .telemetry
            .global_status_codes()
            .into_iter()
            .flat_map(|(name, codes)| {
                codes.into_iter().map(move |(status, delta)| CounterEntry {
                    name: format!("{name}.status.{status}"),
                    delta,
                })
            })
            .filter(|entry| entry.delta > 0)
            .collect();
        if !counters.is_empty() {
            with_retries(self.retry_attempts, self.retry_base, || {
                self.client
                    .post_json(METRICS_COUNTERS_PATH, &metadata, None, &counters)
            })
            .await?;
        }

        Ok(())
    }
}
