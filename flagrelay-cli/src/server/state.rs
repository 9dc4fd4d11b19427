use std::sync::Arc;
use std::time::Instant;

use flagrelay_lib::{OperationGate, ProxyTelemetry};

use super::config::RelayConfig;
use super::recorders::events::EventsRecorder;
use super::recorders::impressions::ImpressionsRecorder;
use super::recorders::telemetry::TelemetryRecorder;
use super::storage::{SegmentStorage, SplitStorage};
use super::upstream::{EventsClient, SdkClient};

/// Shared application state for the HTTP server and the sync engine.
///
/// Everything that used to be a process-wide singleton in services of this
/// shape (telemetry, storage handles, clients) is an explicit field here;
/// the only global state left is the metric registry.
pub struct AppState {
    pub config: RelayConfig,
    pub splits: Arc<SplitStorage>,
    pub segments: Arc<SegmentStorage>,
    pub telemetry: Arc<ProxyTelemetry>,
    pub gate: Arc<OperationGate>,
    pub sdk_client: Arc<SdkClient>,
    pub events_client: Arc<EventsClient>,
    pub impressions: Arc<ImpressionsRecorder>,
    pub events: Arc<EventsRecorder>,
    pub telemetry_recorder: Arc<TelemetryRecorder>,
    pub started_at: Instant,
}

impl AppState {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
