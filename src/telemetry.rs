//! Endpoint telemetry: a global layer (latest latencies + status-code
//! counters per endpoint) and a timesliced layer bucketing the same data
//! into fixed-width epoch-aligned windows with bounded retention.
//!
//! Synchronization is split the same way the data is: a coarse mutex guards
//! bucket lookup, creation and eviction; the slots inside a bucket are
//! atomics and never take that lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Latencies retained per endpoint (overwrite-oldest).
pub const LATENCY_SLOTS: usize = 500;

/// Default timeslice width, in seconds.
pub const DEFAULT_TIMESLICE_WIDTH_SECS: i64 = 60;

/// Default number of retained timeslices.
pub const DEFAULT_MAX_TIMESLICES: usize = 30;

/// Stable identifiers for the proxy's HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    SplitChanges,
    SegmentChanges,
    MySegments,
    ImpressionsBulk,
    ImpressionsCount,
    EventsBulk,
    MetricsTimes,
    MetricsCounters,
    MetricsGauge,
    MetricsCounter,
    MetricsTime,
}

pub const ENDPOINT_COUNT: usize = 11;

pub const ALL_ENDPOINTS: [Endpoint; ENDPOINT_COUNT] = [
    Endpoint::SplitChanges,
    Endpoint::SegmentChanges,
    Endpoint::MySegments,
    Endpoint::ImpressionsBulk,
    Endpoint::ImpressionsCount,
    Endpoint::EventsBulk,
    Endpoint::MetricsTimes,
    Endpoint::MetricsCounters,
    Endpoint::MetricsGauge,
    Endpoint::MetricsCounter,
    Endpoint::MetricsTime,
];

impl Endpoint {
    fn index(self) -> usize {
        match self {
            Endpoint::SplitChanges => 0,
            Endpoint::SegmentChanges => 1,
            Endpoint::MySegments => 2,
            Endpoint::ImpressionsBulk => 3,
            Endpoint::ImpressionsCount => 4,
            Endpoint::EventsBulk => 5,
            Endpoint::MetricsTimes => 6,
            Endpoint::MetricsCounters => 7,
            Endpoint::MetricsGauge => 8,
            Endpoint::MetricsCounter => 9,
            Endpoint::MetricsTime => 10,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Endpoint::SplitChanges => "splitChanges",
            Endpoint::SegmentChanges => "segmentChanges",
            Endpoint::MySegments => "mySegments",
            Endpoint::ImpressionsBulk => "impressionsBulk",
            Endpoint::ImpressionsCount => "impressionsCount",
            Endpoint::EventsBulk => "eventsBulk",
            Endpoint::MetricsTimes => "metricsTimes",
            Endpoint::MetricsCounters => "metricsCounters",
            Endpoint::MetricsGauge => "metricsGauge",
            Endpoint::MetricsCounter => "metricsCounter",
            Endpoint::MetricsTime => "metricsTime",
        }
    }
}

/// Ring of the most recent latencies, written lock-free.
struct LatencyRing {
    slots: Vec<AtomicI64>,
    next: AtomicUsize,
}

impl LatencyRing {
    fn new() -> Self {
        LatencyRing {
            slots: (0..LATENCY_SLOTS).map(|_| AtomicI64::new(0)).collect(),
            next: AtomicUsize::new(0),
        }
    }

    fn record(&self, latency_ms: i64) {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        self.slots[idx].store(latency_ms, Ordering::Relaxed);
    }

    /// Readers may observe a torn view while writers are active; this is
    /// observability data, not truth.
    fn snapshot(&self) -> Vec<i64> {
        let written = self.next.load(Ordering::Relaxed).min(self.slots.len());
        self.slots[..written]
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect()
    }
}

/// Per-status-code counters. The map lock is only taken for writes when a
/// new status code shows up; increments on known codes are atomic.
struct StatusCodes {
    codes: RwLock<HashMap<u16, AtomicU64>>,
}

impl StatusCodes {
    fn new() -> Self {
        StatusCodes {
            codes: RwLock::new(HashMap::new()),
        }
    }

    fn incr(&self, status: u16) {
        {
            let codes = self.codes.read().expect("status code lock poisoned");
            if let Some(count) = codes.get(&status) {
                count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let mut codes = self.codes.write().expect("status code lock poisoned");
        codes
            .entry(status)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    fn peek(&self) -> HashMap<u16, u64> {
        let codes = self.codes.read().expect("status code lock poisoned");
        codes
            .iter()
            .map(|(status, count)| (*status, count.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Latency ring + status counters for one endpoint.
struct EndpointStats {
    latencies: LatencyRing,
    statuses: StatusCodes,
}

impl EndpointStats {
    fn new() -> Self {
        EndpointStats {
            latencies: LatencyRing::new(),
            statuses: StatusCodes::new(),
        }
    }
}

struct EndpointSet {
    per_endpoint: Vec<EndpointStats>,
}

impl EndpointSet {
    fn new() -> Self {
        EndpointSet {
            per_endpoint: (0..ENDPOINT_COUNT).map(|_| EndpointStats::new()).collect(),
        }
    }

    fn record(&self, endpoint: Endpoint, status: u16, latency_ms: i64) {
        let stats = &self.per_endpoint[endpoint.index()];
        stats.latencies.record(latency_ms);
        stats.statuses.incr(status);
    }
}

struct TimeSliceStats {
    time_slice: i64,
    endpoints: EndpointSet,
}

/// One resource entry of the timesliced report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReport {
    pub latencies: Vec<i64>,
    pub status_codes: HashMap<u16, u64>,
    pub request_count: u64,
}

/// All resources observed within one timeslice.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSliceReport {
    pub time_slice: i64,
    pub resources: HashMap<&'static str, ResourceReport>,
}

/// Global + timesliced endpoint telemetry.
pub struct ProxyTelemetry {
    global: EndpointSet,
    buckets: Mutex<BTreeMap<i64, Arc<TimeSliceStats>>>,
    width_secs: i64,
    max_time_slices: usize,
}

impl Default for ProxyTelemetry {
    fn default() -> Self {
        ProxyTelemetry::new(DEFAULT_TIMESLICE_WIDTH_SECS, DEFAULT_MAX_TIMESLICES)
    }
}

impl ProxyTelemetry {
    pub fn new(width_secs: i64, max_time_slices: usize) -> Self {
        ProxyTelemetry {
            global: EndpointSet::new(),
            buckets: Mutex::new(BTreeMap::new()),
            width_secs: width_secs.max(1),
            max_time_slices: max_time_slices.max(1),
        }
    }

    /// Record one handled request into both layers.
    pub fn record(&self, endpoint: Endpoint, status: u16, latency_ms: i64) {
        self.record_at(endpoint, status, latency_ms, unix_now());
    }

    /// Same as [`ProxyTelemetry::record`] with an explicit observation time.
    pub fn record_at(&self, endpoint: Endpoint, status: u16, latency_ms: i64, epoch_secs: i64) {
        self.global.record(endpoint, status, latency_ms);
        let bucket = self.bucket_for(epoch_secs);
        bucket.endpoints.record(endpoint, status, latency_ms);
    }

    fn bucket_for(&self, epoch_secs: i64) -> Arc<TimeSliceStats> {
        let time_slice = epoch_secs - epoch_secs.rem_euclid(self.width_secs);
        let mut buckets = self.buckets.lock().expect("telemetry bucket lock poisoned");
        let bucket = buckets
            .entry(time_slice)
            .or_insert_with(|| {
                Arc::new(TimeSliceStats {
                    time_slice,
                    endpoints: EndpointSet::new(),
                })
            })
            .clone();
        while buckets.len() > self.max_time_slices {
            let oldest = match buckets.keys().next().copied() {
                Some(key) => key,
                None => break,
            };
            buckets.remove(&oldest);
        }
        bucket
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets
            .lock()
            .expect("telemetry bucket lock poisoned")
            .len()
    }

    /// Latest metrics split into retained timeslices, oldest first. Only
    /// endpoints with at least one observed request appear.
    pub fn timesliced_report(&self) -> Vec<TimeSliceReport> {
        let snapshots: Vec<Arc<TimeSliceStats>> = {
            let buckets = self.buckets.lock().expect("telemetry bucket lock poisoned");
            buckets.values().cloned().collect()
        };

        snapshots
            .into_iter()
            .map(|bucket| {
                let mut resources = HashMap::new();
                for endpoint in ALL_ENDPOINTS {
                    let stats = &bucket.endpoints.per_endpoint[endpoint.index()];
                    let status_codes = stats.statuses.peek();
                    let request_count: u64 = status_codes.values().sum();
                    if request_count == 0 {
                        continue;
                    }
                    resources.insert(
                        endpoint.name(),
                        ResourceReport {
                            latencies: stats.latencies.snapshot(),
                            status_codes,
                            request_count,
                        },
                    );
                }
                TimeSliceReport {
                    time_slice: bucket.time_slice,
                    resources,
                }
            })
            .collect()
    }

    /// Global per-endpoint status-code counters.
    pub fn global_status_codes(&self) -> HashMap<&'static str, HashMap<u16, u64>> {
        ALL_ENDPOINTS
            .iter()
            .map(|endpoint| {
                let stats = &self.global.per_endpoint[endpoint.index()];
                (endpoint.name(), stats.statuses.peek())
            })
            .collect()
    }

    /// Global per-endpoint latency snapshots.
    pub fn global_latencies(&self) -> HashMap<&'static str, Vec<i64>> {
        ALL_ENDPOINTS
            .iter()
            .map(|endpoint| {
                let stats = &self.global.per_endpoint[endpoint.index()];
                (endpoint.name(), stats.latencies.snapshot())
            })
            .collect()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
