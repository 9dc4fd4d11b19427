use std::sync::OnceLock;

use axum::extract::MatchedPath;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Global metrics registry
static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// All application metrics
pub struct Metrics {
    // HTTP request metrics
    pub http_requests_total: IntCounterVec,
    pub http_request_duration: HistogramVec,

    // Sync metrics
    pub sync_total: IntCounterVec,
    pub sync_duration: HistogramVec,

    // Queue metrics
    pub queue_size: IntGaugeVec,
    pub queue_dropped: IntCounterVec,

    // Recorder metrics
    pub posts_total: IntCounterVec,
    pub flush_duration: HistogramVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

impl Metrics {
    fn new(registry: &Registry) -> Self {
        let http_requests_total = IntCounterVec::new(
            Opts::new("fr_http_requests_total", "Total number of HTTP requests"),
            &["method", "path", "status"],
        )
        .expect("failed to create http_requests_total metric");

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "fr_http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
            &["method", "path"],
        )
        .expect("failed to create http_request_duration metric");

        let sync_total = IntCounterVec::new(
            Opts::new("fr_sync_total", "Sync executions per resource and outcome"),
            &["resource", "status"],
        )
        .expect("failed to create sync_total metric");

        let sync_duration = HistogramVec::new(
            HistogramOpts::new("fr_sync_duration_seconds", "Duration of sync executions")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["resource"],
        )
        .expect("failed to create sync_duration metric");

        let queue_size = IntGaugeVec::new(
            Opts::new("fr_queue_size", "Current in-memory queue depth"),
            &["queue"],
        )
        .expect("failed to create queue_size metric");

        let queue_dropped = IntCounterVec::new(
            Opts::new("fr_queue_dropped_total", "Items rejected by a full queue"),
            &["queue"],
        )
        .expect("failed to create queue_dropped metric");

        let posts_total = IntCounterVec::new(
            Opts::new("fr_posts_total", "Upstream bulk posts per resource and outcome"),
            &["resource", "status"],
        )
        .expect("failed to create posts_total metric");

        let flush_duration = HistogramVec::new(
            HistogramOpts::new("fr_flush_duration_seconds", "Duration of bulk flushes")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["resource"],
        )
        .expect("failed to create flush_duration metric");

        registry
            .register(Box::new(http_requests_total.clone()))
            .expect("register http_requests_total");
        registry
            .register(Box::new(http_request_duration.clone()))
            .expect("register http_request_duration");
        registry
            .register(Box::new(sync_total.clone()))
            .expect("register sync_total");
        registry
            .register(Box::new(sync_duration.clone()))
            .expect("register sync_duration");
        registry
            .register(Box::new(queue_size.clone()))
            .expect("register queue_size");
        registry
            .register(Box::new(queue_dropped.clone()))
            .expect("register queue_dropped");
        registry
            .register(Box::new(posts_total.clone()))
            .expect("register posts_total");
        registry
            .register(Box::new(flush_duration.clone()))
            .expect("register flush_duration");

        Self {
            http_requests_total,
            http_request_duration,
            sync_total,
            sync_duration,
            queue_size,
            queue_dropped,
            posts_total,
            flush_duration,
        }
    }
}

/// Get the global metrics instance, initializing on first call
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let registry = REGISTRY.get_or_init(Registry::new);
        Metrics::new(registry)
    })
}

/// Axum handler for GET /metrics — returns Prometheus text format
pub async fn handle_metrics() -> Response {
    let _ = metrics();
    let registry = REGISTRY.get_or_init(Registry::new);
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("encode metrics");
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Axum middleware that records HTTP request count and duration.
pub async fn track_metrics(request: Request<axum::body::Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let start = std::time::Instant::now();
    let response = next.run(request).await;
    let elapsed = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let m = metrics();
    m.http_requests_total
        .with_label_values(&[&method, &path, &status])
        .inc();
    m.http_request_duration
        .with_label_values(&[&method, &path])
        .observe(elapsed);

    response
}
