mod admin;
pub mod config;
pub mod error;
mod ingest;
mod metrics;
mod queue;
mod recorders;
mod routes;
mod state;
mod storage;
mod sync;
mod track;
mod upstream;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use flagrelay_lib::{OperationGate, ProxyTelemetry};
use tokio::sync::broadcast;
use tower_http::compression::CompressionLayer;

use self::config::RelayConfig;
use self::error::{ConfigError, UpstreamError};
use self::recorders::events::EventsRecorder;
use self::recorders::impressions::ImpressionsRecorder;
use self::recorders::telemetry::TelemetryRecorder;
use self::state::AppState;
use self::storage::disk::SnapshotStore;
use self::storage::{SegmentStorage, SplitStorage};
use self::upstream::{EventsClient, SdkClient};

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build upstream clients: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

impl ServeError {
    pub fn is_config(&self) -> bool {
        matches!(self, ServeError::Config(_))
    }
}

pub async fn run_serve(
    config_path: &str,
    port_arg: Option<u16>,
    hostname_arg: Option<String>,
) -> Result<(), ServeError> {
    // CLI args override config file values, which override defaults
    let mut config = RelayConfig::load(config_path)?;
    config.apply_env_overrides();
    if let Some(port) = port_arg {
        config.server.port = port;
    }
    if let Some(hostname) = hostname_arg {
        config.server.hostname = hostname;
    }
    config.validate()?;

    // A broken snapshot store is not fatal: the mirror stays in memory.
    let snapshot = match SnapshotStore::open(&config.server.data_dir) {
        Ok(store) => Some(Arc::new(store)),
        Err(err) => {
            tracing::warn!(data_dir = %config.server.data_dir, error = %err,
                "running without persistent snapshot");
            None
        }
    };

    let splits = Arc::new(SplitStorage::new(snapshot.clone()));
    let segments = Arc::new(SegmentStorage::new(snapshot));
    let telemetry = Arc::new(ProxyTelemetry::new(
        config.telemetry.timeslice_width_secs,
        config.telemetry.max_timeslices,
    ));
    let gate = Arc::new(OperationGate::new());
    let sdk_client = Arc::new(SdkClient::new(&config.upstream)?);
    let events_client = Arc::new(EventsClient::new(&config.upstream)?);

    let impressions = Arc::new(ImpressionsRecorder::new(
        &config.impressions,
        &config.sync,
        Arc::clone(&events_client),
        Arc::clone(&gate),
    ));
    let events = Arc::new(EventsRecorder::new(
        &config.events,
        &config.sync,
        Arc::clone(&events_client),
        Arc::clone(&gate),
    ));
    let telemetry_recorder = Arc::new(TelemetryRecorder::new(
        Arc::clone(&telemetry),
        Arc::clone(&events_client),
        Arc::clone(&gate),
        &config.sync,
    ));

    let addr = format!("{}:{}", config.server.hostname, config.server.port);
    let shutdown_grace = Duration::from_secs(config.server.shutdown_grace_secs);

    let state = Arc::new(AppState {
        config,
        splits,
        segments,
        telemetry,
        gate,
        sdk_client,
        events_client,
        impressions,
        events,
        telemetry_recorder,
        started_at: Instant::now(),
    });

    // Catch up from upstream before taking traffic; a failure here is
    // logged and the scheduled loops keep trying.
    if let Err(err) = sync::sync_splits_once(&state).await {
        tracing::warn!(error = %err, "initial split sync failed");
    }
    if let Err(err) = sync::sync_segments_once(&state).await {
        tracing::warn!(error = %err, "initial segment sync failed");
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let workers = sync::spawn_workers(Arc::clone(&state), &shutdown_tx);

    let app = Router::new()
        .route("/splitChanges", get(routes::handle_split_changes))
        .route("/segmentChanges/{name}", get(routes::handle_segment_changes))
        .route("/mySegments/{key}", get(routes::handle_my_segments))
        .route("/testImpressions/bulk", post(ingest::handle_impressions_bulk))
        .route("/testImpressions/count", post(ingest::handle_impressions_count))
        .route("/events/bulk", post(ingest::handle_events_bulk))
        .route("/metrics/times", post(ingest::handle_metrics_times))
        .route("/metrics/counters", post(ingest::handle_metrics_counters))
        .route("/metrics/gauge", post(ingest::handle_metrics_gauge))
        .route("/metrics/counter", post(ingest::handle_metrics_counter))
        .route("/metrics/time", post(ingest::handle_metrics_time))
        .route("/health", get(admin::handle_health))
        .route("/ready", get(admin::handle_ready))
        .route("/metrics", get(metrics::handle_metrics))
        .route("/admin/uptime", get(admin::handle_uptime))
        .route("/admin/version", get(admin::handle_version))
        .route("/admin/ping", get(admin::handle_ping))
        .route("/admin/stats", get(admin::handle_stats))
        .route("/admin/flush/impressions", post(admin::handle_flush_impressions))
        .route("/admin/flush/events", post(admin::handle_flush_events))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            track::track_endpoints,
        ))
        .layer(middleware::from_fn(metrics::track_metrics))
        .layer(CompressionLayer::new())
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServeError::Bind {
            addr: addr.clone(),
            source,
        })?;

    println!("flagrelay listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(termination_requested())
        .await
        .map_err(ServeError::Serve)?;

    // Stop the workers, then drain what the queues still hold within the
    // grace period.
    let _ = shutdown_tx.send(());
    let drain = async {
        if let Err(err) = state.impressions.flush().await {
            tracing::warn!(error = %err, "shutdown impression drain failed");
        }
        if let Err(err) = state.events.flush().await {
            tracing::warn!(error = %err, "shutdown event drain failed");
        }
        if let Err(err) = state.impressions.flush_counts().await {
            tracing::warn!(error = %err, "shutdown counts drain failed");
        }
    };
    if tokio::time::timeout(shutdown_grace, drain).await.is_err() {
        tracing::warn!("shutdown grace period expired with queued data remaining");
    }
    for worker in workers {
        worker.abort();
    }

    println!("flagrelay shut down cleanly");
    Ok(())
}

/// Resolves when the process is asked to terminate (ctrl-c, and SIGTERM on
/// unix). In-flight requests finish before the server returns.
async fn termination_requested() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "no SIGTERM handler, watching ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    let _ = tokio::signal::ctrl_c().await;

    tracing::info!("termination requested, draining");
}
