//! Scheduled synchronization against the upstream authority: split and
//! segment fetch loops, recorder drains and the telemetry push, each a
//! long-lived task observing the shutdown channel at every turn.

pub mod push;

use std::sync::Arc;
use std::time::Duration;

use flagrelay_lib::{OperationKind, SplitStatus};
use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::error::UpstreamError;
use super::metrics::metrics;
use super::state::AppState;
use super::upstream::with_retries;

/// Fetch split changes once and apply them. Skipped when another splits
/// operation holds the gate.
pub async fn sync_splits_once(state: &AppState) -> Result<(), UpstreamError> {
    // Scheduled work never contends: peek first, then claim the gate so a
    // flush cannot start mid-fetch.
    if state.gate.is_running(OperationKind::Splits) || !state.gate.request(OperationKind::Splits) {
        tracing::debug!("splits operation already running, skipping tick");
        return Ok(());
    }
    let result = fetch_and_apply_splits(state).await;
    state.gate.finish(OperationKind::Splits);
    record_sync_outcome("splits", &result);
    result
}

async fn fetch_and_apply_splits(state: &AppState) -> Result<(), UpstreamError> {
    let since = state.splits.change_number();
    let attempts = state.config.sync.retry_attempts;
    let base = Duration::from_millis(state.config.sync.retry_base_ms);
    let timer = std::time::Instant::now();

    let changes = with_retries(attempts, base, || {
        state.sdk_client.fetch_split_changes(since)
    })
    .await?;

    metrics()
        .sync_duration
        .with_label_values(&["splits"])
        .observe(timer.elapsed().as_secs_f64());

    if changes.till == since {
        return Ok(());
    }
    // Monotone updates only; a stale till is discarded.
    if changes.till < since {
        tracing::debug!(till = changes.till, since, "discarding stale split changes");
        return Ok(());
    }

    let mut to_add = Vec::new();
    let mut to_remove = Vec::new();
    for split in changes.splits {
        match split.status {
            SplitStatus::Active => to_add.push(split),
            SplitStatus::Archived => to_remove.push(split),
        }
    }
    state.splits.update(to_add, to_remove, changes.till);
    Ok(())
}

/// Fetch deltas for every segment referenced by an active split.
pub async fn sync_segments_once(state: &AppState) -> Result<(), UpstreamError> {
    if state.gate.is_running(OperationKind::Segments)
        || !state.gate.request(OperationKind::Segments)
    {
        tracing::debug!("segments operation already running, skipping tick");
        return Ok(());
    }
    let mut result = Ok(());
    for name in state.splits.referenced_segments() {
        if let Err(err) = fetch_and_apply_segment(state, &name).await {
            tracing::warn!(segment = %name, error = %err, "segment sync failed");
            result = Err(err);
        }
    }
    state.gate.finish(OperationKind::Segments);
    record_sync_outcome("segments", &result);
    result
}

/// Targeted fetch of a single segment, used by the push listener.
pub async fn fetch_and_apply_segment(state: &AppState, name: &str) -> Result<(), UpstreamError> {
    let since = state.segments.change_number(name);
    let attempts = state.config.sync.retry_attempts;
    let base = Duration::from_millis(state.config.sync.retry_base_ms);

    let changes = with_retries(attempts, base, || {
        state.sdk_client.fetch_segment_changes(name, since)
    })
    .await?;

    if changes.till <= since {
        return Ok(());
    }
    state
        .segments
        .update(name, changes.added, changes.removed, changes.till);
    Ok(())
}

fn record_sync_outcome(resource: &str, result: &Result<(), UpstreamError>) {
    match result {
        Ok(()) => {
            metrics()
                .sync_total
                .with_label_values(&[resource, "ok"])
                .inc();
        }
        Err(err) => {
            metrics()
                .sync_total
                .with_label_values(&[resource, "error"])
                .inc();
            if err.is_auth_failure() {
                tracing::error!(resource, error = %err, "upstream rejected the api key");
            } else {
                tracing::warn!(resource, error = %err, "sync failed");
            }
        }
    }
}

/// Randomized startup delay so a fleet of relays does not align its fetches.
fn startup_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    rand::thread_rng().gen_range(Duration::ZERO..max)
}

/// Spawn every periodic worker. Each one stops at the next loop turn after
/// the shutdown channel fires.
pub fn spawn_workers(
    state: Arc<AppState>,
    shutdown: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    handles.push(spawn_loop(
        Arc::clone(&state),
        shutdown.subscribe(),
        Duration::from_secs(state.config.sync.splits_refresh_secs),
        |state| async move {
            let _ = sync_splits_once(&state).await;
        },
    ));

    handles.push(spawn_loop(
        Arc::clone(&state),
        shutdown.subscribe(),
        Duration::from_secs(state.config.sync.segments_refresh_secs),
        |state| async move {
            let _ = sync_segments_once(&state).await;
        },
    ));

    handles.push(spawn_loop(
        Arc::clone(&state),
        shutdown.subscribe(),
        Duration::from_secs(state.config.impressions.post_secs),
        |state| async move {
            if let Err(err) = state.impressions.synchronize().await {
                tracing::warn!(error = %err, "impressions sync failed");
            }
        },
    ));

    handles.push(spawn_loop(
        Arc::clone(&state),
        shutdown.subscribe(),
        Duration::from_secs(state.config.impressions.counts_post_secs),
        |state| async move {
            if let Err(err) = state.impressions.flush_counts().await {
                tracing::warn!(error = %err, "impression counts flush failed");
            }
        },
    ));

    handles.push(spawn_loop(
        Arc::clone(&state),
        shutdown.subscribe(),
        Duration::from_secs(state.config.events.post_secs),
        |state| async move {
            if let Err(err) = state.events.synchronize().await {
                tracing::warn!(error = %err, "events sync failed");
            }
        },
    ));

    handles.push(spawn_loop(
        Arc::clone(&state),
        shutdown.subscribe(),
        Duration::from_secs(state.config.sync.telemetry_refresh_secs),
        |state| async move {
            if let Err(err) = state.telemetry_recorder.flush().await {
                tracing::warn!(error = %err, "telemetry flush failed");
            }
        },
    ));

    if let Some(streaming_url) = state.config.upstream.streaming_url.clone() {
        let push_state = Arc::clone(&state);
        let rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            push::run_push_listener(push_state, streaming_url, rx).await;
        }));
    }

    if let Some(queue) = state.impressions.listener_queue() {
        if let Some(url) = state.config.impressions.listener_url.clone() {
            let rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                super::recorders::impressions::run_listener_relay(queue, url, rx).await;
            }));
        }
    }

    handles
}

fn spawn_loop<F, Fut>(
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
    period: Duration,
    work: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<AppState>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let jitter = startup_jitter(period.min(Duration::from_secs(5)));
        tokio::select! {
            _ = tokio::time::sleep(jitter) => {}
            _ = shutdown.recv() => return,
        }
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => work(Arc::clone(&state)).await,
                _ = shutdown.recv() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_below_its_bound() {
        let max = Duration::from_secs(5);
        for _ in 0..50 {
            assert!(startup_jitter(max) < max);
        }
        assert_eq!(startup_jitter(Duration::ZERO), Duration::ZERO);
    }
}
