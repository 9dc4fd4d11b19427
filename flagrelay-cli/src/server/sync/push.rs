//! Push-driven invalidation: a background task holding an SSE connection to
//! the upstream notification stream. Every notification is a hint that
//! triggers a targeted pull; nothing is applied from the payload alone, so
//! a lossy channel only delays convergence until the next scheduled fetch.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::broadcast;

use super::{fetch_and_apply_segment, sync_splits_once};
use crate::server::state::AppState;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum Notification {
    #[serde(rename = "SPLIT_UPDATE", rename_all = "camelCase")]
    SplitUpdate { change_number: i64 },
    #[serde(rename = "SPLIT_KILL", rename_all = "camelCase")]
    SplitKill {
        change_number: i64,
        split_name: String,
        default_treatment: String,
    },
    #[serde(rename = "SEGMENT_UPDATE", rename_all = "camelCase")]
    SegmentUpdate {
        change_number: i64,
        segment_name: String,
    },
}

/// Background task that consumes upstream notifications and triggers
/// targeted fetches. Reconnects with exponential backoff on failure.
pub async fn run_push_listener(
    state: Arc<AppState>,
    streaming_url: String,
    mut shutdown: broadcast::Receiver<()>,
) {
    let client = reqwest::Client::new();
    let mut backoff = Duration::from_secs(1);
    let max_backoff = Duration::from_secs(30);

    loop {
        let request = client
            .get(&streaming_url)
            .bearer_auth(&state.config.upstream.apikey)
            .header("Accept", "text/event-stream");

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                backoff = Duration::from_secs(1); // reset on success
                tracing::info!(url = %streaming_url, "connected to upstream event stream");

                let mut stream = response.bytes_stream();
                let mut buffer = String::new();

                loop {
                    let chunk = tokio::select! {
                        chunk = stream.next() => chunk,
                        _ = shutdown.recv() => return,
                    };
                    let chunk = match chunk {
                        Some(Ok(chunk)) => chunk,
                        Some(Err(err)) => {
                            tracing::warn!(error = %err, "event stream error");
                            break;
                        }
                        None => break,
                    };
                    let Ok(text) = std::str::from_utf8(&chunk) else {
                        continue;
                    };
                    buffer.push_str(text);

                    // Process complete SSE lines.
                    while let Some(newline) = buffer.find('\n') {
                        let line = buffer[..newline].trim_end_matches('\r').to_string();
                        buffer = buffer[newline + 1..].to_string();

                        if let Some(data) = line.strip_prefix("data: ") {
                            match serde_json::from_str::<Notification>(data) {
                                Ok(notification) => {
                                    handle_notification(&state, notification).await;
                                }
                                Err(err) => {
                                    tracing::debug!(error = %err, "ignoring unparseable notification");
                                }
                            }
                        }
                    }
                }

                tracing::warn!("event stream ended, reconnecting");
            }
            Ok(response) => {
                tracing::warn!(
                    status = %response.status(),
                    "upstream event stream rejected connection, retrying in {backoff:?}"
                );
            }
            Err(err) => {
                tracing::warn!(error = %err, "event stream connection failed, retrying in {backoff:?}");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.recv() => return,
        }
        backoff = (backoff * 2).min(max_backoff);
    }
}

async fn handle_notification(state: &AppState, notification: Notification) {
    match notification {
        Notification::SplitUpdate { change_number } => {
            if change_number > state.splits.change_number() {
                let _ = sync_splits_once(state).await;
            }
        }
        Notification::SplitKill {
            change_number,
            split_name,
            default_treatment,
        } => {
            state
                .splits
                .kill_locally(&split_name, &default_treatment, change_number);
            if change_number > state.splits.change_number() {
                let _ = sync_splits_once(state).await;
            }
        }
        Notification::SegmentUpdate {
            change_number,
            segment_name,
        } => {
            if change_number > state.segments.change_number(&segment_name) {
                if let Err(err) = fetch_and_apply_segment(state, &segment_name).await {
                    tracing::warn!(segment = %segment_name, error = %err, "push-triggered segment fetch failed");
                }
            }
        }
    }
}
