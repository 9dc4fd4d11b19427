//! SDK-facing write handlers: impressions, counts and events go into the
//! bounded queues; SDK metric payloads are relayed upstream verbatim.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use flagrelay_lib::{Event, ImpressionCounts, Metadata, TestImpressions};

use super::state::AppState;

const SDK_VERSION_HEADER: &str = "SplitSDKVersion";
const MACHINE_IP_HEADER: &str = "SplitSDKMachineIP";
const MACHINE_NAME_HEADER: &str = "SplitSDKMachineName";

/// Extract the origin identity from the SDK-supplied headers.
pub fn metadata_from_headers(headers: &HeaderMap) -> Metadata {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    Metadata {
        sdk_version: get(SDK_VERSION_HEADER),
        machine_ip: get(MACHINE_IP_HEADER),
        machine_name: get(MACHINE_NAME_HEADER),
    }
}

// ── POST /testImpressions/bulk ───────────────────────────────

pub async fn handle_impressions_bulk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(bulks): Json<Vec<TestImpressions>>,
) -> Response {
    let metadata = metadata_from_headers(&headers);
    state.impressions.enqueue(metadata, bulks);
    StatusCode::OK.into_response()
}

// ── POST /testImpressions/count ──────────────────────────────

pub async fn handle_impressions_count(
    State(state): State<Arc<AppState>>,
    Json(counts): Json<ImpressionCounts>,
) -> Response {
    state.impressions.absorb_counts(counts);
    StatusCode::OK.into_response()
}

// ── POST /events/bulk ────────────────────────────────────────

pub async fn handle_events_bulk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(events): Json<Vec<Event>>,
) -> Response {
    let metadata = metadata_from_headers(&headers);
    state.events.enqueue(metadata, events);
    StatusCode::OK.into_response()
}

// ── POST /metrics/{times,counters,gauge,counter,time} ────────

/// Relay an SDK metric payload upstream with the caller's identity headers.
async fn relay_metrics(state: &AppState, suffix: &str, headers: HeaderMap, body: Bytes) -> Response {
    let metadata = metadata_from_headers(&headers);
    let path = format!("/metrics/{suffix}");
    match state
        .events_client
        .post_raw(&path, &metadata, body.to_vec())
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            tracing::warn!(path = %path, error = %err, "metrics relay failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}

pub async fn handle_metrics_times(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_metrics(&state, "times", headers, body).await
}

pub async fn handle_metrics_counters(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_metrics(&state, "counters", headers, body).await
}

pub async fn handle_metrics_gauge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_metrics(&state, "gauge", headers, body).await
}

pub async fn handle_metrics_counter(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_metrics(&state, "counter", headers, body).await
}

pub async fn handle_metrics_time(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_metrics(&state, "time", headers, body).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_is_read_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(SDK_VERSION_HEADER, "rust-1.2.3".parse().unwrap());
        headers.insert(MACHINE_IP_HEADER, "10.1.2.3".parse().unwrap());
        headers.insert(MACHINE_NAME_HEADER, "edge-7".parse().unwrap());

        let metadata = metadata_from_headers(&headers);
        assert_eq!(metadata.sdk_version, "rust-1.2.3");
        assert_eq!(metadata.machine_ip, "10.1.2.3");
        assert_eq!(metadata.machine_name, "edge-7");
    }

    #[test]
    fn missing_headers_become_empty_strings() {
        let metadata = metadata_from_headers(&HeaderMap::new());
        assert_eq!(metadata.sdk_version, "");
        assert_eq!(metadata.machine_ip, "");
        assert_eq!(metadata.machine_name, "");
    }
}
