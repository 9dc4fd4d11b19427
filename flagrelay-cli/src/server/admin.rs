//! Operational surface: liveness, readiness, stats and user-triggered
//! flushes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use super::error::FlushError;
use super::state::AppState;

pub async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "splits": state.splits.split_count(),
    }))
}

/// Ready once the mirror holds a synced (or hydrated) state.
pub async fn handle_ready(State(state): State<Arc<AppState>>) -> Response {
    let change_number = state.splits.change_number();
    if change_number >= 0 {
        (
            StatusCode::OK,
            Json(serde_json::json!({"ready": true, "changeNumber": change_number})),
        )
            .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "ready": false,
                "reason": "no split state synced from upstream yet",
            })),
        )
            .into_response()
    }
}

pub async fn handle_uptime(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"uptime": state.uptime_secs()}))
}

pub async fn handle_version() -> Json<serde_json::Value> {
    Json(serde_json::json!({"version": env!("CARGO_PKG_VERSION")}))
}

pub async fn handle_ping() -> &'static str {
    "pong"
}

pub async fn handle_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "splits": {
            "changeNumber": state.splits.change_number(),
            "count": state.splits.split_count(),
        },
        "segments": {
            "count": state.segments.segment_count(),
        },
        "queues": {
            "impressions": state.impressions.queue_len(),
            "events": state.events.queue_len(),
        },
        "endpoints": state.telemetry.timesliced_report(),
    }))
}

// ── User-triggered flushes ───────────────────────────────────

pub async fn handle_flush_impressions(State(state): State<Arc<AppState>>) -> Response {
    flush_response("impressions", state.impressions.flush().await)
}

pub async fn handle_flush_events(State(state): State<Arc<AppState>>) -> Response {
    flush_response("events", state.events.flush().await)
}

fn flush_response(resource: &str, result: Result<usize, FlushError>) -> Response {
    match result {
        Ok(flushed) => (
            StatusCode::OK,
            Json(serde_json::json!({"flushed": flushed})),
        )
            .into_response(),
        Err(FlushError::Busy(busy)) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": busy.to_string()})),
        )
            .into_response(),
        Err(FlushError::Upstream(err)) => {
            tracing::warn!(resource, error = %err, "user-triggered flush failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}
