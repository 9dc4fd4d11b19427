//! SDK-facing read handlers, answered from the local mirror.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use flagrelay_lib::{MySegment, SummaryNotCached};

// ── GET /splitChanges ────────────────────────────────────────

pub async fn handle_split_changes(
    State(state): State<Arc<super::state::AppState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let since = parse_since(&query);

    match state.splits.changes_since(since) {
        Ok(changes) => (StatusCode::OK, Json(changes)).into_response(),
        Err(SummaryNotCached) => {
            // The requested since predates the recipe window: fall back to
            // a direct upstream fetch and cache the result for the next
            // poll with the same since.
            match state.sdk_client.fetch_split_changes(since).await {
                Ok(changes) => {
                    state.splits.register_older_cn(&changes);
                    (StatusCode::OK, Json(changes)).into_response()
                }
                Err(err) => {
                    tracing::warn!(since, error = %err, "fallback split fetch failed");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(serde_json::json!({"error": err.to_string()})),
                    )
                        .into_response()
                }
            }
        }
    }
}

// ── GET /segmentChanges/{name} ───────────────────────────────

pub async fn handle_segment_changes(
    State(state): State<Arc<super::state::AppState>>,
    Path(name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let since = parse_since(&query);

    match state.segments.changes_since(&name, since) {
        Some(changes) => (StatusCode::OK, Json(changes)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("segment {name} not found")})),
        )
            .into_response(),
    }
}

// ── GET /mySegments/{key} ────────────────────────────────────

pub async fn handle_my_segments(
    State(state): State<Arc<super::state::AppState>>,
    Path(key): Path<String>,
) -> Response {
    let segments: Vec<MySegment> = state
        .segments
        .segments_for(&key)
        .into_iter()
        .map(|name| MySegment { name })
        .collect();
    (
        StatusCode::OK,
        Json(serde_json::json!({"mySegments": segments})),
    )
        .into_response()
}

fn parse_since(query: &HashMap<String, String>) -> i64 {
    query
        .get("since")
        .and_then(|value| value.parse().ok())
        .unwrap_or(-1)
}
