//! Middleware recording latency and status per SDK-facing endpoint into the
//! endpoint-telemetry structure.

use std::sync::Arc;

use axum::extract::{MatchedPath, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use flagrelay_lib::Endpoint;

use super::state::AppState;

/// Map a matched route template to its stable endpoint identifier.
/// Admin and operational routes are not part of the SDK surface and are
/// tracked by the prometheus layer only.
pub fn endpoint_for_route(route: &str) -> Option<Endpoint> {
    match route {
        "/splitChanges" => Some(Endpoint::SplitChanges),
        "/segmentChanges/{name}" => Some(Endpoint::SegmentChanges),
        "/mySegments/{key}" => Some(Endpoint::MySegments),
        "/testImpressions/bulk" => Some(Endpoint::ImpressionsBulk),
        "/testImpressions/count" => Some(Endpoint::ImpressionsCount),
        "/events/bulk" => Some(Endpoint::EventsBulk),
        "/metrics/times" => Some(Endpoint::MetricsTimes),
        "/metrics/counters" => Some(Endpoint::MetricsCounters),
        "/metrics/gauge" => Some(Endpoint::MetricsGauge),
        "/metrics/counter" => Some(Endpoint::MetricsCounter),
        "/metrics/time" => Some(Endpoint::MetricsTime),
        _ => None,
    }
}

pub async fn track_endpoints(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string());

    let start = std::time::Instant::now();
    let response = next.run(request).await;

    if let Some(endpoint) = route.as_deref().and_then(endpoint_for_route) {
        let latency_ms = start.elapsed().as_millis() as i64;
        state
            .telemetry
            .record(endpoint, response.status().as_u16(), latency_ms);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdk_routes_map_to_endpoints() {
        assert_eq!(
            endpoint_for_route("/splitChanges"),
            Some(Endpoint::SplitChanges)
        );
        assert_eq!(
            endpoint_for_route("/segmentChanges/{name}"),
            Some(Endpoint::SegmentChanges)
        );
        assert_eq!(
            endpoint_for_route("/testImpressions/bulk"),
            Some(Endpoint::ImpressionsBulk)
        );
    }

    #[test]
    fn operational_routes_are_not_tracked() {
        assert_eq!(endpoint_for_route("/metrics"), None);
        assert_eq!(endpoint_for_route("/admin/stats"), None);
        assert_eq!(endpoint_for_route("/health"), None);
    }
}
