use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::Request,
    middleware::Next,
    response::Response,
};

use crate::infra::stats::Stats;

/// Records request counts, per-route counters, latency and the status-code
/// histogram for `/stats`.
pub async fn record_request_stats(
    State(stats): State<Arc<Stats>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    // The matched route pattern keeps label cardinality bounded; raw paths
    // only appear for unrouted requests.
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let response = next.run(request).await;

    stats.increment("requests_total");
    stats.increment(&format!("{method} {route}"));
    stats.record_status(response.status().as_u16());
    stats.measure_since("request", started);

    response
}
