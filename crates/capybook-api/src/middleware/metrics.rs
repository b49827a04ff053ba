//! Metrics tracking middleware
//!
//! Tracks request latency, counts, and status codes for the `/metrics`
//! endpoint.

use crate::state::AppState;
use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;

/// Metrics tracking middleware
///
/// Records per endpoint:
/// - request count by status code
/// - latency sum and maximum
pub async fn metrics_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let endpoint = endpoint_label(&request);

    let response = next.run(request).await;

    let latency_us = start.elapsed().as_micros() as u64;
    let status = response.status().as_u16();

    // Record off the response path
    tokio::spawn(async move {
        state.record_request(endpoint, status, latency_us).await;
    });

    response
}

/// Series label for a request: the route template it matched
///
/// `/api/v1/users/alice` and `/api/v1/users/bob` both count under
/// `/api/v1/users/:username`. Requests no route matched share one series.
fn endpoint_label(request: &Request) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED.to_string())
}

/// Label for requests that hit the fallback
pub const UNMATCHED: &str = "unmatched";
