//! Health check and metrics handlers

use crate::state::AppState;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::fmt::Write;
use std::sync::Arc;
use utoipa::ToSchema;

/// Health check response
#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Liveness probe - basic health check
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Service is alive", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_secs(),
    })
}

/// Prometheus-compatible metrics endpoint
#[utoipa::path(
    get,
    path = "/metrics",
    tag = "health",
    responses(
        (status = 200, description = "Prometheus text exposition", content_type = "text/plain")
    )
)]
pub async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = state.uptime_secs();
    let total_requests = state.get_request_count();
    let (anonymous, resolved, rejected) = state.auth_outcome_counts();

    let mut output = String::new();

    output.push_str("# HELP capybook_uptime_seconds Time since server start\n");
    output.push_str("# TYPE capybook_uptime_seconds gauge\n");
    let _ = writeln!(output, "capybook_uptime_seconds {uptime}\n");

    output.push_str("# HELP capybook_requests_total Total number of HTTP requests\n");
    output.push_str("# TYPE capybook_requests_total counter\n");
    let _ = writeln!(output, "capybook_requests_total {total_requests}\n");

    output.push_str("# HELP capybook_build_info Build information\n");
    output.push_str("# TYPE capybook_build_info gauge\n");
    let _ = writeln!(
        output,
        "capybook_build_info{{version=\"{}\"}} 1\n",
        env!("CARGO_PKG_VERSION")
    );

    output.push_str("# HELP capybook_auth_requests_total Bearer token resolution outcomes\n");
    output.push_str("# TYPE capybook_auth_requests_total counter\n");
    for (outcome, count) in [
        ("anonymous", anonymous),
        ("resolved", resolved),
        ("rejected", rejected),
    ] {
        let _ = writeln!(
            output,
            "capybook_auth_requests_total{{outcome=\"{outcome}\"}} {count}"
        );
    }
    output.push('\n');

    let metrics = state.metrics.read().await;

    output.push_str("# HELP capybook_http_requests_total HTTP requests by endpoint and status\n");
    output.push_str("# TYPE capybook_http_requests_total counter\n");
    for (endpoint, endpoint_metrics) in metrics.iter() {
        for (status, count) in &endpoint_metrics.status_counts {
            let _ = writeln!(
                output,
                "capybook_http_requests_total{{endpoint=\"{endpoint}\",status=\"{status}\"}} {count}"
            );
        }
    }
    output.push('\n');

    output.push_str("# HELP capybook_http_request_duration_seconds HTTP request latency\n");
    output.push_str("# TYPE capybook_http_request_duration_seconds summary\n");
    for (endpoint, endpoint_metrics) in metrics.iter() {
        if endpoint_metrics.latency_count == 0 {
            continue;
        }
        let _ = writeln!(
            output,
            "capybook_http_request_duration_seconds_sum{{endpoint=\"{endpoint}\"}} {:.6}",
            endpoint_metrics.total_latency_us as f64 / 1_000_000.0
        );
        let _ = writeln!(
            output,
            "capybook_http_request_duration_seconds_count{{endpoint=\"{endpoint}\"}} {}",
            endpoint_metrics.latency_count
        );
        let _ = writeln!(
            output,
            "capybook_http_request_duration_seconds_max{{endpoint=\"{endpoint}\"}} {:.6}",
            endpoint_metrics.max_latency_us as f64 / 1_000_000.0
        );
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        output,
    )
}
