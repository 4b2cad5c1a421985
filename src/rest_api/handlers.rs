//! HTTP handlers for the operational API

use axum::{extract::State, http::StatusCode, Json};
use prometheus_client::encoding::text::encode;
use tracing::error;

use super::dto::HealthResponse;
use super::server::ApiState;
use crate::controller::metrics::REGISTRY;

/// Health check endpoint
///
/// Answers 503 while any consumer is degraded so probes can see it.
pub async fn health(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    let degraded = state.health.degraded();
    let (code, status) = if degraded.is_empty() {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            degraded,
        }),
    )
}

/// Prometheus text exposition
pub async fn metrics() -> Result<String, StatusCode> {
    let mut buffer = String::new();
    encode(&mut buffer, &REGISTRY).map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(buffer)
}
