//! Axum HTTP server for the operational API

use std::net::SocketAddr;

use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::HealthState;
use crate::{Error, Result};

use super::handlers;

/// State shared with every handler
#[derive(Clone, Debug, Default)]
pub struct ApiState {
    pub health: HealthState,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `cancel` fires
pub async fn run_server(
    state: ApiState,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind {addr}: {e}")))?;
    info!("REST API server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::ConfigError(format!("REST API server error: {e}")))?;

    info!("REST API server stopped");
    Ok(())
}
