//! HTTP handlers for the REST API

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{extract::State, Json};
use tracing::instrument;

use crate::controller::ControllerState;

use super::dto::HealthResponse;

/// Health check endpoint
#[instrument(skip(state))]
pub async fn health(State(state): State<Arc<ControllerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        leader: state.is_leader.load(Ordering::Relaxed),
    })
}

/// Metrics endpoint in OpenMetrics text format
#[cfg(feature = "metrics")]
pub async fn metrics() -> Result<String, axum::http::StatusCode> {
    crate::controller::metrics::encode().map_err(|e| {
        tracing::error!("Failed to encode metrics: {:?}", e);
        axum::http::StatusCode::INTERNAL_SERVER_ERROR
    })
}
