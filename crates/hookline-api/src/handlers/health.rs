//! Health check endpoint.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use tracing::{debug, error};

use crate::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Store reachable.
    Healthy,
    /// Store query failed.
    Unhealthy,
}

/// Reports `healthy` when the store answers a cheap query.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    debug!("performing health check");

    match state.store.next_due_at().await {
        Ok(_) => (StatusCode::OK, Json(HealthResponse { status: HealthStatus::Healthy })),
        Err(e) => {
            error!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse { status: HealthStatus::Unhealthy }),
            )
        },
    }
}
