//! Health check endpoint

use super::ApiState;
use axum::{extract::State, response::Json};
use serde::Serialize;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Whether the store answered a probe query
    pub store_ok: bool,
}

/// Health check endpoint: liveness plus store reachability
pub async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    let store_ok = state.app.db.ping().await;

    Json(HealthResponse {
        status: if store_ok { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store_ok,
    })
}
