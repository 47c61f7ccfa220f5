//! Health Routes
//!
//! - GET /health - Server status and live connection count

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::api::dto::HealthResponse;
use crate::api::error::ApiResult;
use crate::api::state::AppState;

/// GET /health
///
/// Fails with 503 when the connection registry is not running.
pub async fn health(State(state): State<Arc<AppState>>) -> ApiResult<Json<HealthResponse>> {
    let connections = state.registry.connection_count().await?;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connections,
        uptime_secs: state.uptime_secs(),
    }))
}
