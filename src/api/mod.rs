//! Socket Feli HTTP Layer
//!
//! HTTP surface built with Axum.
//!
//! # Endpoints
//!
//! - `GET /socket.feli` - WebSocket upgrade (path configurable via `server.path`)
//! - `GET /health` - Server status and live connection count
//!
//! # Example
//!
//! ```rust,ignore
//! use feli::api::{serve, AppState};
//! use feli::config::Config;
//! use feli::websocket::Registry;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Registry::start();
//!     serve(AppState::new(registry, Config::default())).await?;
//!     Ok(())
//! }
//! ```

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::websocket::websocket_handler;

/// Build the router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let socket_path = state.config.server.path.clone();
    let shared_state = Arc::new(state);

    Router::new()
        .route(&socket_path, get(websocket_handler))
        .route("/health", get(routes::health::health))
        .layer(TraceLayer::new_for_http())
        // Origins are not checked for the socket endpoint either.
        .layer(CorsLayer::permissive())
        .with_state(shared_state)
}

/// Start the server and run until a shutdown signal arrives
pub async fn serve(state: AppState) -> Result<(), ApiError> {
    let addr = state.config.server.addr();
    let socket_path = state.config.server.path.clone();
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Socket Feli listening on {} (socket path {})", addr, socket_path);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;

    tracing::info!("Socket Feli shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::dto::HealthResponse;
    use crate::config::Config;
    use crate::websocket::{Registry, RegistryHandle};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::util::ServiceExt;

    fn create_test_app() -> (Router, RegistryHandle) {
        let registry = Registry::start();
        let state = AppState::new(registry.clone(), Config::default());
        (build_router(state), registry)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _registry) = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.connections, 0);
    }

    #[tokio::test]
    async fn test_plain_get_on_socket_path_is_rejected() {
        let (app, registry) = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/socket.feli?device=abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_client_error());
        assert_eq!(registry.connection_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (app, _registry) = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ws")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
