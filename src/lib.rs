//! # Socket Feli
//!
//! Minimal bidirectional event messaging over WebSocket connections. Each
//! connected peer emits named events with JSON payloads and subscribes to the
//! named events the other side pushes.
//!
//! ## Modules
//!
//! - [`websocket`]: envelope codec, connections, event routing and the registry
//! - [`api`]: HTTP router with the upgrade endpoint and health check
//! - [`webhook`]: temperature relay application built on the core
//! - [`config`]: TOML and environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use feli::{serve, AppState, Config, Registry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Registry::start();
//!
//!     registry.add_connect_observer(|conn| {
//!         tracing::info!(params = ?conn.params(), "client connected");
//!         conn.on("temperatura", |ctx| async move {
//!             let _ = ctx.connection.emit("ack", (*ctx.payload).clone()).await;
//!         });
//!     })?;
//!
//!     serve(AppState::new(registry, Config::default())).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod webhook;
pub mod websocket;

pub use api::{build_router, serve, ApiError, AppState};

pub use config::{Config, ConfigError, HubConfig, LoggingConfig, ServerConfig, WebhookConfig};

pub use webhook::{install_temperature_relay, TemperatureReading, WebhookClient, WebhookError};

pub use websocket::{
    websocket_handler, Connection, ConnectionError, ConnectionId, Envelope, EnvelopeError,
    EventContext, Payload, Registry, RegistryError, RegistryHandle,
};
