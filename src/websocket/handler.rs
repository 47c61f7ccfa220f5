//! WebSocket Handler
//!
//! Handles WebSocket upgrade requests and manages the connection lifecycle.

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;

use super::connection::{read_loop, write_loop, Connection};
use super::registry::RegistryHandle;
use crate::api::AppState;
use crate::config::HubConfig;

/// WebSocket upgrade handler
///
/// Captures the query string as the connection's parameters, then upgrades
/// the HTTP connection. When a key repeats, the first value wins
/// (`?device=a&device=b` yields `device = "a"`). A rejected handshake never
/// reaches the registry.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(pairs): Query<Vec<(String, String)>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let params = first_value_per_key(pairs);
    let registry = state.registry.clone();
    let hub = state.config.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, params, registry, hub))
}

fn first_value_per_key(pairs: Vec<(String, String)>) -> HashMap<String, String> {
    let mut params = HashMap::with_capacity(pairs.len());
    for (key, value) in pairs {
        params.entry(key).or_insert(value);
    }
    params
}

/// Handle an established WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    params: HashMap<String, String>,
    registry: RegistryHandle,
    hub: HubConfig,
) {
    let (sender, receiver) = socket.split();
    let (connection, outbound) = Connection::new(params, hub.queue_capacity);
    let connection_id = connection.id().to_string();

    // Observers wire their handlers before the first frame is read.
    if let Err(e) = registry.register(Arc::clone(&connection)).await {
        tracing::error!(connection_id = %connection_id, error = %e, "Failed to register WebSocket connection");
        return;
    }

    tracing::info!(
        connection_id = %connection_id,
        params = ?connection.params(),
        "WebSocket connected"
    );

    let mut write_task = tokio::spawn(write_loop(
        sender,
        outbound,
        connection_id.clone(),
        registry.clone(),
        hub.heartbeat_interval(),
    ));

    tokio::select! {
        _ = read_loop(Arc::clone(&connection), receiver, &registry, hub.idle_timeout()) => {}
        _ = &mut write_task => {
            // The socket can no longer be written; dropping the read loop
            // unregisters the connection.
        }
    }

    tracing::info!(connection_id = %connection_id, "WebSocket disconnected");
}
