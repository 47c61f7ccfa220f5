//! WebSocket Event Messaging
//!
//! Bidirectional named events over WebSocket connections.
//!
//! ## Architecture
//!
//! - **Registry**: owns the live connection set and runs connect observers
//! - **Connection**: one peer's outbound queue, read loop and write loop
//! - **Router**: per-connection table of event handlers
//! - **Messages**: the `{"nombre", "params"}` wire envelope
//! - **Handler**: the axum upgrade endpoint tying the pieces together
//!
//! ## Example
//!
//! ```rust,no_run
//! use feli::websocket::Registry;
//!
//! # async fn wire() -> Result<(), feli::websocket::RegistryError> {
//! let registry = Registry::start();
//! registry.add_connect_observer(|conn| {
//!     conn.on("ping", |ctx| async move {
//!         let _ = ctx.connection.emit("pong", (*ctx.payload).clone()).await;
//!     });
//! })?;
//! # Ok(())
//! # }
//! ```

mod connection;
mod handler;
mod messages;
mod registry;
mod router;

pub use connection::{
    read_loop, write_loop, Connection, ConnectionError, ConnectionId, OutboundReceiver,
};
pub use handler::websocket_handler;
pub use messages::{Envelope, EnvelopeError, Payload};
pub use registry::{ConnectObserver, Registry, RegistryError, RegistryHandle};
pub use router::{EventContext, EventRouter};
