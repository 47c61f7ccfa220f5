//! WebSocket Connection
//!
//! One peer's socket split into two independent loops:
//!
//! - the **write loop** drains the bounded outbound queue onto the socket
//! - the **read loop** decodes inbound frames and dispatches them through the
//!   connection's [`EventRouter`]
//!
//! The loops only meet through the outbound queue and the [`RegistryHandle`].

use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

use super::messages::{Envelope, EnvelopeError, Payload};
use super::registry::RegistryHandle;
use super::router::{EventContext, EventRouter};

/// Unique identifier for a WebSocket connection
pub type ConnectionId = String;

/// Receiving end of a connection's outbound queue, owned by its write loop
pub type OutboundReceiver = mpsc::Receiver<String>;

/// A connected peer
pub struct Connection {
    id: ConnectionId,
    /// Query parameters captured at handshake time
    params: HashMap<String, String>,
    /// `None` once the registry has closed the queue
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    router: EventRouter,
}

impl Connection {
    /// Create a connection with an outbound queue of `capacity` frames.
    ///
    /// The returned receiver must be handed to [`write_loop`].
    pub fn new(params: HashMap<String, String>, capacity: usize) -> (Arc<Self>, OutboundReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let connection = Self {
            id: Uuid::new_v4().to_string(),
            params,
            outbound: Mutex::new(Some(tx)),
            router: EventRouter::new(),
        };
        (Arc::new(connection), rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handshake-time query parameters
    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    /// Register a handler for an inbound event
    pub fn on<F, Fut>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.router.on(event, handler);
    }

    /// Queue an event for the peer.
    ///
    /// Waits while the outbound queue is full. Fails with
    /// [`ConnectionError::Closed`] once the connection has been unregistered.
    pub async fn emit(&self, event: impl Into<String>, payload: Payload) -> Result<(), ConnectionError> {
        let text = self.encode(Envelope::new(event, payload))?;
        let sender = self.sender().ok_or(ConnectionError::Closed)?;
        sender.send(text).await.map_err(|_| ConnectionError::Closed)
    }

    /// Queue an event built from any value that serializes to a JSON object
    pub async fn emit_serializable<T: Serialize + ?Sized>(
        &self,
        event: impl Into<String>,
        value: &T,
    ) -> Result<(), ConnectionError> {
        let envelope = Envelope::from_serializable(event, value).map_err(|e| self.encode_failed(e))?;
        let text = self.encode(envelope)?;
        let sender = self.sender().ok_or(ConnectionError::Closed)?;
        sender.send(text).await.map_err(|_| ConnectionError::Closed)
    }

    /// Queue an event without waiting; fails if the queue is full
    pub fn try_emit(&self, event: impl Into<String>, payload: Payload) -> Result<(), ConnectionError> {
        let text = self.encode(Envelope::new(event, payload))?;
        self.try_enqueue(text)
    }

    /// Whether the outbound queue has been closed
    pub fn is_closed(&self) -> bool {
        self.lock_outbound().as_ref().map_or(true, |tx| tx.is_closed())
    }

    /// Decode one text frame and dispatch it.
    ///
    /// Malformed frames are logged and skipped.
    pub async fn handle_text(self: &Arc<Self>, text: &str) {
        match Envelope::decode(text) {
            Ok(envelope) => {
                tracing::debug!(
                    connection_id = %self.id,
                    event = %envelope.event,
                    params = ?envelope.payload,
                    "Received event"
                );
                self.dispatch(envelope).await;
            }
            Err(e) => {
                tracing::warn!(
                    connection_id = %self.id,
                    error = %e,
                    text = %text,
                    "Invalid event frame"
                );
            }
        }
    }

    /// Run the handlers registered for an envelope's event
    pub async fn dispatch(self: &Arc<Self>, envelope: Envelope) -> usize {
        let ctx = EventContext {
            connection: Arc::clone(self),
            event: envelope.event,
            payload: Arc::new(envelope.payload),
        };
        self.router.dispatch(ctx).await
    }

    pub(crate) fn try_enqueue(&self, text: String) -> Result<(), ConnectionError> {
        let sender = self.sender().ok_or(ConnectionError::Closed)?;
        sender.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    /// Drop the queue's sender so the write loop ends after draining
    pub(crate) fn close_outbound(&self) {
        self.lock_outbound().take();
    }

    fn sender(&self) -> Option<mpsc::Sender<String>> {
        self.lock_outbound().clone()
    }

    fn lock_outbound(&self) -> MutexGuard<'_, Option<mpsc::Sender<String>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn encode(&self, envelope: Envelope) -> Result<String, ConnectionError> {
        envelope.encode().map_err(|e| self.encode_failed(e))
    }

    fn encode_failed(&self, error: EnvelopeError) -> ConnectionError {
        tracing::warn!(connection_id = %self.id, error = %error, "Dropping unencodable event");
        ConnectionError::Encode(error)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("params", &self.params)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Drain the outbound queue onto the socket.
///
/// Ends when the queue is closed and drained, or on the first failed write,
/// in which case the connection is unregistered. With a heartbeat interval a
/// ping frame is sent whenever the interval elapses.
pub async fn write_loop<S>(
    mut sink: S,
    mut outbound: OutboundReceiver,
    connection_id: ConnectionId,
    registry: RegistryHandle,
    heartbeat: Option<Duration>,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ticker = heartbeat.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        let frame = tokio::select! {
            next = outbound.recv() => match next {
                Some(text) => Message::Text(text),
                None => break,
            },
            _ = next_tick(&mut ticker) => Message::Ping(Vec::new()),
        };

        if let Err(e) = sink.send(frame).await {
            tracing::warn!(
                connection_id = %connection_id,
                error = %e,
                "WebSocket send failed, closing connection"
            );
            registry.unregister(&connection_id);
            break;
        }
    }

    let _ = sink.close().await;
    tracing::trace!(connection_id = %connection_id, "Write loop finished");
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Read frames until the peer goes away, dispatching each event.
///
/// A transport error, a close frame, the end of the stream, or (when
/// `idle_timeout` is set) a silent peer ends the loop; the connection is then
/// unregistered and the stream dropped. Unregistration also happens when a
/// handler panics or the loop's future is dropped mid-flight.
pub async fn read_loop<S, E>(
    connection: Arc<Connection>,
    mut stream: S,
    registry: &RegistryHandle,
    idle_timeout: Option<Duration>,
) where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let id = connection.id().to_string();
    let unregister = UnregisterOnDrop {
        registry,
        id: id.clone(),
    };

    loop {
        let next = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::info!(connection_id = %id, "Connection idle timeout");
                    break;
                }
            },
            None => stream.next().await,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                tracing::debug!(connection_id = %id, error = %e, "WebSocket receive error");
                break;
            }
            None => break,
        };

        match message {
            Message::Text(text) => connection.handle_text(&text).await,
            Message::Binary(_) => {
                tracing::debug!(connection_id = %id, "Ignoring binary frame");
            }
            // Any frame proves liveness; axum answers pings itself.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => {
                tracing::debug!(connection_id = %id, "Client requested close");
                break;
            }
        }
    }

    drop(unregister);
    drop(stream);
}

/// Removes a connection from the registry when dropped, including on unwind.
struct UnregisterOnDrop<'a> {
    registry: &'a RegistryHandle,
    id: ConnectionId,
}

impl Drop for UnregisterOnDrop<'_> {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
    }
}

/// Errors returned when emitting to a connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,

    #[error("Outbound queue full")]
    QueueFull,

    #[error("Failed to encode event: {0}")]
    Encode(#[from] EnvelopeError),
}
