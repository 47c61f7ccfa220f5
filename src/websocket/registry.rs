//! Connection Registry
//!
//! Single authority over the set of live connections. The set is owned by one
//! coordinating task; everything else talks to it through a [`RegistryHandle`],
//! so registrations and unregistrations are applied strictly one at a time in
//! the order they were submitted.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::connection::{Connection, ConnectionError, ConnectionId};
use super::messages::{Envelope, EnvelopeError, Payload};

/// Callback invoked once for every newly registered connection.
///
/// Observers run on the registry task: a slow observer delays every other
/// registration and unregistration.
pub type ConnectObserver = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

enum RegistryCommand {
    Register {
        connection: Arc<Connection>,
        done: oneshot::Sender<()>,
    },
    Unregister {
        id: ConnectionId,
    },
    AddObserver(ConnectObserver),
    Count(oneshot::Sender<usize>),
    Ids(oneshot::Sender<Vec<ConnectionId>>),
    Contains {
        id: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    Broadcast {
        text: String,
        reply: oneshot::Sender<usize>,
    },
}

/// The coordinating loop's state
pub struct Registry {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    observers: Vec<ConnectObserver>,
    commands: mpsc::UnboundedReceiver<RegistryCommand>,
}

impl Registry {
    /// Spawn the coordinating loop on the current tokio runtime.
    ///
    /// The loop runs until every handle has been dropped.
    pub fn start() -> RegistryHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self {
            connections: HashMap::new(),
            observers: Vec::new(),
            commands: rx,
        };
        tokio::spawn(registry.run());
        RegistryHandle { commands: tx }
    }

    async fn run(mut self) {
        tracing::debug!("Connection registry started");
        while let Some(command) = self.commands.recv().await {
            self.apply(command);
        }
        tracing::debug!(
            remaining = self.connections.len(),
            "Connection registry stopped"
        );
    }

    fn apply(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Register { connection, done } => {
                self.connections
                    .insert(connection.id().to_string(), Arc::clone(&connection));
                tracing::info!(
                    connection_id = %connection.id(),
                    live = self.connections.len(),
                    "Connection registered"
                );
                self.notify_observers(&connection);
                let _ = done.send(());
            }
            RegistryCommand::Unregister { id } => {
                if let Some(connection) = self.connections.remove(&id) {
                    connection.close_outbound();
                    tracing::info!(
                        connection_id = %id,
                        live = self.connections.len(),
                        "Connection unregistered"
                    );
                }
            }
            RegistryCommand::AddObserver(observer) => {
                self.observers.push(observer);
            }
            RegistryCommand::Count(reply) => {
                let _ = reply.send(self.connections.len());
            }
            RegistryCommand::Ids(reply) => {
                let _ = reply.send(self.connections.keys().cloned().collect());
            }
            RegistryCommand::Contains { id, reply } => {
                let _ = reply.send(self.connections.contains_key(&id));
            }
            RegistryCommand::Broadcast { text, reply } => {
                let _ = reply.send(self.broadcast(text));
            }
        }
    }

    fn notify_observers(&self, connection: &Arc<Connection>) {
        for observer in &self.observers {
            if catch_unwind(AssertUnwindSafe(|| observer(connection))).is_err() {
                tracing::error!(
                    connection_id = %connection.id(),
                    "Connect observer panicked"
                );
            }
        }
    }

    fn broadcast(&self, text: String) -> usize {
        let mut delivered = 0;
        for (id, connection) in &self.connections {
            match connection.try_enqueue(text.clone()) {
                Ok(()) => delivered += 1,
                Err(ConnectionError::QueueFull) => {
                    tracing::warn!(connection_id = %id, "Outbound queue full, broadcast skipped");
                }
                Err(e) => {
                    tracing::debug!(connection_id = %id, error = %e, "Broadcast skipped");
                }
            }
        }
        delivered
    }
}

/// Cloneable handle to a running [`Registry`]
#[derive(Clone)]
pub struct RegistryHandle {
    commands: mpsc::UnboundedSender<RegistryCommand>,
}

impl RegistryHandle {
    /// Add a connection to the live set.
    ///
    /// Resolves once the connection is live and every connect observer has
    /// run for it.
    pub async fn register(&self, connection: Arc<Connection>) -> Result<(), RegistryError> {
        let (done, finished) = oneshot::channel();
        self.send(RegistryCommand::Register { connection, done })?;
        finished.await.map_err(|_| RegistryError::Stopped)
    }

    /// Remove a connection and close its outbound queue.
    ///
    /// Unknown ids are ignored, so calling this more than once is harmless.
    pub fn unregister(&self, id: &str) {
        if self
            .send(RegistryCommand::Unregister { id: id.to_string() })
            .is_err()
        {
            tracing::debug!(connection_id = %id, "Registry stopped, unregister dropped");
        }
    }

    /// Add an observer for every future registration
    pub fn add_connect_observer<F>(&self, observer: F) -> Result<(), RegistryError>
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.send(RegistryCommand::AddObserver(Arc::new(observer)))
    }

    /// Number of live connections
    pub async fn connection_count(&self) -> Result<usize, RegistryError> {
        self.request(RegistryCommand::Count).await
    }

    /// Ids of all live connections, in no particular order
    pub async fn connection_ids(&self) -> Result<Vec<ConnectionId>, RegistryError> {
        self.request(RegistryCommand::Ids).await
    }

    pub async fn contains(&self, id: &str) -> Result<bool, RegistryError> {
        let id = id.to_string();
        self.request(|reply| RegistryCommand::Contains { id, reply })
            .await
    }

    /// Queue an event on every live connection without waiting.
    ///
    /// Connections whose queue is full are skipped. Returns how many
    /// connections accepted the event.
    pub async fn broadcast(
        &self,
        event: impl Into<String>,
        payload: Payload,
    ) -> Result<usize, RegistryError> {
        let text = Envelope::new(event, payload).encode()?;
        self.request(|reply| RegistryCommand::Broadcast { text, reply })
            .await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply))?;
        response.await.map_err(|_| RegistryError::Stopped)
    }

    fn send(&self, command: RegistryCommand) -> Result<(), RegistryError> {
        self.commands
            .send(command)
            .map_err(|_| RegistryError::Stopped)
    }
}

/// Errors that can occur talking to the registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Connection registry is not running")]
    Stopped,

    #[error("Invalid broadcast event: {0}")]
    Envelope(#[from] EnvelopeError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::OutboundReceiver;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// A connection plus its outbound receiver, which must stay alive for
    /// `is_closed` to reflect unregistration.
    fn connection() -> (Arc<Connection>, OutboundReceiver) {
        Connection::new(HashMap::new(), 8)
    }

    #[tokio::test]
    async fn test_register_unregister() {
        let registry = Registry::start();
        let (conn, mut outbound) = connection();

        registry.register(Arc::clone(&conn)).await.unwrap();
        assert_eq!(registry.connection_count().await.unwrap(), 1);
        assert!(registry.contains(conn.id()).await.unwrap());
        assert!(!conn.is_closed());

        registry.unregister(conn.id());
        assert_eq!(registry.connection_count().await.unwrap(), 0);
        assert!(conn.is_closed());
        assert!(outbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = Registry::start();
        let (kept, _kept_outbound) = connection();
        let (gone, _gone_outbound) = connection();

        registry.register(Arc::clone(&kept)).await.unwrap();
        registry.register(Arc::clone(&gone)).await.unwrap();
        assert!(!gone.is_closed());

        registry.unregister(gone.id());
        registry.unregister(gone.id());
        registry.unregister("never-registered");

        assert_eq!(registry.connection_ids().await.unwrap(), vec![kept.id().to_string()]);
        assert!(gone.is_closed());
        assert!(!kept.is_closed());
    }

    #[tokio::test]
    async fn test_observers_run_in_order_before_register_returns() {
        let registry = Registry::start();
        let calls: Arc<Mutex<Vec<String>>> = Arc::default();

        let first = Arc::clone(&calls);
        registry
            .add_connect_observer(move |conn| {
                first.lock().unwrap().push(format!("first:{}", conn.id()));
            })
            .unwrap();
        let second = Arc::clone(&calls);
        registry
            .add_connect_observer(move |conn| {
                second.lock().unwrap().push(format!("second:{}", conn.id()));
            })
            .unwrap();

        let (conn, _outbound) = connection();
        registry.register(Arc::clone(&conn)).await.unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![format!("first:{}", conn.id()), format!("second:{}", conn.id())]
        );
    }

    #[tokio::test]
    async fn test_observers_are_not_retroactive() {
        let registry = Registry::start();
        let (early, _early_outbound) = connection();
        registry.register(Arc::clone(&early)).await.unwrap();

        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let log = Arc::clone(&seen);
        registry
            .add_connect_observer(move |conn| log.lock().unwrap().push(conn.id().to_string()))
            .unwrap();

        let (late, _late_outbound) = connection();
        registry.register(Arc::clone(&late)).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![late.id().to_string()]);
    }

    #[tokio::test]
    async fn test_observer_can_wire_handlers() {
        let registry = Registry::start();
        registry
            .add_connect_observer(|conn| conn.on("hello", |_ctx| async {}))
            .unwrap();

        let (conn, _outbound) = Connection::new(HashMap::new(), 8);
        registry.register(Arc::clone(&conn)).await.unwrap();

        let dispatched = conn.dispatch(Envelope::new("hello", Payload::new())).await;
        assert_eq!(dispatched, 1);
    }

    #[tokio::test]
    async fn test_panicking_observer_does_not_stop_registry() {
        let registry = Registry::start();
        registry
            .add_connect_observer(|_conn| panic!("observer bug"))
            .unwrap();

        let (conn, _outbound) = connection();
        registry.register(Arc::clone(&conn)).await.unwrap();

        assert_eq!(registry.connection_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_register_and_unregister() {
        let registry = Registry::start();
        let (connections, _outbound): (Vec<_>, Vec<_>) = (0..64).map(|_| connection()).unzip();

        let mut tasks = Vec::new();
        for conn in &connections {
            let registry = registry.clone();
            let conn = Arc::clone(conn);
            tasks.push(tokio::spawn(async move { registry.register(conn).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut tasks = Vec::new();
        for conn in connections.iter().step_by(2) {
            let registry = registry.clone();
            let id = conn.id().to_string();
            tasks.push(tokio::spawn(async move { registry.unregister(&id) }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let live: HashSet<_> = registry.connection_ids().await.unwrap().into_iter().collect();
        let expected: HashSet<_> = connections
            .iter()
            .skip(1)
            .step_by(2)
            .map(|c| c.id().to_string())
            .collect();

        assert_eq!(live.len(), 32);
        assert_eq!(live, expected);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_live_connections() {
        let registry = Registry::start();
        let (a, mut a_out) = Connection::new(HashMap::new(), 8);
        let (b, mut b_out) = Connection::new(HashMap::new(), 8);
        let (c, _c_out) = Connection::new(HashMap::new(), 8);

        for conn in [&a, &b, &c] {
            registry.register(Arc::clone(conn)).await.unwrap();
        }
        registry.unregister(c.id());

        let delivered = registry.broadcast("system", Payload::new()).await.unwrap();

        assert_eq!(delivered, 2);
        assert_eq!(a_out.recv().await.unwrap(), r#"{"nombre":"system","params":{}}"#);
        assert_eq!(b_out.recv().await.unwrap(), r#"{"nombre":"system","params":{}}"#);
    }

    #[tokio::test]
    async fn test_broadcast_rejects_empty_event() {
        let registry = Registry::start();
        let result = registry.broadcast("", Payload::new()).await;
        assert!(matches!(result, Err(RegistryError::Envelope(_))));
    }
}
