//! Event Router
//!
//! Per-connection dispatch table mapping event names to ordered handler lists.

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::connection::Connection;
use super::messages::Payload;

/// Everything a handler gets for one dispatched event
#[derive(Clone)]
pub struct EventContext {
    /// Connection the event arrived on
    pub connection: Arc<Connection>,
    /// Event name
    pub event: String,
    /// Decoded payload, shared by every handler of this dispatch
    pub payload: Arc<Payload>,
}

type Handler = Arc<dyn Fn(EventContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Maps event names to handlers, in registration order
#[derive(Default)]
pub struct EventRouter {
    handlers: Mutex<HashMap<String, Vec<Handler>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for an event.
    ///
    /// Registering the same event more than once accumulates handlers;
    /// every one of them runs on dispatch.
    pub fn on<F, Fut>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |ctx: EventContext| -> BoxFuture<'static, ()> { Box::pin(handler(ctx)) });
        self.lock().entry(event.into()).or_default().push(handler);
    }

    /// Run every handler registered for `ctx.event`, one after another.
    ///
    /// Returns how many handlers ran. Unknown events are a no-op.
    pub async fn dispatch(&self, ctx: EventContext) -> usize {
        // Snapshot so handlers can register more handlers while we run.
        let handlers = {
            let table = self.lock();
            match table.get(&ctx.event) {
                Some(handlers) => handlers.clone(),
                None => return 0,
            }
        };

        for handler in &handlers {
            handler(ctx.clone()).await;
        }
        handlers.len()
    }

    /// Number of handlers registered for an event
    pub fn handler_count(&self, event: &str) -> usize {
        self.lock().get(event).map(Vec::len).unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Handler>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
