//! Named-event publish/subscribe dispatcher.
//!
//! The bus carries both raw protocol traffic (`client.*` / `server.*`) and
//! the engine's lifecycle notifications (`conversation.*`). Names are plain
//! strings; the wildcard convention is that publishers dispatch both
//! `server.<type>` and `server.*`, the bus itself does no pattern matching.
//!
//! Synchronous handlers run inline in registration order. Async handlers are
//! spawned as independent tasks with no ordering guarantee relative to each
//! other or to later dispatches.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Item state changed; payload carries `{ item, delta }`.
pub const UPDATED: &str = "conversation.updated";
/// Caller speech interrupted assistant output.
pub const INTERRUPTED: &str = "conversation.interrupted";
/// A new item entered the conversation; payload carries `{ item }`.
pub const ITEM_APPENDED: &str = "conversation.item.appended";
/// An item reached its terminal state; payload carries `{ item }`.
pub const ITEM_COMPLETED: &str = "conversation.item.completed";
/// The silence watchdog fired; payload carries `{ reason, elapsed_ms }`.
pub const TIMEOUT: &str = "conversation.timeout";
/// The session ended; payload carries `{ reason }`.
pub const ENDED: &str = "conversation.ended";
/// Observation envelope around every frame: `{ time, source, event }`.
pub const REALTIME_EVENT: &str = "realtime.event";
/// The transport stream closed.
pub const TRANSPORT_CLOSED: &str = "transport.closed";

/// An event carried on the bus. Immutable once dispatched.
#[derive(Debug, Clone)]
pub struct BusEvent {
    /// Unique event id
    pub id: String,
    /// Namespaced event name (e.g. `conversation.updated`)
    pub event_type: String,
    /// Structured payload
    pub payload: serde_json::Value,
}

impl BusEvent {
    /// Build an event with a fresh id.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        BusEvent {
            id: format!("evt_{}", uuid::Uuid::new_v4().simple()),
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Synchronous handler, invoked inline during dispatch.
pub type SyncHandler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Asynchronous handler, spawned as an independent task per dispatch.
pub type AsyncHandler =
    Arc<dyn Fn(BusEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

/// Publish/subscribe dispatcher keyed by event name.
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<String, Vec<Handler>>>,
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<BusEvent>>>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous handler. Duplicates are allowed; handlers for a
    /// name run in registration order.
    pub fn on<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .entry(name.into())
            .or_default()
            .push(Handler::Sync(Arc::new(handler)));
    }

    /// Register an asynchronous handler, scheduled on the runtime per event.
    pub fn on_async(&self, name: impl Into<String>, handler: AsyncHandler) {
        self.handlers
            .lock()
            .entry(name.into())
            .or_default()
            .push(Handler::Async(handler));
    }

    /// Dispatch an event to every handler registered for `name`, then resolve
    /// any pending single-shot waiters for that name.
    ///
    /// The handler table lock is released before any handler runs, so a
    /// handler may dispatch further events or register handlers on the same
    /// bus without deadlocking.
    pub fn dispatch(&self, name: &str, event: BusEvent) {
        let list = self.handlers.lock().get(name).cloned();
        if let Some(list) = list {
            for handler in &list {
                match handler {
                    Handler::Sync(f) => f(&event),
                    Handler::Async(f) => {
                        let fut = f(event.clone());
                        tokio::spawn(fut);
                    }
                }
            }
        }

        if let Some(waiters) = self.waiters.lock().remove(name) {
            for tx in waiters {
                // Receiver may have been dropped; nothing to do then.
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Resolve with the first subsequent event dispatched under `name`.
    pub fn wait_for_next(&self, name: impl Into<String>) -> impl Future<Output = Option<BusEvent>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().entry(name.into()).or_default().push(tx);
        async move { rx.await.ok() }
    }

    /// Remove every subscription and pending waiter. Used on reset.
    pub fn clear_event_handlers(&self) {
        self.handlers.lock().clear();
        self.waiters.lock().clear();
    }

    /// Number of handlers registered for `name`.
    pub fn handler_count(&self, name: &str) -> usize {
        self.handlers.lock().get(name).map_or(0, Vec::len)
    }
}
