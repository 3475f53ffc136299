//! Event bus
//!
//! Maps each [`EventKind`] to an ordered list of async handlers. A publish
//! call awaits every handler for the event's kind one after another, in
//! subscription order, and returns only once all of them have finished.
//! A failing (or panicking) handler is logged and skipped; delivery to the
//! remaining handlers continues.

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error};

use super::{Event, EventKind, EventQueue, EventSender};

/// Future returned by an event handler
pub type HandlerFuture = BoxFuture<'static, Result<()>>;

/// Type-erased async event handler
pub type EventHandler = Arc<dyn Fn(Arc<Event>) -> HandlerFuture + Send + Sync>;

/// A registered handler with its name (used in logs)
#[derive(Clone)]
struct Subscription {
    name: String,
    handler: EventHandler,
}

/// Outcome of a single publish call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Handlers that completed successfully
    pub delivered: usize,
    /// Handlers that returned an error or panicked
    pub failed: usize,
}

impl PublishReport {
    /// Total handlers invoked
    pub fn invoked(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Publish/subscribe registry
pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<Subscription>>>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Create a cross-thread submission channel for this process.
    ///
    /// The [`EventQueue`] half must be drained by the coordination task.
    pub fn channel() -> (EventSender, EventQueue) {
        super::queue::channel()
    }

    /// Register an async handler for an event kind
    pub fn subscribe<F, Fut>(&self, kind: EventKind, name: &str, handler: F)
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |event| handler(event).boxed());
        self.subscribe_handler(kind, name, handler);
    }

    /// Register an already type-erased handler
    pub fn subscribe_handler(&self, kind: EventKind, name: &str, handler: EventHandler) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.entry(kind).or_default().push(Subscription {
            name: name.to_string(),
            handler,
        });
        debug!("Subscribed '{}' to {}", name, kind);
    }

    /// Deliver an event to every handler registered for its kind
    pub async fn publish(&self, event: Event) -> PublishReport {
        let kind = event.kind();
        // Snapshot so handlers may subscribe or publish without deadlocking
        let subscriptions: Vec<Subscription> = {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers.get(&kind).cloned().unwrap_or_default()
        };

        let mut report = PublishReport::default();
        if subscriptions.is_empty() {
            debug!("No subscribers for {}", kind);
            return report;
        }

        let event = Arc::new(event);
        for subscription in subscriptions {
            let outcome = AssertUnwindSafe((subscription.handler)(event.clone()))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    error!(event = %kind, handler = %subscription.name, "Event handler failed: {:#}", e);
                    report.failed += 1;
                }
                Err(_) => {
                    error!(event = %kind, handler = %subscription.name, "Event handler panicked");
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Number of handlers registered for a kind
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Names of the handlers registered for a kind, in delivery order
    pub fn subscriber_names(&self, kind: EventKind) -> Vec<String> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map(|s| s.iter().map(|sub| sub.name.clone()).collect())
            .unwrap_or_default()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
