//! Event router: explicit handler registration and emission.
//!
//! Every event has a `namespace:action` name and a JSON object payload.
//! Handlers are async functions from a payload to an optional JSON response.
//! Components register their handlers during a startup phase; nothing is
//! discovered by reflection, so the handler set is statically knowable from
//! the registration calls.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use crate::error::Error;

/// JSON payload carried by every event.
pub type EventData = serde_json::Value;

type HandlerFuture = BoxFuture<'static, Result<Option<EventData>, Error>>;

/// A registered event handler.
pub type Handler = Arc<dyn Fn(EventData) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a registrable [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(EventData) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<EventData>, Error>> + Send + 'static,
{
    Arc::new(move |data| Box::pin(f(data)))
}

/// Dispatches events to registered handlers by name.
#[derive(Default)]
pub struct EventRouter {
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event name. Multiple handlers per name are
    /// allowed; emission returns the first response.
    pub async fn register(&self, event: &str, handler: Handler) {
        self.handlers
            .write()
            .await
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    /// Emit an event, delivering to every registered handler in registration
    /// order.
    ///
    /// Returns the first `Some` response. A handler error is logged and does
    /// not prevent delivery to the remaining handlers; emission itself never
    /// fails. Events with no handlers are dropped silently, which makes every
    /// emission fire-and-forget unless the sender inspects the response.
    pub async fn emit(&self, event: &str, data: EventData) -> Option<EventData> {
        let handlers = self.handlers.read().await.get(event).cloned();
        let Some(handlers) = handlers else {
            tracing::trace!(event, "no handlers registered");
            return None;
        };

        let mut response = None;
        for handler in handlers {
            match handler(data.clone()).await {
                Ok(Some(value)) => {
                    if response.is_none() {
                        response = Some(value);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(event, error = %e, "event handler failed");
                }
            }
        }
        response
    }

    /// Number of handlers registered for an event name.
    pub async fn handler_count(&self, event: &str) -> usize {
        self.handlers
            .read()
            .await
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }
}
