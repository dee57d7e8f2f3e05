//! In-process synchronous dispatch of domain events.
//!
//! Handlers run inside the originating unit of work. The first handler
//! error aborts dispatch and is returned so the caller rolls back.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::context::Context;
use crate::error::DomainError;
use crate::event::DomainEvent;

/// A handler invoked for domain events of the types it was registered for.
#[async_trait]
pub trait DomainEventHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Handles one event.
    async fn handle(&self, ctx: &Context, event: &dyn DomainEvent) -> Result<(), DomainError>;
}

/// Maps event types to handlers, in registration order.
#[derive(Default)]
pub struct DomainEventDispatcher {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn DomainEventHandler>>>>,
}

impl std::fmt::Debug for DomainEventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        let counts: HashMap<&String, usize> = handlers.iter().map(|(k, v)| (k, v.len())).collect();
        f.debug_struct("DomainEventDispatcher").field("handlers", &counts).finish()
    }
}

impl DomainEventDispatcher {
    /// Creates a dispatcher with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `event_type`. Registering the same handler
    /// twice for one type has no effect.
    pub fn register(&self, event_type: &str, handler: Arc<dyn DomainEventHandler>) {
        let mut handlers = self.handlers.write();
        let entry = handlers.entry(event_type.to_owned()).or_default();
        if !entry.iter().any(|existing| Arc::ptr_eq(existing, &handler)) {
            entry.push(handler);
        }
    }

    /// Number of handlers registered for `event_type`.
    #[must_use]
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers.read().get(event_type).map_or(0, Vec::len)
    }

    /// Invokes matching handlers in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first handler error; later handlers are not invoked.
    pub async fn dispatch(&self, ctx: &Context, event: &dyn DomainEvent) -> Result<(), DomainError> {
        let matching: Vec<Arc<dyn DomainEventHandler>> = self
            .handlers
            .read()
            .get(event.event_type())
            .cloned()
            .unwrap_or_default();

        for handler in matching {
            ctx.check()?;
            debug!(
                handler = handler.name(),
                event_type = event.event_type(),
                event_id = %event.metadata().event_id,
                "dispatching domain event"
            );
            handler.handle(ctx, event).await?;
        }
        Ok(())
    }

    /// Dispatches every event in order, stopping on the first error.
    ///
    /// # Errors
    ///
    /// Returns the first handler error.
    pub async fn dispatch_all<E: DomainEvent>(&self, ctx: &Context, events: &[E]) -> Result<(), DomainError> {
        for event in events {
            self.dispatch(ctx, event).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMetadata;
    use chrono::Utc;
    use parking_lot::Mutex;
    use uuid::Uuid;

    #[derive(Debug)]
    struct TestEvent {
        metadata: EventMetadata,
    }

    impl DomainEvent for TestEvent {
        fn event_type(&self) -> &'static str {
            "MediaCreated"
        }

        fn to_payload(&self) -> serde_json::Value {
            serde_json::json!({})
        }

        fn metadata(&self) -> &EventMetadata {
            &self.metadata
        }
    }

    struct Recording {
        name: String,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl DomainEventHandler for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, _ctx: &Context, _event: &dyn DomainEvent) -> Result<(), DomainError> {
            self.log.lock().push(self.name.clone());
            if self.fail {
                Err(DomainError::Validation(format!("{} rejected", self.name)))
            } else {
                Ok(())
            }
        }
    }

    fn event() -> TestEvent {
        TestEvent {
            metadata: EventMetadata::new(
                "MediaCreated",
                "Movie",
                Uuid::new_v4(),
                1,
                "media",
                &Context::background(),
                Utc::now(),
            ),
        }
    }

    fn handler(name: &str, fail: bool, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn DomainEventHandler> {
        Arc::new(Recording {
            name: name.to_owned(),
            fail,
            log: Arc::clone(log),
        })
    }

    #[tokio::test]
    async fn test_dispatch_runs_handlers_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = DomainEventDispatcher::new();
        dispatcher.register("MediaCreated", handler("first", false, &log));
        dispatcher.register("MediaCreated", handler("second", false, &log));
        dispatcher.register("MediaDeleted", handler("other", false, &log));

        dispatcher.dispatch(&Context::background(), &event()).await.unwrap();

        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_dispatch_stops_on_first_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = DomainEventDispatcher::new();
        dispatcher.register("MediaCreated", handler("first", true, &log));
        dispatcher.register("MediaCreated", handler("second", false, &log));

        let result = dispatcher.dispatch(&Context::background(), &event()).await;

        assert!(matches!(result, Err(DomainError::Validation(_))));
        assert_eq!(*log.lock(), vec!["first"]);
    }

    #[tokio::test]
    async fn test_duplicate_registration_invokes_handler_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = DomainEventDispatcher::new();
        let only = handler("only", false, &log);
        dispatcher.register("MediaCreated", Arc::clone(&only));
        dispatcher.register("MediaCreated", only);

        dispatcher.dispatch(&Context::background(), &event()).await.unwrap();

        assert_eq!(dispatcher.handler_count("MediaCreated"), 1);
        assert_eq!(log.lock().len(), 1);
    }
}
