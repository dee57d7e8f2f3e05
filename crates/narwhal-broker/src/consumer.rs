//! Consumer groups: durable pull consumers dispatching envelopes to handlers.
//!
//! Each message is handed to every handler declaring its event type. A
//! handler gets up to `max_retries` attempts per delivery with `n²` backoff
//! units between attempts. The delivery is acknowledged when every handler
//! succeeds, negatively acknowledged when a retriable failure remains, and
//! dead-lettered (then acknowledged) when the failure is not retriable, the
//! envelope or its registered payload does not decode, or the broker's
//! `max_deliver` is reached. Envelopes no handler declares are acknowledged
//! without decoding their payload.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use narwhal_core::clock::Clock;
use narwhal_core::context::Context;
use narwhal_core::envelope::IntegrationEnvelope;
use narwhal_core::error::DomainError;
use narwhal_core::registry::{DecodedEvent, EventRegistry};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{Delivery, StreamBroker};
use crate::config::ConsumerGroupConfig;
use crate::dlq::DeadLetterQueue;
use crate::publisher::EventPublisher;

/// Pause after a failed fetch before polling again.
const FETCH_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// A subscriber of integration events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Event types this handler accepts.
    fn event_types(&self) -> &[&str];

    /// Handles one envelope whose payload was decoded by its registered
    /// type. Must tolerate redelivery.
    async fn handle(
        &self,
        ctx: &Context,
        envelope: &IntegrationEnvelope,
        event: &DecodedEvent,
    ) -> Result<(), DomainError>;
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every handler succeeded (or none applied).
    Acked,
    /// Redelivery requested.
    Nacked,
    /// Forwarded to the dead-letter queue and acknowledged.
    DeadLettered,
}

/// A named group of durable consumers, one per configured stream.
pub struct ConsumerGroup {
    config: ConsumerGroupConfig,
    broker: Arc<dyn StreamBroker>,
    dead_letters: DeadLetterQueue,
    registry: Arc<EventRegistry>,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl std::fmt::Debug for ConsumerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerGroup")
            .field("name", &self.config.name)
            .field("streams", &self.config.streams)
            .field("handlers", &self.handlers.read().len())
            .finish_non_exhaustive()
    }
}

impl ConsumerGroup {
    /// Creates a consumer group decoding payloads through `registry`; call
    /// [`ConsumerGroup::start`] to begin consuming.
    #[must_use]
    pub fn new(
        config: ConsumerGroupConfig,
        broker: Arc<dyn StreamBroker>,
        publisher: Arc<EventPublisher>,
        registry: Arc<EventRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let dead_letters = DeadLetterQueue::new(Arc::clone(&broker), publisher, clock, config.name.clone());
        Self {
            config,
            broker,
            dead_letters,
            registry,
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Group settings.
    #[must_use]
    pub fn config(&self) -> &ConsumerGroupConfig {
        &self.config
    }

    /// The group's dead-letter queue.
    #[must_use]
    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    /// Adds a handler. Registering the same handler twice has no effect.
    pub fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write();
        if !handlers.iter().any(|existing| Arc::ptr_eq(existing, &handler)) {
            info!(consumer = %self.config.name, handler = handler.name(), "handler registered");
            handlers.push(handler);
        }
    }

    /// Creates the durable consumer on every configured stream.
    ///
    /// # Errors
    ///
    /// Returns the broker failure for the first stream that cannot be joined.
    pub async fn ensure_consumers(&self) -> Result<(), DomainError> {
        for stream in &self.config.streams {
            self.broker
                .ensure_consumer(stream, self.config.consumer_config())
                .await?;
        }
        Ok(())
    }

    /// Creates the durable consumers and spawns one polling task per stream.
    ///
    /// # Errors
    ///
    /// Returns the failure to create a durable consumer.
    pub async fn start(self: &Arc<Self>, ctx: &Context) -> Result<ConsumerGroupHandle, DomainError> {
        self.ensure_consumers().await?;
        let ctx = ctx.child();
        let tasks = self
            .config
            .streams
            .iter()
            .map(|stream| {
                let group = Arc::clone(self);
                let ctx = ctx.clone();
                let stream = stream.clone();
                tokio::spawn(async move { group.run_stream(ctx, stream).await })
            })
            .collect();
        info!(consumer = %self.config.name, streams = ?self.config.streams, "consumer group started");
        Ok(ConsumerGroupHandle { ctx, tasks })
    }

    async fn run_stream(&self, ctx: Context, stream: String) {
        while !ctx.is_cancelled() {
            match self.poll_once(&ctx, &stream).await {
                Ok(_) => {}
                Err(DomainError::Cancelled) => break,
                Err(err) => {
                    warn!(consumer = %self.config.name, stream = %stream, error = %err, "fetch failed");
                    tokio::select! {
                        () = ctx.cancelled() => break,
                        () = tokio::time::sleep(FETCH_ERROR_PAUSE) => {}
                    }
                }
            }
        }
        debug!(consumer = %self.config.name, stream = %stream, "stream consumer stopped");
    }

    /// Pulls and processes at most one message from `stream`.
    ///
    /// Returns `None` when no message arrived within the fetch wait.
    ///
    /// # Errors
    ///
    /// Returns the fetch or acknowledgement failure.
    pub async fn poll_once(&self, ctx: &Context, stream: &str) -> Result<Option<Outcome>, DomainError> {
        let delivery = self
            .broker
            .fetch(ctx, stream, &self.config.name, self.config.fetch_wait)
            .await?;
        match delivery {
            Some(delivery) => self.process(ctx, &delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Dispatches one delivery and settles it with the broker.
    ///
    /// # Errors
    ///
    /// Returns the acknowledgement failure.
    pub async fn process(&self, ctx: &Context, delivery: &Delivery) -> Result<Outcome, DomainError> {
        let envelope = match IntegrationEnvelope::from_bytes(&delivery.message.payload) {
            Ok(envelope) => envelope,
            Err(err) => return self.dead_letter(ctx, delivery, &err.to_string()).await,
        };

        let mut dispatch_ctx = envelope.continue_in(ctx);
        if let Some(correlation_id) = delivery.correlation_id() {
            dispatch_ctx = dispatch_ctx.with_correlation(correlation_id);
        }

        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .iter()
            .filter(|h| h.event_types().contains(&envelope.event_type.as_str()))
            .cloned()
            .collect();
        if handlers.is_empty() {
            debug!(consumer = %self.config.name, event_type = %envelope.event_type, "no handler for envelope");
            self.broker.ack(delivery).await?;
            return Ok(Outcome::Acked);
        }
        let event = match self.registry.decode_event(&envelope) {
            Ok(event) => event,
            Err(err) => return self.dead_letter(ctx, delivery, &err.to_string()).await,
        };
        debug!(
            consumer = %self.config.name,
            subject = %delivery.message.subject,
            event_type = %envelope.event_type,
            correlation_id = dispatch_ctx.correlation_id(),
            num_delivered = delivery.num_delivered,
            handlers = handlers.len(),
            "dispatching envelope"
        );

        let mut failure = None;
        for handler in handlers {
            if let Err(err) = self
                .run_with_retries(&dispatch_ctx, handler.as_ref(), &envelope, &event)
                .await
            {
                warn!(
                    consumer = %self.config.name,
                    handler = handler.name(),
                    event_type = %envelope.event_type,
                    error = %err,
                    "handler failed"
                );
                failure.get_or_insert(err);
            }
        }

        match failure {
            None => {
                self.broker.ack(delivery).await?;
                Ok(Outcome::Acked)
            }
            Some(DomainError::Cancelled) => {
                self.broker.nak(delivery, None).await?;
                Ok(Outcome::Nacked)
            }
            Some(err) if !err.is_retriable() => self.dead_letter(ctx, delivery, &err.to_string()).await,
            Some(err) if delivery.num_delivered >= self.config.max_deliver => {
                self.dead_letter(ctx, delivery, &err.to_string()).await
            }
            Some(_) => {
                self.broker.nak(delivery, None).await?;
                Ok(Outcome::Nacked)
            }
        }
    }

    async fn run_with_retries(
        &self,
        ctx: &Context,
        handler: &dyn EventHandler,
        envelope: &IntegrationEnvelope,
        event: &DecodedEvent,
    ) -> Result<(), DomainError> {
        let attempts = self.config.max_retries.max(1);
        let mut attempt = 1;
        loop {
            ctx.check()?;
            match handler.handle(ctx, envelope, event).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retriable() && attempt < attempts => {
                    let backoff = self.config.retry_backoff_unit * attempt * attempt;
                    debug!(
                        handler = handler.name(),
                        attempt,
                        backoff = ?backoff,
                        error = %err,
                        "handler attempt failed, retrying"
                    );
                    tokio::select! {
                        () = ctx.cancelled() => return Err(DomainError::Cancelled),
                        () = tokio::time::sleep(backoff) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn dead_letter(&self, ctx: &Context, delivery: &Delivery, reason: &str) -> Result<Outcome, DomainError> {
        if let Err(err) = self.dead_letters.send(ctx, delivery, reason).await {
            self.broker.nak(delivery, None).await?;
            return Err(err.into());
        }
        self.broker.ack(delivery).await?;
        Ok(Outcome::DeadLettered)
    }
}

/// Running consumer group tasks.
#[derive(Debug)]
pub struct ConsumerGroupHandle {
    ctx: Context,
    tasks: Vec<JoinHandle<()>>,
}

impl ConsumerGroupHandle {
    /// Stops polling and waits for in-flight messages to settle.
    pub async fn shutdown(self) {
        self.ctx.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "consumer task ended abnormally");
            }
        }
    }
}
