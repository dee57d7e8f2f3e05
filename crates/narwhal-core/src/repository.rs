//! Persistence abstractions: event store, aggregate store, unit of work.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::aggregate::AggregateRoot;
use crate::context::Context;
use crate::envelope::IntegrationEnvelope;
use crate::error::DomainError;
use crate::event::{DomainEvent, EventAttributes};

/// Stored representation of a domain event.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Aggregate this event belongs to.
    pub aggregate_id: Uuid,
    /// Aggregate type tag.
    pub aggregate_type: String,
    /// Event type name for deserialization routing.
    pub event_type: String,
    /// Payload schema version.
    pub schema_version: i32,
    /// Serialized event payload.
    pub payload: serde_json::Value,
    /// Aggregate version after the event.
    pub sequence_number: i64,
    /// Correlation ID for tracing.
    pub correlation_id: String,
    /// Causation ID linking to the causing event/command.
    pub causation_id: Option<String>,
    /// Timestamp of event creation.
    pub occurred_at: DateTime<Utc>,
    /// Set once the integration envelope was accepted by the broker.
    pub published_at: Option<DateTime<Utc>>,
    /// Free-form metadata.
    pub metadata: EventAttributes,
}

impl StoredEvent {
    /// Captures a domain event for persistence.
    #[must_use]
    pub fn from_domain_event(event: &dyn DomainEvent) -> Self {
        let meta = event.metadata();
        Self {
            event_id: meta.event_id,
            aggregate_id: meta.aggregate_id,
            aggregate_type: meta.aggregate_type.clone(),
            event_type: event.event_type().to_owned(),
            schema_version: meta.schema_version,
            payload: event.to_payload(),
            sequence_number: meta.sequence_number,
            correlation_id: meta.correlation_id.clone(),
            causation_id: meta.causation_id.clone(),
            occurred_at: meta.occurred_at,
            published_at: None,
            metadata: meta.attributes.clone(),
        }
    }

    /// The integration envelope for this event, keeping its event id.
    #[must_use]
    pub fn to_envelope(&self) -> IntegrationEnvelope {
        IntegrationEnvelope {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type.clone(),
            event_version: self.schema_version,
            correlation_id: Some(self.correlation_id.clone()),
            causation_id: self.causation_id.clone(),
            occurred_at: self.occurred_at,
            published_at: self.published_at,
            data: self.payload.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Append-only store of domain events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persists events; participates in the context's transaction, if any.
    async fn save(&self, ctx: &Context, events: &[StoredEvent]) -> Result<(), DomainError>;

    /// Loads all events of an aggregate, ordered by sequence number.
    async fn load(&self, ctx: &Context, aggregate_id: Uuid) -> Result<Vec<StoredEvent>, DomainError>;

    /// Events whose integration envelope has not been published yet.
    async fn unpublished(&self, ctx: &Context, limit: usize) -> Result<Vec<StoredEvent>, DomainError>;

    /// Records the publication time of an event.
    async fn mark_published(
        &self,
        ctx: &Context,
        event_id: Uuid,
        published_at: DateTime<Utc>,
    ) -> Result<(), DomainError>;
}

/// Document store of aggregates with optimistic concurrency.
#[async_trait]
pub trait AggregateStore<A: AggregateRoot>: Send + Sync {
    /// Persists the aggregate.
    ///
    /// The stored version must equal the aggregate's persisted version
    /// (0 for a new aggregate); on success the aggregate is marked persisted.
    /// Fails with `DomainError::ConcurrentModification` otherwise.
    async fn save(&self, ctx: &Context, aggregate: &mut A) -> Result<(), DomainError>;

    /// Loads an aggregate by id.
    async fn find_by_id(&self, ctx: &Context, id: Uuid) -> Result<Option<A>, DomainError>;

    /// Removes an aggregate. Deleting a missing aggregate fails with `NotFound`.
    async fn delete(&self, ctx: &Context, id: Uuid) -> Result<(), DomainError>;

    /// Aggregates whose top-level document field equals `value`.
    async fn find_by_field(
        &self,
        ctx: &Context,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<Vec<A>, DomainError>;

    /// Every stored aggregate.
    async fn find_all(&self, ctx: &Context) -> Result<Vec<A>, DomainError>;
}

/// A unit of work spanning the aggregate store and the event store.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Opens a transaction. Repository calls made with
    /// [`Transaction::context`] participate in it.
    async fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction>, DomainError>;
}

/// An open transaction.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Context to pass to repositories so their writes join this transaction.
    fn context(&self) -> &Context;

    /// Makes every staged write durable atomically.
    async fn commit(self: Box<Self>) -> Result<(), DomainError>;

    /// Discards every staged write.
    async fn rollback(self: Box<Self>) -> Result<(), DomainError>;
}

/// Stored events for every uncommitted event of `aggregate`.
#[must_use]
pub fn stored_events_of<A: AggregateRoot>(aggregate: &A) -> Vec<StoredEvent> {
    aggregate
        .uncommitted_events()
        .iter()
        .map(|event| StoredEvent::from_domain_event(event))
        .collect()
}
