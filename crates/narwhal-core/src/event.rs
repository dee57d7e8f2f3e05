//! Domain event abstractions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::Context;

/// Current schema version stamped on newly produced events.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Free-form metadata mapping carried by every event.
pub type EventAttributes = BTreeMap<String, serde_json::Value>;

/// Metadata attached to every domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Type name for deserialization routing.
    pub event_type: String,
    /// Aggregate this event belongs to.
    pub aggregate_id: Uuid,
    /// Aggregate type tag (`Movie`, `Download`, `TranscodeJob`, ...).
    pub aggregate_type: String,
    /// Aggregate version after this event was applied.
    pub sequence_number: i64,
    /// Payload schema version.
    pub schema_version: i32,
    /// Bounded context that produced the event.
    pub bounded_context: String,
    /// Correlation id of the operation that produced the event.
    pub correlation_id: String,
    /// Parent event or command, if known.
    pub causation_id: Option<String>,
    /// Timestamp of event creation.
    pub occurred_at: DateTime<Utc>,
    /// Free-form metadata.
    pub attributes: EventAttributes,
}

impl EventMetadata {
    /// Stamps metadata for an event produced in `ctx`.
    #[must_use]
    pub fn new(
        event_type: &str,
        aggregate_type: &str,
        aggregate_id: Uuid,
        sequence_number: i64,
        bounded_context: &str,
        ctx: &Context,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_owned(),
            aggregate_id,
            aggregate_type: aggregate_type.to_owned(),
            sequence_number,
            schema_version: CURRENT_SCHEMA_VERSION,
            bounded_context: bounded_context.to_owned(),
            correlation_id: ctx.correlation_id().to_owned(),
            causation_id: ctx.causation_id().map(str::to_owned),
            occurred_at,
            attributes: EventAttributes::new(),
        }
    }
}

/// Trait that all domain events implement.
pub trait DomainEvent: Send + Sync + std::fmt::Debug {
    /// Returns the event type name (used for serialization routing).
    fn event_type(&self) -> &'static str;

    /// Serializes the event payload to JSON.
    fn to_payload(&self) -> serde_json::Value;

    /// Returns the metadata for this event.
    fn metadata(&self) -> &EventMetadata;
}
