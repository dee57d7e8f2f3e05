//! Integration event envelope and subject mapping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{CAUSATION_ID_KEY, CORRELATION_ID_KEY, Context};
use crate::error::DomainError;
use crate::event::{CURRENT_SCHEMA_VERSION, DomainEvent, EventAttributes};

/// Aggregate type tags that route onto the `media.>` stream.
pub const MEDIA_AGGREGATE_TYPES: [&str; 3] = ["Series", "Episode", "Movie"];

/// Transport-layer wrapper around an integration event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationEnvelope {
    /// Unique event identifier; also the broker deduplication key.
    pub event_id: Uuid,
    /// Event type string.
    pub event_type: String,
    /// Aggregate the event belongs to.
    pub aggregate_id: Uuid,
    /// Aggregate type tag.
    pub aggregate_type: String,
    /// Payload schema version.
    pub event_version: i32,
    /// Trace correlation id.
    pub correlation_id: Option<String>,
    /// Parent event id.
    pub causation_id: Option<String>,
    /// When the event happened.
    pub occurred_at: DateTime<Utc>,
    /// Set when the envelope is handed to the broker.
    pub published_at: Option<DateTime<Utc>>,
    /// Event-specific payload.
    pub data: serde_json::Value,
    /// Free-form metadata.
    pub metadata: EventAttributes,
}

impl IntegrationEnvelope {
    /// Builds an envelope for an event produced in `ctx`.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: Uuid,
        data: serde_json::Value,
        ctx: &Context,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_version: CURRENT_SCHEMA_VERSION,
            correlation_id: Some(ctx.correlation_id().to_owned()),
            causation_id: ctx.causation_id().map(str::to_owned),
            occurred_at,
            published_at: None,
            data,
            metadata: EventAttributes::new(),
        }
    }

    /// Wraps a persisted domain event for publication.
    ///
    /// The event id is preserved so a republish by a reconciliation sweep
    /// deduplicates against the original publish.
    #[must_use]
    pub fn from_domain_event(event: &dyn DomainEvent) -> Self {
        let meta = event.metadata();
        Self {
            event_id: meta.event_id,
            event_type: event.event_type().to_owned(),
            aggregate_id: meta.aggregate_id,
            aggregate_type: meta.aggregate_type.clone(),
            event_version: meta.schema_version,
            correlation_id: Some(meta.correlation_id.clone()),
            causation_id: meta.causation_id.clone(),
            occurred_at: meta.occurred_at,
            published_at: None,
            data: event.to_payload(),
            metadata: meta.attributes.clone(),
        }
    }

    /// Adds a metadata attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Broker subject this envelope is published on.
    #[must_use]
    pub fn subject(&self) -> String {
        subject_for(&self.aggregate_type, &self.event_type)
    }

    /// Stamps the publication time.
    pub fn mark_published(&mut self, at: DateTime<Utc>) {
        self.published_at = Some(at);
    }

    /// Transport headers derived from the envelope.
    #[must_use]
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![("event_type".to_owned(), self.event_type.clone())];
        if let Some(correlation_id) = &self.correlation_id {
            headers.push((CORRELATION_ID_KEY.to_owned(), correlation_id.clone()));
        }
        if let Some(causation_id) = &self.causation_id {
            headers.push((CAUSATION_ID_KEY.to_owned(), causation_id.clone()));
        }
        headers
    }

    /// Serializes the envelope to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Decode` if the payload cannot be serialized.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DomainError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses an envelope from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Decode` if the bytes are not a valid envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DomainError> {
        serde_json::from_slice(bytes)
            .map_err(|e| DomainError::Decode(format!("invalid envelope: {e}")))
    }

    /// A context continuing the trace of this envelope, caused by it.
    #[must_use]
    pub fn continue_in(&self, ctx: &Context) -> Context {
        let ctx = match &self.correlation_id {
            Some(correlation_id) => ctx.clone().with_correlation(correlation_id.clone()),
            None => ctx.clone(),
        };
        ctx.with_causation(self.event_id.to_string())
    }
}

/// Derives the broker subject for an aggregate type and event type.
///
/// Media aggregates share `media.<type>.<event>`, the other known
/// aggregates map onto their domain prefix, everything else onto
/// `<type>.<event>`. Aggregate type tokens are lowercased.
#[must_use]
pub fn subject_for(aggregate_type: &str, event_type: &str) -> String {
    match aggregate_type {
        t if MEDIA_AGGREGATE_TYPES.contains(&t) => {
            format!("media.{}.{event_type}", t.to_lowercase())
        }
        "Download" => format!("download.{event_type}"),
        "TranscodeJob" => format!("transcode.{event_type}"),
        "Saga" => format!("saga.{event_type}"),
        other => format!("{}.{event_type}", other.to_lowercase()),
    }
}
