//! Event-type → decoder registry for inbound envelopes.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::envelope::IntegrationEnvelope;
use crate::error::DomainError;

type Payload = Arc<dyn Any + Send + Sync>;
type Decoder = Arc<dyn Fn(&serde_json::Value) -> Result<Payload, DomainError> + Send + Sync>;

/// A payload decoded by its registered type.
#[derive(Clone)]
pub struct DecodedEvent {
    event_type: String,
    payload: Payload,
}

impl std::fmt::Debug for DecodedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedEvent")
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}

impl DecodedEvent {
    /// Event type the payload was decoded for.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The payload as `T`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Decode` if `T` is not the registered type.
    pub fn downcast_ref<T: 'static>(&self) -> Result<&T, DomainError> {
        self.payload.downcast_ref::<T>().ok_or_else(|| {
            DomainError::Decode(format!("decoder for {} produces a different type", self.event_type))
        })
    }
}

/// Maps event types to payload decoders.
#[derive(Default, Clone)]
pub struct EventRegistry {
    decoders: HashMap<String, Decoder>,
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.decoders.keys().collect();
        types.sort();
        f.debug_struct("EventRegistry").field("event_types", &types).finish()
    }
}

impl EventRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` as the payload type of `event_type`.
    pub fn register<T>(&mut self, event_type: &str)
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let owned_type = event_type.to_owned();
        self.decoders.insert(
            event_type.to_owned(),
            Arc::new(move |value| {
                serde_json::from_value::<T>(value.clone())
                    .map(|decoded| Arc::new(decoded) as Payload)
                    .map_err(|e| DomainError::Decode(format!("invalid {owned_type} payload: {e}")))
            }),
        );
    }

    /// Whether a decoder exists for `event_type`.
    #[must_use]
    pub fn contains(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    /// Decodes the payload of `envelope` by its registered type.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Decode` when the event type is unknown or the
    /// payload does not parse.
    pub fn decode_event(&self, envelope: &IntegrationEnvelope) -> Result<DecodedEvent, DomainError> {
        let decoder = self.decoders.get(&envelope.event_type).ok_or_else(|| {
            DomainError::Decode(format!("no decoder registered for {}", envelope.event_type))
        })?;
        Ok(DecodedEvent {
            event_type: envelope.event_type.clone(),
            payload: decoder(&envelope.data)?,
        })
    }

    /// Decodes the payload of `envelope` into `T`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Decode` when the event type is unknown, the
    /// payload does not parse, or `T` is not the registered type.
    pub fn decode<T: Clone + 'static>(&self, envelope: &IntegrationEnvelope) -> Result<T, DomainError> {
        self.decode_event(envelope)?.downcast_ref::<T>().cloned()
    }
}
