//! Dead-letter queue: one subject per consumer group on the `DLQ` stream.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use narwhal_core::clock::Clock;
use narwhal_core::context::Context;
use narwhal_core::ports::PublishAck;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::broker::{Delivery, OutboundMessage, StreamBroker};
use crate::config::{DLQ_STREAM, dlq_subject};
use crate::error::BrokerError;
use crate::publisher::EventPublisher;

/// A message that exhausted its delivery budget or could not be decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Subject the message was originally published on.
    pub original_subject: String,
    /// Original body, unchanged.
    pub original_payload: Bytes,
    /// The final handling error.
    pub error: String,
    /// Deliveries made before dead-lettering.
    pub num_delivered: u32,
    /// Stream the message came from.
    pub stream: String,
    /// Sequence in that stream.
    pub stream_sequence: u64,
    /// Consumer group that gave up.
    pub consumer: String,
    /// When the record was written.
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// The record for `delivery` failing with `error`.
    #[must_use]
    pub fn from_delivery(delivery: &Delivery, error: &str, failed_at: DateTime<Utc>) -> Self {
        Self {
            original_subject: delivery.message.subject.clone(),
            original_payload: delivery.message.payload.clone(),
            error: error.to_owned(),
            num_delivered: delivery.num_delivered,
            stream: delivery.message.stream.clone(),
            stream_sequence: delivery.message.sequence,
            consumer: delivery.consumer.clone(),
            failed_at,
        }
    }
}

/// Writes and inspects the dead letters of one consumer group.
///
/// Entries are never replayed automatically.
pub struct DeadLetterQueue {
    broker: Arc<dyn StreamBroker>,
    publisher: Arc<EventPublisher>,
    clock: Arc<dyn Clock>,
    consumer: String,
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("subject", &self.subject())
            .finish_non_exhaustive()
    }
}

impl DeadLetterQueue {
    /// The dead-letter queue of `consumer`.
    #[must_use]
    pub fn new(
        broker: Arc<dyn StreamBroker>,
        publisher: Arc<EventPublisher>,
        clock: Arc<dyn Clock>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            publisher,
            clock,
            consumer: consumer.into(),
        }
    }

    /// Subject the records are published on.
    #[must_use]
    pub fn subject(&self) -> String {
        dlq_subject(&self.consumer)
    }

    /// Dead-letters `delivery`.
    ///
    /// The record is deduplicated by origin stream and sequence, so a retry
    /// after a lost acknowledgement does not produce a second entry.
    ///
    /// # Errors
    ///
    /// Returns the publish failure; the caller must not acknowledge the
    /// original delivery in that case.
    pub async fn send(&self, ctx: &Context, delivery: &Delivery, reason: &str) -> Result<PublishAck, BrokerError> {
        let record = DeadLetterRecord::from_delivery(delivery, reason, self.clock.now());
        let body = serde_json::to_vec(&record)
            .map_err(|e| BrokerError::Invalid(format!("dead letter not serializable: {e}")))?;
        let message = OutboundMessage::new(self.subject(), body)
            .with_msg_id(format!(
                "{}:{}:{}",
                self.consumer, delivery.message.stream, delivery.message.sequence
            ))
            .with_header("original_subject", delivery.message.subject.clone());
        match self.publisher.publish_message(ctx, message).await {
            Ok(ack) => {
                error!(
                    consumer = %self.consumer,
                    stream = %delivery.message.stream,
                    subject = %delivery.message.subject,
                    sequence = delivery.message.sequence,
                    num_delivered = delivery.num_delivered,
                    error = reason,
                    "message dead-lettered"
                );
                Ok(ack)
            }
            Err(err) => {
                warn!(consumer = %self.consumer, error = %err, "dead-letter publish failed");
                Err(err)
            }
        }
    }

    /// Every record currently retained for this consumer group.
    ///
    /// # Errors
    ///
    /// Returns the broker failure, or `BrokerError::Invalid` if a retained
    /// entry is not a dead-letter record.
    pub async fn list(&self) -> Result<Vec<DeadLetterRecord>, BrokerError> {
        self.broker
            .stream_messages(DLQ_STREAM, Some(&self.subject()))
            .await?
            .iter()
            .map(|message| {
                serde_json::from_slice(&message.payload)
                    .map_err(|e| BrokerError::Invalid(format!("corrupt dead letter {}: {e}", message.sequence)))
            })
            .collect()
    }
}
