//! Envelope publisher bound by an acknowledgement timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use narwhal_core::clock::Clock;
use narwhal_core::context::Context;
use narwhal_core::envelope::IntegrationEnvelope;
use narwhal_core::error::DomainError;
use narwhal_core::ports::{IntegrationPublisher, PublishAck};
use tracing::{debug, warn};

use crate::broker::{CLIENT_ID_HEADER, OutboundMessage, StreamBroker};
use crate::error::BrokerError;

/// Publishes integration envelopes onto their derived subjects.
///
/// The event id is the deduplication key, so a retried publish of the same
/// envelope inside the broker's duplicate window is acknowledged without
/// creating a second message.
pub struct EventPublisher {
    broker: Arc<dyn StreamBroker>,
    clock: Arc<dyn Clock>,
    client_id: String,
    timeout: Duration,
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("client_id", &self.client_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl EventPublisher {
    /// Acknowledgement timeout applied to every publish.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Creates a publisher over `broker`.
    #[must_use]
    pub fn new(broker: Arc<dyn StreamBroker>, clock: Arc<dyn Clock>) -> Self {
        Self {
            broker,
            clock,
            client_id: "narwhal".to_owned(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Sets the client identity recorded on every message.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Overrides the acknowledgement timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Publishes a raw message under the acknowledgement timeout.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::PublishTimeout` when the broker does not
    /// acknowledge in time, or the broker's own failure.
    pub async fn publish_message(&self, ctx: &Context, message: OutboundMessage) -> Result<PublishAck, BrokerError> {
        let subject = message.subject.clone();
        let message = message.with_header(CLIENT_ID_HEADER, self.client_id.clone());
        match tokio::time::timeout(self.timeout, self.broker.publish(ctx, message)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(subject = %subject, timeout = ?self.timeout, "publish not acknowledged");
                Err(BrokerError::PublishTimeout {
                    subject,
                    timeout: self.timeout,
                })
            }
        }
    }
}

#[async_trait]
impl IntegrationPublisher for EventPublisher {
    async fn publish(&self, ctx: &Context, mut envelope: IntegrationEnvelope) -> Result<PublishAck, DomainError> {
        if envelope.correlation_id.is_none() {
            envelope.correlation_id = Some(ctx.correlation_id().to_owned());
        }
        envelope.mark_published(self.clock.now());
        let subject = envelope.subject();
        let mut message = OutboundMessage::new(subject.clone(), envelope.to_bytes()?)
            .with_msg_id(envelope.event_id.to_string());
        for (key, value) in envelope.headers() {
            message = message.with_header(key, value);
        }

        let ack = self.publish_message(ctx, message).await?;
        debug!(
            subject = %subject,
            stream = %ack.stream,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            "envelope published"
        );
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Delivery, StoredMessage, StreamInfo, ConsumerInfo};
    use crate::config::{ConsumerConfig, StreamConfig, default_streams};
    use crate::memory::MemoryBroker;
    use chrono::{TimeZone, Utc};
    use narwhal_core::clock::SystemClock;
    use narwhal_test_support::FixedClock;
    use uuid::Uuid;

    async fn backbone() -> Arc<MemoryBroker> {
        let broker = Arc::new(MemoryBroker::new());
        crate::broker::ensure_streams(broker.as_ref(), default_streams()).await.unwrap();
        broker
    }

    fn envelope(ctx: &Context) -> IntegrationEnvelope {
        IntegrationEnvelope::new(
            "MediaCreated",
            "Movie",
            Uuid::new_v4(),
            serde_json::json!({"title": "Heat"}),
            ctx,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_publish_routes_to_subject_and_stamps_published_at() {
        // Arrange
        let broker = backbone().await;
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let publisher = EventPublisher::new(broker.clone(), Arc::new(FixedClock(at)));
        let ctx = Context::background().with_correlation("trace-9");
        let envelope = envelope(&ctx);

        // Act
        let ack = publisher.publish(&ctx, envelope.clone()).await.unwrap();

        // Assert
        assert_eq!(ack.stream, "MEDIA_EVENTS");
        let stored = broker.stream_messages("MEDIA_EVENTS", None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].subject, "media.movie.MediaCreated");
        assert_eq!(stored[0].headers.get("correlation_id").map(String::as_str), Some("trace-9"));
        assert_eq!(stored[0].headers.get("msg_id"), Some(&envelope.event_id.to_string()));
        let decoded = IntegrationEnvelope::from_bytes(&stored[0].payload).unwrap();
        assert_eq!(decoded.published_at, Some(at));
        assert_eq!(decoded.event_id, envelope.event_id);
    }

    #[tokio::test]
    async fn test_republishing_same_envelope_is_idempotent() {
        let broker = backbone().await;
        let publisher = EventPublisher::new(broker.clone(), Arc::new(SystemClock));
        let ctx = Context::background();
        let envelope = envelope(&ctx);

        let first = publisher.publish(&ctx, envelope.clone()).await.unwrap();
        let second = publisher.publish(&ctx, envelope).await.unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(broker.stream_info("MEDIA_EVENTS").await.unwrap().messages, 1);
    }

    struct StalledBroker;

    #[async_trait]
    impl StreamBroker for StalledBroker {
        async fn ensure_stream(&self, _config: StreamConfig) -> Result<StreamInfo, BrokerError> {
            unreachable!()
        }
        async fn ensure_consumer(&self, _stream: &str, _config: ConsumerConfig) -> Result<ConsumerInfo, BrokerError> {
            unreachable!()
        }
        async fn publish(&self, _ctx: &Context, _message: OutboundMessage) -> Result<PublishAck, BrokerError> {
            std::future::pending().await
        }
        async fn fetch(
            &self,
            _ctx: &Context,
            _stream: &str,
            _consumer: &str,
            _max_wait: Duration,
        ) -> Result<Option<Delivery>, BrokerError> {
            unreachable!()
        }
        async fn ack(&self, _delivery: &Delivery) -> Result<(), BrokerError> {
            unreachable!()
        }
        async fn nak(&self, _delivery: &Delivery, _delay: Option<Duration>) -> Result<(), BrokerError> {
            unreachable!()
        }
        async fn stream_info(&self, _stream: &str) -> Result<StreamInfo, BrokerError> {
            unreachable!()
        }
        async fn consumer_info(&self, _stream: &str, _consumer: &str) -> Result<ConsumerInfo, BrokerError> {
            unreachable!()
        }
        async fn stream_messages(&self, _stream: &str, _filter: Option<&str>) -> Result<Vec<StoredMessage>, BrokerError> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_unacknowledged_publish_times_out_as_transient() {
        let publisher = EventPublisher::new(Arc::new(StalledBroker), Arc::new(SystemClock))
            .with_timeout(Duration::from_millis(20));
        let ctx = Context::background();

        let err = publisher.publish(&ctx, envelope(&ctx)).await.unwrap_err();

        assert!(matches!(err, DomainError::Transient(_)));
        assert!(err.to_string().contains("not acknowledged"));
    }
}
