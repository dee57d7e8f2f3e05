//! The streaming broker seam.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use narwhal_core::context::{CORRELATION_ID_KEY, Context};
use narwhal_core::ports::PublishAck;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{BrokerSettings, ConsumerConfig, StreamConfig};
use crate::error::BrokerError;
use crate::memory::MemoryBroker;

/// Message headers.
pub type Headers = BTreeMap<String, String>;

/// Header carrying the deduplication key.
pub const MSG_ID_HEADER: &str = "msg_id";

/// Header carrying the publishing client identity.
pub const CLIENT_ID_HEADER: &str = "client_id";

/// A message handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Concrete subject.
    pub subject: String,
    /// Headers; `msg_id` enables deduplication.
    pub headers: Headers,
    /// Body.
    pub payload: Bytes,
}

impl OutboundMessage {
    /// A message without headers.
    #[must_use]
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            headers: Headers::new(),
            payload: payload.into(),
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets the deduplication key.
    #[must_use]
    pub fn with_msg_id(self, msg_id: impl Into<String>) -> Self {
        self.with_header(MSG_ID_HEADER, msg_id)
    }

    /// The deduplication key, if any.
    #[must_use]
    pub fn msg_id(&self) -> Option<&str> {
        self.headers.get(MSG_ID_HEADER).map(String::as_str)
    }
}

/// A message persisted in a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Owning stream.
    pub stream: String,
    /// Stream sequence.
    pub sequence: u64,
    /// Subject it was published on.
    pub subject: String,
    /// Headers.
    pub headers: Headers,
    /// Body.
    pub payload: Bytes,
    /// When the stream accepted it.
    pub published_at: DateTime<Utc>,
}

/// One delivery of a stored message to a durable consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The delivered message.
    pub message: StoredMessage,
    /// Durable consumer name.
    pub consumer: String,
    /// How many times this message has been delivered to the consumer, including this one.
    pub num_delivered: u32,
}

impl Delivery {
    /// The correlation id header, if present and non-empty.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.message
            .headers
            .get(CORRELATION_ID_KEY)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }
}

/// State of a stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    /// Configuration in effect.
    pub config: StreamConfig,
    /// Retained messages.
    pub messages: u64,
    /// Oldest retained sequence (0 when empty).
    pub first_sequence: u64,
    /// Latest assigned sequence.
    pub last_sequence: u64,
    /// Durable consumers on the stream.
    pub consumers: usize,
}

/// State of a durable consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerInfo {
    /// Stream name.
    pub stream: String,
    /// Configuration in effect.
    pub config: ConsumerConfig,
    /// Matching messages not yet delivered.
    pub num_pending: u64,
    /// Delivered messages awaiting acknowledgement.
    pub num_ack_pending: usize,
    /// Deliveries beyond the first.
    pub num_redelivered: u64,
    /// Every sequence at or below this is acknowledged.
    pub ack_floor: u64,
    /// Highest stream sequence handed out.
    pub delivered_sequence: u64,
}

/// A persistent streaming broker with durable pull consumers.
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Creates a stream or updates its configuration.
    async fn ensure_stream(&self, config: StreamConfig) -> Result<StreamInfo, BrokerError>;

    /// Creates a durable consumer or updates its configuration, keeping its position.
    async fn ensure_consumer(&self, stream: &str, config: ConsumerConfig) -> Result<ConsumerInfo, BrokerError>;

    /// Persists a message in the stream capturing its subject.
    async fn publish(&self, ctx: &Context, message: OutboundMessage) -> Result<PublishAck, BrokerError>;

    /// Pulls one message, waiting up to `max_wait`.
    async fn fetch(
        &self,
        ctx: &Context,
        stream: &str,
        consumer: &str,
        max_wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledges a delivery. Acknowledging twice is a no-op.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Requests redelivery, after `delay` if given.
    async fn nak(&self, delivery: &Delivery, delay: Option<Duration>) -> Result<(), BrokerError>;

    /// State of a stream.
    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, BrokerError>;

    /// State of a durable consumer.
    async fn consumer_info(&self, stream: &str, consumer: &str) -> Result<ConsumerInfo, BrokerError>;

    /// Retained messages of a stream, optionally filtered by subject pattern.
    async fn stream_messages(&self, stream: &str, filter: Option<&str>) -> Result<Vec<StoredMessage>, BrokerError>;
}

/// Connects to the broker named by `settings.url`, retrying up to
/// `reconnect_max` times.
///
/// # Errors
///
/// Returns `BrokerError::Invalid` for an unsupported URL scheme and
/// `BrokerError::Connection` when every attempt failed.
pub async fn connect(settings: &BrokerSettings) -> Result<Arc<dyn StreamBroker>, BrokerError> {
    let attempts = settings.reconnect_max.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match open(settings) {
            Ok(broker) => {
                info!(url = %settings.url, client_id = %settings.client_id, attempt, "broker connected");
                return Ok(broker);
            }
            Err(err @ BrokerError::Invalid(_)) => return Err(err),
            Err(err) => {
                warn!(url = %settings.url, attempt, error = %err, "broker connection attempt failed");
                last_error = Some(err);
                tokio::time::sleep(settings.reconnect_wait).await;
            }
        }
    }
    Err(last_error.unwrap_or_else(|| BrokerError::Connection(settings.url.clone())))
}

fn open(settings: &BrokerSettings) -> Result<Arc<dyn StreamBroker>, BrokerError> {
    match settings.url.split_once("://") {
        Some(("memory", _)) => Ok(Arc::new(MemoryBroker::new())),
        _ => Err(BrokerError::Invalid(format!(
            "unsupported broker url {}: only memory:// is available",
            settings.url
        ))),
    }
}

/// Creates every stream in `streams`.
///
/// # Errors
///
/// Propagates the first stream creation failure.
pub async fn ensure_streams(broker: &dyn StreamBroker, streams: Vec<StreamConfig>) -> Result<(), BrokerError> {
    for config in streams {
        let info = broker.ensure_stream(config).await?;
        info!(stream = %info.config.name, subjects = ?info.config.subjects, "stream ready");
    }
    Ok(())
}
