//! Stream and consumer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Default deduplication window for message ids.
pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

/// Name of the dead-letter stream.
pub const DLQ_STREAM: &str = "DLQ";

/// Storage medium requested for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// Disk-backed.
    File,
    /// Memory only.
    Memory,
}

/// What happens when a stream reaches a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardPolicy {
    /// Drop the oldest messages to make room.
    Old,
    /// Reject new messages.
    New,
}

/// Configuration of one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stream name.
    pub name: String,
    /// Subject patterns captured by the stream.
    pub subjects: Vec<String>,
    /// Messages older than this are discarded.
    pub max_age: Duration,
    /// Maximum retained messages, if bounded.
    pub max_messages: Option<u64>,
    /// Storage medium.
    pub storage: StorageType,
    /// Discard policy at limits.
    pub discard: DiscardPolicy,
    /// Window during which a repeated message id is a duplicate.
    pub duplicate_window: Duration,
}

impl StreamConfig {
    /// A file-backed, discard-old stream over `subjects`.
    #[must_use]
    pub fn new(name: impl Into<String>, subjects: &[&str], max_age: Duration) -> Self {
        Self {
            name: name.into(),
            subjects: subjects.iter().map(|s| (*s).to_owned()).collect(),
            max_age,
            max_messages: None,
            storage: StorageType::File,
            discard: DiscardPolicy::Old,
            duplicate_window: DEFAULT_DUPLICATE_WINDOW,
        }
    }

    /// Bounds the number of retained messages.
    #[must_use]
    pub fn with_max_messages(mut self, max_messages: u64) -> Self {
        self.max_messages = Some(max_messages);
        self
    }
}

/// The streams of the processing backbone.
#[must_use]
pub fn default_streams() -> Vec<StreamConfig> {
    vec![
        StreamConfig::new("MEDIA_EVENTS", &["media.>"], DAY * 30),
        StreamConfig::new("DOWNLOAD_EVENTS", &["download.>"], DAY * 7),
        StreamConfig::new("TRANSCODE_EVENTS", &["transcode.>"], DAY * 7),
        StreamConfig::new("SAGA_EVENTS", &["saga.>"], DAY * 7),
        StreamConfig::new(DLQ_STREAM, &["dlq.>"], DAY * 30),
    ]
}

/// Where a new durable consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    /// Replay the whole stream.
    All,
    /// Only messages published after creation.
    New,
}

/// Configuration of a durable pull consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Durable name.
    pub durable_name: String,
    /// Only messages whose subject matches are delivered.
    pub filter_subject: Option<String>,
    /// Unacknowledged deliveries are redelivered after this long.
    pub ack_wait: Duration,
    /// Maximum deliveries of one message.
    pub max_deliver: u32,
    /// Maximum outstanding unacknowledged deliveries.
    pub max_ack_pending: usize,
    /// Start position on first subscribe.
    pub deliver_policy: DeliverPolicy,
}

impl ConsumerConfig {
    /// Explicit-ack consumer with the backbone defaults.
    #[must_use]
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            durable_name: name.into(),
            filter_subject: None,
            ack_wait: Duration::from_secs(30),
            max_deliver: 5,
            max_ack_pending: 100,
            deliver_policy: DeliverPolicy::All,
        }
    }
}

/// Settings of a consumer group.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerGroupConfig {
    /// Durable name shared by the per-stream consumers; also names the DLQ subject.
    pub name: String,
    /// Streams consumed.
    pub streams: Vec<String>,
    /// Handler attempts within a single delivery.
    pub max_retries: u32,
    /// Backoff after attempt `n` is `retry_backoff_unit * n²`.
    pub retry_backoff_unit: Duration,
    /// Broker ack-wait.
    pub ack_wait: Duration,
    /// Broker max deliveries.
    pub max_deliver: u32,
    /// Broker max ack pending.
    pub max_ack_pending: usize,
    /// How long a single pull waits for a message.
    pub fetch_wait: Duration,
}

impl ConsumerGroupConfig {
    /// A group over every non-DLQ backbone stream.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            streams: default_streams()
                .into_iter()
                .map(|s| s.name)
                .filter(|name| name != DLQ_STREAM)
                .collect(),
            max_retries: 3,
            retry_backoff_unit: Duration::from_secs(1),
            ack_wait: Duration::from_secs(30),
            max_deliver: 5,
            max_ack_pending: 100,
            fetch_wait: Duration::from_secs(5),
        }
    }

    /// The durable consumer configuration for one stream.
    #[must_use]
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            ack_wait: self.ack_wait,
            max_deliver: self.max_deliver,
            max_ack_pending: self.max_ack_pending,
            ..ConsumerConfig::durable(self.name.clone())
        }
    }

    /// Subject of this group's dead-letter queue.
    #[must_use]
    pub fn dlq_subject(&self) -> String {
        dlq_subject(&self.name)
    }
}

/// Dead-letter subject of a consumer group.
#[must_use]
pub fn dlq_subject(consumer: &str) -> String {
    format!("dlq.{consumer}")
}

/// Connection settings of the broker client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Broker URL.
    pub url: String,
    /// Client identity.
    pub client_id: String,
    /// Connection attempts before giving up.
    pub reconnect_max: u32,
    /// Wait between connection attempts.
    pub reconnect_wait: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: "memory://".to_owned(),
            client_id: "narwhal".to_owned(),
            reconnect_max: 10,
            reconnect_wait: Duration::from_secs(2),
        }
    }
}
