//! Narwhal Broker — the durable event backbone.
//!
//! Integration envelopes are published onto per-domain streams and consumed
//! by durable consumer groups with explicit acknowledgement, bounded
//! redelivery and a per-group dead-letter queue.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod error;
pub mod memory;
pub mod publisher;
pub mod subject;

pub use broker::{Delivery, OutboundMessage, StoredMessage, StreamBroker, connect, ensure_streams};
pub use config::{BrokerSettings, ConsumerConfig, ConsumerGroupConfig, StreamConfig, default_streams};
pub use consumer::{ConsumerGroup, ConsumerGroupHandle, EventHandler, Outcome};
pub use dlq::{DeadLetterQueue, DeadLetterRecord};
pub use error::BrokerError;
pub use memory::MemoryBroker;
pub use publisher::EventPublisher;
