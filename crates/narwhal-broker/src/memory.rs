//! In-process broker with durable-stream semantics.
//!
//! Streams keep messages in sequence order, enforce their retention bounds on
//! every write and read, and deduplicate by `msg_id` inside the duplicate
//! window. Durable consumers track their position, outstanding deliveries
//! and delivery counts; an unacknowledged delivery becomes eligible again
//! after `ack_wait` until `max_deliver` is reached.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use narwhal_core::context::Context;
use narwhal_core::ports::PublishAck;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::broker::{ConsumerInfo, Delivery, OutboundMessage, StoredMessage, StreamBroker, StreamInfo};
use crate::config::{ConsumerConfig, DeliverPolicy, DiscardPolicy, StreamConfig};
use crate::error::BrokerError;
use crate::subject;

#[derive(Debug)]
struct Entry {
    message: StoredMessage,
    received: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    num_delivered: u32,
    eligible_at: Instant,
}

#[derive(Debug)]
struct ConsumerState {
    config: ConsumerConfig,
    next_sequence: u64,
    pending: BTreeMap<u64, Pending>,
    num_redelivered: u64,
}

impl ConsumerState {
    fn wants(&self, subject_name: &str) -> bool {
        self.config
            .filter_subject
            .as_deref()
            .is_none_or(|filter| subject::matches(filter, subject_name))
    }
}

#[derive(Debug)]
struct StreamState {
    config: StreamConfig,
    messages: BTreeMap<u64, Entry>,
    last_sequence: u64,
    dedup: HashMap<String, (u64, Instant)>,
    consumers: HashMap<String, ConsumerState>,
}

impl StreamState {
    fn new(config: StreamConfig) -> Self {
        Self {
            config,
            messages: BTreeMap::new(),
            last_sequence: 0,
            dedup: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    fn captures(&self, subject_name: &str) -> bool {
        self.config
            .subjects
            .iter()
            .any(|pattern| subject::matches(pattern, subject_name))
    }

    fn enforce_retention(&mut self, now: Instant) {
        let max_age = self.config.max_age;
        while let Some(entry) = self.messages.first_entry() {
            if now.saturating_duration_since(entry.get().received) > max_age {
                entry.remove();
            } else {
                break;
            }
        }
        if let Some(max) = self.config.max_messages {
            while self.messages.len() as u64 > max {
                self.messages.pop_first();
            }
        }
        let window = self.config.duplicate_window;
        self.dedup
            .retain(|_, (_, at)| now.saturating_duration_since(*at) <= window);
        let messages = &self.messages;
        for consumer in self.consumers.values_mut() {
            consumer.pending.retain(|seq, _| messages.contains_key(seq));
        }
    }

    fn first_sequence(&self) -> u64 {
        self.messages.keys().next().copied().unwrap_or(0)
    }

    fn info(&self) -> StreamInfo {
        StreamInfo {
            config: self.config.clone(),
            messages: self.messages.len() as u64,
            first_sequence: self.first_sequence(),
            last_sequence: self.last_sequence,
            consumers: self.consumers.len(),
        }
    }

    fn consumer_info(&self, name: &str) -> Option<ConsumerInfo> {
        let consumer = self.consumers.get(name)?;
        let num_pending = self
            .messages
            .range(consumer.next_sequence..)
            .filter(|(_, entry)| consumer.wants(&entry.message.subject))
            .count() as u64;
        let delivered_sequence = consumer.next_sequence.saturating_sub(1);
        let ack_floor = consumer
            .pending
            .keys()
            .next()
            .map_or(delivered_sequence, |seq| seq - 1);
        Some(ConsumerInfo {
            stream: self.config.name.clone(),
            config: consumer.config.clone(),
            num_pending,
            num_ack_pending: consumer.pending.len(),
            num_redelivered: consumer.num_redelivered,
            ack_floor,
            delivered_sequence,
        })
    }

    /// Next delivery for `name`, or the instant at which one may become eligible.
    fn next_delivery(&mut self, name: &str, now: Instant) -> Result<Result<Delivery, Option<Instant>>, BrokerError> {
        self.enforce_retention(now);
        let stream_name = self.config.name.clone();
        let messages = &self.messages;
        let consumer = self
            .consumers
            .get_mut(name)
            .ok_or_else(|| BrokerError::ConsumerNotFound {
                stream: stream_name.clone(),
                consumer: name.to_owned(),
            })?;
        let max_deliver = consumer.config.max_deliver;

        // Deliveries that reached max_deliver and timed out are abandoned.
        consumer
            .pending
            .retain(|_, p| p.num_delivered < max_deliver || p.eligible_at > now);

        let redelivery = consumer
            .pending
            .iter()
            .find(|(_, p)| p.num_delivered < max_deliver && p.eligible_at <= now)
            .map(|(seq, _)| *seq);
        if let Some(seq) = redelivery {
            if let (Some(pending), Some(entry)) = (consumer.pending.get_mut(&seq), messages.get(&seq)) {
                pending.num_delivered += 1;
                pending.eligible_at = now + consumer.config.ack_wait;
                consumer.num_redelivered += 1;
                return Ok(Ok(Delivery {
                    message: entry.message.clone(),
                    consumer: name.to_owned(),
                    num_delivered: pending.num_delivered,
                }));
            }
        }

        if consumer.pending.len() < consumer.config.max_ack_pending {
            let next = messages
                .range(consumer.next_sequence..)
                .find(|(_, entry)| consumer.wants(&entry.message.subject))
                .map(|(seq, entry)| (*seq, entry.message.clone()));
            if let Some((seq, message)) = next {
                consumer.next_sequence = seq + 1;
                consumer.pending.insert(
                    seq,
                    Pending {
                        num_delivered: 1,
                        eligible_at: now + consumer.config.ack_wait,
                    },
                );
                return Ok(Ok(Delivery {
                    message,
                    consumer: name.to_owned(),
                    num_delivered: 1,
                }));
            }
            if let Some(last) = messages.keys().next_back() {
                consumer.next_sequence = consumer.next_sequence.max(last + 1);
            }
        }

        let wake = consumer.pending.values().map(|p| p.eligible_at).min();
        Ok(Err(wake))
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    streams: BTreeMap<String, StreamState>,
}

impl BrokerState {
    fn stream_mut(&mut self, name: &str) -> Result<&mut StreamState, BrokerError> {
        self.streams
            .get_mut(name)
            .ok_or_else(|| BrokerError::StreamNotFound(name.to_owned()))
    }

    fn stream(&self, name: &str) -> Result<&StreamState, BrokerError> {
        self.streams
            .get(name)
            .ok_or_else(|| BrokerError::StreamNotFound(name.to_owned()))
    }
}

/// In-memory [`StreamBroker`].
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    activity: Notify,
}

impl MemoryBroker {
    /// An empty broker with no streams.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StreamBroker for MemoryBroker {
    async fn ensure_stream(&self, config: StreamConfig) -> Result<StreamInfo, BrokerError> {
        if config.subjects.is_empty() {
            return Err(BrokerError::Invalid(format!("stream {} has no subjects", config.name)));
        }
        let mut state = self.state.lock();
        for (name, other) in &state.streams {
            if *name != config.name
                && other.config.subjects.iter().any(|s| config.subjects.contains(s))
            {
                return Err(BrokerError::SubjectOverlap {
                    stream: config.name.clone(),
                    other: name.clone(),
                });
            }
        }
        let stream = state
            .streams
            .entry(config.name.clone())
            .or_insert_with(|| StreamState::new(config.clone()));
        stream.config = config;
        stream.enforce_retention(Instant::now());
        Ok(stream.info())
    }

    async fn ensure_consumer(&self, stream: &str, config: ConsumerConfig) -> Result<ConsumerInfo, BrokerError> {
        let mut state = self.state.lock();
        let stream_state = state.stream_mut(stream)?;
        let start = match config.deliver_policy {
            DeliverPolicy::All => stream_state.first_sequence().max(1),
            DeliverPolicy::New => stream_state.last_sequence + 1,
        };
        let name = config.durable_name.clone();
        stream_state
            .consumers
            .entry(name.clone())
            .and_modify(|existing| existing.config = config.clone())
            .or_insert_with(|| ConsumerState {
                config,
                next_sequence: start,
                pending: BTreeMap::new(),
                num_redelivered: 0,
            });
        stream_state
            .consumer_info(&name)
            .ok_or_else(|| BrokerError::ConsumerNotFound {
                stream: stream.to_owned(),
                consumer: name,
            })
    }

    async fn publish(&self, ctx: &Context, message: OutboundMessage) -> Result<PublishAck, BrokerError> {
        if ctx.is_cancelled() {
            return Err(BrokerError::Cancelled);
        }
        subject::validate_subject(&message.subject)?;
        let now = Instant::now();
        let ack = {
            let mut state = self.state.lock();
            let stream = state
                .streams
                .values_mut()
                .find(|s| s.captures(&message.subject))
                .ok_or_else(|| BrokerError::NoStreamForSubject(message.subject.clone()))?;
            stream.enforce_retention(now);

            let msg_id = message.msg_id().map(str::to_owned);
            if let Some((sequence, _)) = msg_id.as_ref().and_then(|id| stream.dedup.get(id)) {
                debug!(stream = %stream.config.name, subject = %message.subject, sequence, "duplicate publish");
                return Ok(PublishAck {
                    stream: stream.config.name.clone(),
                    sequence: *sequence,
                    duplicate: true,
                });
            }
            if stream.config.discard == DiscardPolicy::New
                && stream
                    .config
                    .max_messages
                    .is_some_and(|max| stream.messages.len() as u64 >= max)
            {
                return Err(BrokerError::StreamFull(stream.config.name.clone()));
            }

            stream.last_sequence += 1;
            let sequence = stream.last_sequence;
            let stored = StoredMessage {
                stream: stream.config.name.clone(),
                sequence,
                subject: message.subject,
                headers: message.headers,
                payload: message.payload,
                published_at: Utc::now(),
            };
            stream.messages.insert(
                sequence,
                Entry {
                    message: stored,
                    received: now,
                },
            );
            if let Some(id) = msg_id {
                stream.dedup.insert(id, (sequence, now));
            }
            stream.enforce_retention(now);
            PublishAck {
                stream: stream.config.name.clone(),
                sequence,
                duplicate: false,
            }
        };
        self.activity.notify_waiters();
        Ok(ack)
    }

    async fn fetch(
        &self,
        ctx: &Context,
        stream: &str,
        consumer: &str,
        max_wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.activity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake = {
                let mut state = self.state.lock();
                match state.stream_mut(stream)?.next_delivery(consumer, Instant::now())? {
                    Ok(delivery) => {
                        debug!(
                            stream,
                            consumer,
                            sequence = delivery.message.sequence,
                            num_delivered = delivery.num_delivered,
                            "message delivered"
                        );
                        return Ok(Some(delivery));
                    }
                    Err(wake) => wake,
                }
            };
            let until = wake.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                () = ctx.cancelled() => return Err(BrokerError::Cancelled),
                () = &mut notified => {}
                () = tokio::time::sleep_until(until) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        let stream = state.stream_mut(&delivery.message.stream)?;
        let consumer = stream
            .consumers
            .get_mut(&delivery.consumer)
            .ok_or_else(|| BrokerError::ConsumerNotFound {
                stream: delivery.message.stream.clone(),
                consumer: delivery.consumer.clone(),
            })?;
        consumer.pending.remove(&delivery.message.sequence);
        Ok(())
    }

    async fn nak(&self, delivery: &Delivery, delay: Option<Duration>) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock();
            let stream = state.stream_mut(&delivery.message.stream)?;
            let consumer = stream
                .consumers
                .get_mut(&delivery.consumer)
                .ok_or_else(|| BrokerError::ConsumerNotFound {
                    stream: delivery.message.stream.clone(),
                    consumer: delivery.consumer.clone(),
                })?;
            if let Some(pending) = consumer.pending.get_mut(&delivery.message.sequence) {
                pending.eligible_at = Instant::now() + delay.unwrap_or_default();
            }
        }
        self.activity.notify_waiters();
        Ok(())
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, BrokerError> {
        let mut state = self.state.lock();
        let stream = state.stream_mut(stream)?;
        stream.enforce_retention(Instant::now());
        Ok(stream.info())
    }

    async fn consumer_info(&self, stream: &str, consumer: &str) -> Result<ConsumerInfo, BrokerError> {
        let state = self.state.lock();
        state
            .stream(stream)?
            .consumer_info(consumer)
            .ok_or_else(|| BrokerError::ConsumerNotFound {
                stream: stream.to_owned(),
                consumer: consumer.to_owned(),
            })
    }

    async fn stream_messages(&self, stream: &str, filter: Option<&str>) -> Result<Vec<StoredMessage>, BrokerError> {
        let mut state = self.state.lock();
        let stream = state.stream_mut(stream)?;
        stream.enforce_retention(Instant::now());
        Ok(stream
            .messages
            .values()
            .filter(|entry| filter.is_none_or(|f| subject::matches(f, &entry.message.subject)))
            .map(|entry| entry.message.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn broker_with_stream() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker
            .ensure_stream(StreamConfig::new("MEDIA_EVENTS", &["media.>"], Duration::from_secs(3600)))
            .await
            .unwrap();
        broker
    }

    fn consumer(ack_wait: Duration, max_deliver: u32) -> ConsumerConfig {
        ConsumerConfig {
            ack_wait,
            max_deliver,
            ..ConsumerConfig::durable("workers")
        }
    }

    #[tokio::test]
    async fn test_publish_assigns_increasing_sequences() {
        // Arrange
        let broker = broker_with_stream().await;
        let ctx = Context::background();

        // Act
        let first = broker
            .publish(&ctx, OutboundMessage::new("media.movie.MediaCreated", "a"))
            .await
            .unwrap();
        let second = broker
            .publish(&ctx, OutboundMessage::new("media.movie.MediaCreated", "b"))
            .await
            .unwrap();

        // Assert
        assert_eq!(first.stream, "MEDIA_EVENTS");
        assert_eq!((first.sequence, second.sequence), (1, 2));
        assert!(!first.duplicate);
    }

    #[tokio::test]
    async fn test_repeated_msg_id_is_deduplicated() {
        let broker = broker_with_stream().await;
        let ctx = Context::background();
        let message = OutboundMessage::new("media.movie.MediaCreated", "a").with_msg_id("evt-1");

        let first = broker.publish(&ctx, message.clone()).await.unwrap();
        let again = broker.publish(&ctx, message).await.unwrap();

        assert!(again.duplicate);
        assert_eq!(again.sequence, first.sequence);
        assert_eq!(broker.stream_info("MEDIA_EVENTS").await.unwrap().messages, 1);
    }

    #[tokio::test]
    async fn test_publish_without_matching_stream_fails() {
        let broker = broker_with_stream().await;

        let err = broker
            .publish(&Context::background(), OutboundMessage::new("library.Scanned", "x"))
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::NoStreamForSubject(_)));
    }

    #[tokio::test]
    async fn test_unacked_delivery_is_redelivered_after_ack_wait() {
        // Arrange
        let broker = broker_with_stream().await;
        let ctx = Context::background();
        broker
            .ensure_consumer("MEDIA_EVENTS", consumer(Duration::from_millis(30), 5))
            .await
            .unwrap();
        broker
            .publish(&ctx, OutboundMessage::new("media.movie.MediaCreated", "a"))
            .await
            .unwrap();

        // Act
        let first = broker
            .fetch(&ctx, "MEDIA_EVENTS", "workers", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let second = broker
            .fetch(&ctx, "MEDIA_EVENTS", "workers", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        // Assert
        assert_eq!(first.num_delivered, 1);
        assert_eq!(second.num_delivered, 2);
        assert_eq!(second.message.sequence, first.message.sequence);
        let info = broker.consumer_info("MEDIA_EVENTS", "workers").await.unwrap();
        assert_eq!(info.num_redelivered, 1);
        assert_eq!(info.num_ack_pending, 1);
    }

    #[tokio::test]
    async fn test_ack_removes_pending_and_advances_floor() {
        let broker = broker_with_stream().await;
        let ctx = Context::background();
        broker
            .ensure_consumer("MEDIA_EVENTS", consumer(Duration::from_secs(30), 5))
            .await
            .unwrap();
        broker
            .publish(&ctx, OutboundMessage::new("media.movie.MediaCreated", "a"))
            .await
            .unwrap();
        let delivery = broker
            .fetch(&ctx, "MEDIA_EVENTS", "workers", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        broker.ack(&delivery).await.unwrap();
        broker.ack(&delivery).await.unwrap();

        let info = broker.consumer_info("MEDIA_EVENTS", "workers").await.unwrap();
        assert_eq!(info.num_ack_pending, 0);
        assert_eq!(info.num_pending, 0);
        assert_eq!(info.ack_floor, 1);
        let none = broker
            .fetch(&ctx, "MEDIA_EVENTS", "workers", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_nak_makes_message_immediately_eligible() {
        let broker = broker_with_stream().await;
        let ctx = Context::background();
        broker
            .ensure_consumer("MEDIA_EVENTS", consumer(Duration::from_secs(30), 5))
            .await
            .unwrap();
        broker
            .publish(&ctx, OutboundMessage::new("media.movie.MediaCreated", "a"))
            .await
            .unwrap();
        let delivery = broker
            .fetch(&ctx, "MEDIA_EVENTS", "workers", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        broker.nak(&delivery, None).await.unwrap();
        let again = broker
            .fetch(&ctx, "MEDIA_EVENTS", "workers", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(again.num_delivered, 2);
    }

    #[tokio::test]
    async fn test_delivery_stops_at_max_deliver() {
        let broker = broker_with_stream().await;
        let ctx = Context::background();
        broker
            .ensure_consumer("MEDIA_EVENTS", consumer(Duration::from_secs(30), 2))
            .await
            .unwrap();
        broker
            .publish(&ctx, OutboundMessage::new("media.movie.MediaCreated", "a"))
            .await
            .unwrap();

        let mut deliveries = 0;
        while let Some(delivery) = broker
            .fetch(&ctx, "MEDIA_EVENTS", "workers", Duration::from_millis(20))
            .await
            .unwrap()
        {
            deliveries += 1;
            broker.nak(&delivery, None).await.unwrap();
        }

        assert_eq!(deliveries, 2);
    }

    #[tokio::test]
    async fn test_max_ack_pending_limits_outstanding_deliveries() {
        let broker = broker_with_stream().await;
        let ctx = Context::background();
        broker
            .ensure_consumer(
                "MEDIA_EVENTS",
                ConsumerConfig {
                    max_ack_pending: 1,
                    ..consumer(Duration::from_secs(30), 5)
                },
            )
            .await
            .unwrap();
        for body in ["a", "b"] {
            broker
                .publish(&ctx, OutboundMessage::new("media.movie.MediaCreated", body))
                .await
                .unwrap();
        }

        let first = broker
            .fetch(&ctx, "MEDIA_EVENTS", "workers", Duration::from_millis(10))
            .await
            .unwrap();
        let blocked = broker
            .fetch(&ctx, "MEDIA_EVENTS", "workers", Duration::from_millis(10))
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(blocked.is_none());
    }

    #[tokio::test]
    async fn test_fetch_wakes_on_publish() {
        let broker = std::sync::Arc::new(broker_with_stream().await);
        let ctx = Context::background();
        broker
            .ensure_consumer("MEDIA_EVENTS", consumer(Duration::from_secs(30), 5))
            .await
            .unwrap();
        let fetcher = {
            let broker = std::sync::Arc::clone(&broker);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                broker
                    .fetch(&ctx, "MEDIA_EVENTS", "workers", Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        broker
            .publish(&ctx, OutboundMessage::new("media.movie.MediaCreated", "late"))
            .await
            .unwrap();

        let delivery = fetcher.await.unwrap().unwrap().unwrap();
        assert_eq!(&delivery.message.payload[..], b"late");
    }

    #[tokio::test]
    async fn test_max_messages_discards_oldest() {
        let broker = MemoryBroker::new();
        let ctx = Context::background();
        broker
            .ensure_stream(StreamConfig::new("SAGA_EVENTS", &["saga.>"], Duration::from_secs(60)).with_max_messages(2))
            .await
            .unwrap();

        for body in ["a", "b", "c"] {
            broker.publish(&ctx, OutboundMessage::new("saga.SagaStarted", body)).await.unwrap();
        }

        let info = broker.stream_info("SAGA_EVENTS").await.unwrap();
        assert_eq!(info.messages, 2);
        assert_eq!(info.first_sequence, 2);
        assert_eq!(info.last_sequence, 3);
    }

    #[tokio::test]
    async fn test_filter_subject_skips_other_subjects() {
        let broker = broker_with_stream().await;
        let ctx = Context::background();
        broker
            .ensure_consumer(
                "MEDIA_EVENTS",
                ConsumerConfig {
                    filter_subject: Some("media.episode.>".to_owned()),
                    ..consumer(Duration::from_secs(30), 5)
                },
            )
            .await
            .unwrap();
        broker.publish(&ctx, OutboundMessage::new("media.movie.MediaCreated", "m")).await.unwrap();
        broker.publish(&ctx, OutboundMessage::new("media.episode.MediaCreated", "e")).await.unwrap();

        let delivery = broker
            .fetch(&ctx, "MEDIA_EVENTS", "workers", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(delivery.message.subject, "media.episode.MediaCreated");
    }

    #[tokio::test]
    async fn test_overlapping_stream_subjects_are_rejected() {
        let broker = broker_with_stream().await;

        let err = broker
            .ensure_stream(StreamConfig::new("OTHER", &["media.>"], Duration::from_secs(60)))
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::SubjectOverlap { .. }));
    }
}
