//! Test publishers: `IntegrationPublisher` implementations for tests.

use async_trait::async_trait;
use narwhal_core::context::Context;
use narwhal_core::envelope::IntegrationEnvelope;
use narwhal_core::error::DomainError;
use narwhal_core::ports::{IntegrationPublisher, PublishAck};
use parking_lot::Mutex;

/// A publisher that records every envelope and always succeeds.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<IntegrationEnvelope>>,
}

impl RecordingPublisher {
    /// Creates an empty recording publisher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every published envelope, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<IntegrationEnvelope> {
        self.published.lock().clone()
    }

    /// Event types of every published envelope, in publish order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.published.lock().iter().map(|e| e.event_type.clone()).collect()
    }

    /// Envelopes of one event type.
    #[must_use]
    pub fn of_type(&self, event_type: &str) -> Vec<IntegrationEnvelope> {
        self.published
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl IntegrationPublisher for RecordingPublisher {
    async fn publish(&self, _ctx: &Context, envelope: IntegrationEnvelope) -> Result<PublishAck, DomainError> {
        let mut published = self.published.lock();
        published.push(envelope);
        Ok(PublishAck {
            stream: "RECORDED".to_owned(),
            sequence: published.len() as u64,
            duplicate: false,
        })
    }
}

/// A publisher whose broker is always unreachable.
#[derive(Debug, Default)]
pub struct FailingPublisher;

#[async_trait]
impl IntegrationPublisher for FailingPublisher {
    async fn publish(&self, _ctx: &Context, _envelope: IntegrationEnvelope) -> Result<PublishAck, DomainError> {
        Err(DomainError::Transient("broker unavailable".into()))
    }
}
