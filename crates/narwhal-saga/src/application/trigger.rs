//! Starts media processing from `MediaCreated` integration events.

use async_trait::async_trait;
use narwhal_broker::EventHandler;
use narwhal_core::context::Context;
use narwhal_core::envelope::IntegrationEnvelope;
use narwhal_core::error::DomainError;
use narwhal_core::registry::DecodedEvent;
use narwhal_media::MediaType;
use narwhal_media::domain::events::{MEDIA_CREATED_EVENT_TYPE, MediaCreated};
use tracing::{debug, info};

use crate::application::media_processing::{MEDIA_PROCESSING_SAGA, processing_data};
use crate::application::orchestrator::SagaOrchestrator;
use crate::domain::saga::keys;

/// Consumer-group handler that starts `MediaProcessing` when a created
/// movie or episode carries a processing request.
///
/// A redelivered event for media that already has a processing saga is
/// acknowledged without starting another.
#[derive(Debug, Clone)]
pub struct MediaProcessingTrigger {
    orchestrator: SagaOrchestrator,
}

impl MediaProcessingTrigger {
    /// A trigger starting sagas on `orchestrator`.
    #[must_use]
    pub fn new(orchestrator: SagaOrchestrator) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl EventHandler for MediaProcessingTrigger {
    fn name(&self) -> &str {
        "media-processing-trigger"
    }

    fn event_types(&self) -> &[&str] {
        &[MEDIA_CREATED_EVENT_TYPE]
    }

    async fn handle(
        &self,
        ctx: &Context,
        envelope: &IntegrationEnvelope,
        event: &DecodedEvent,
    ) -> Result<(), DomainError> {
        let event = event.downcast_ref::<MediaCreated>()?;
        let Some(request) = &event.processing else {
            debug!(media_id = %event.media_id, "no processing requested");
            return Ok(());
        };
        if event.media_type == MediaType::Series {
            debug!(media_id = %event.media_id, "series are not processed");
            return Ok(());
        }

        let media_id = event.media_id.to_string();
        let existing = self
            .orchestrator
            .store()
            .find_by_data(ctx, keys::MEDIA_ID, &media_id)
            .await?;
        if existing.iter().any(|saga| saga.saga_type == MEDIA_PROCESSING_SAGA) {
            info!(media_id = %media_id, "processing saga already exists");
            return Ok(());
        }

        let data = processing_data(event.media_id, event.media_type, request);
        let handle = self
            .orchestrator
            .start_saga(&envelope.continue_in(ctx), MEDIA_PROCESSING_SAGA, data)
            .await?;
        info!(media_id = %media_id, saga_id = %handle.id(), "processing saga started from event");
        Ok(())
    }
}
