//! Narwhal Saga — long-running, compensable workflows.
//!
//! A saga executes the ordered steps of a registered definition on a
//! background task, persisting progress after every step. When a step fails
//! the steps that already succeeded are compensated in reverse order. The
//! `MediaProcessing` definition drives a movie or episode from download
//! through transcoding to `ready`.

pub mod application;
pub mod domain;
pub mod error;

pub use application::media_processing::{
    DownloadMedia, MEDIA_PROCESSING_SAGA, MediaProcessing, TranscodeMedia, UpdateMediaStatus, processing_data,
};
pub use application::orchestrator::{SagaHandle, SagaOrchestrator};
pub use application::store::{InMemorySagaStore, SagaStore};
pub use application::trigger::MediaProcessingTrigger;
pub use domain::saga::{Saga, SagaData, SagaState, keys};
pub use domain::step::{SagaDefinition, SagaStep};
pub use error::SagaError;
