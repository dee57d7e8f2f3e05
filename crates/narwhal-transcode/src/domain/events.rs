//! Domain events for transcode jobs.

use narwhal_core::event::{DomainEvent, EventMetadata};
use narwhal_core::registry::EventRegistry;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::profile::TranscodeProfile;

/// Bounded context tag stamped on every transcode event.
pub const BOUNDED_CONTEXT: &str = "transcode";

/// Event type identifier for [`TranscodeJobCreated`].
pub const JOB_CREATED_EVENT_TYPE: &str = "TranscodeJobCreated";

/// Event type identifier for [`TranscodeJobStarted`].
pub const JOB_STARTED_EVENT_TYPE: &str = "TranscodeJobStarted";

/// Event type identifier for [`TranscodeJobProgress`].
pub const JOB_PROGRESS_EVENT_TYPE: &str = "TranscodeJobProgress";

/// Event type identifier for [`TranscodeJobCompleted`].
pub const JOB_COMPLETED_EVENT_TYPE: &str = "TranscodeJobCompleted";

/// Event type identifier for [`TranscodeJobFailed`].
pub const JOB_FAILED_EVENT_TYPE: &str = "TranscodeJobFailed";

/// Event type identifier for [`TranscodeJobCancelled`].
pub const JOB_CANCELLED_EVENT_TYPE: &str = "TranscodeJobCancelled";

/// Event type identifier for [`TranscodeJobRetried`].
pub const JOB_RETRIED_EVENT_TYPE: &str = "TranscodeJobRetried";

/// Event type identifier for [`TranscodeJobRequeued`].
pub const JOB_REQUEUED_EVENT_TYPE: &str = "TranscodeJobRequeued";

/// Emitted when a job is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeJobCreated {
    /// The job identifier.
    pub job_id: Uuid,
    /// Source media.
    pub input_path: String,
    /// Output directory or file.
    pub output_path: String,
    /// Requested profile.
    pub profile: TranscodeProfile,
}

/// Emitted when a run begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeJobStarted {
    /// The job identifier.
    pub job_id: Uuid,
    /// Zero-based run number.
    pub attempt: u32,
}

/// Periodic progress of a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeJobProgress {
    /// The job identifier.
    pub job_id: Uuid,
    /// Completion in `[0, 100]`.
    pub percent: f64,
    /// Media time encoded so far (s).
    pub current_seconds: f64,
    /// Encoding speed relative to real time.
    pub speed: Option<f64>,
    /// Estimated seconds remaining.
    pub eta_seconds: Option<f64>,
    /// Frames encoded per second.
    #[serde(default)]
    pub fps: Option<f64>,
    /// Output bitrate (kb/s).
    #[serde(default)]
    pub bitrate_kbps: Option<f64>,
}

/// Emitted when the output is complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeJobCompleted {
    /// The job identifier.
    pub job_id: Uuid,
    /// Master playlist or output file.
    pub output_path: String,
    /// Public URL of the output.
    pub url: String,
    /// Media duration (s).
    pub duration_seconds: f64,
    /// Wall-clock run time (s).
    pub elapsed_seconds: f64,
    /// Number of HLS variants, 0 for single-file outputs.
    pub variant_count: usize,
    /// Total bytes written.
    pub output_bytes: u64,
}

/// Emitted when a run fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeJobFailed {
    /// The job identifier.
    pub job_id: Uuid,
    /// Failure reason.
    pub error: String,
    /// Whether another retry is permitted.
    pub retriable: bool,
}

/// Emitted when a job is cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeJobCancelled {
    /// The job identifier.
    pub job_id: Uuid,
}

/// Emitted when a failed job is queued again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeJobRetried {
    /// The job identifier.
    pub job_id: Uuid,
    /// Retries used, including this one.
    pub retry_count: u32,
}

/// Emitted when an interrupted run is queued to start over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeJobRequeued {
    /// The job identifier.
    pub job_id: Uuid,
    /// Zero-based number of the interrupted run.
    pub attempt: u32,
}

/// Event payload variants for transcode jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TranscodeEventKind {
    /// Created.
    TranscodeJobCreated(TranscodeJobCreated),
    /// Run began.
    TranscodeJobStarted(TranscodeJobStarted),
    /// Progress sample.
    TranscodeJobProgress(TranscodeJobProgress),
    /// Output complete.
    TranscodeJobCompleted(TranscodeJobCompleted),
    /// Run failed.
    TranscodeJobFailed(TranscodeJobFailed),
    /// Cancelled.
    TranscodeJobCancelled(TranscodeJobCancelled),
    /// Queued for another run.
    TranscodeJobRetried(TranscodeJobRetried),
    /// Interrupted run queued again.
    TranscodeJobRequeued(TranscodeJobRequeued),
}

impl TranscodeEventKind {
    /// Event type identifier of this payload.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TranscodeJobCreated(_) => JOB_CREATED_EVENT_TYPE,
            Self::TranscodeJobStarted(_) => JOB_STARTED_EVENT_TYPE,
            Self::TranscodeJobProgress(_) => JOB_PROGRESS_EVENT_TYPE,
            Self::TranscodeJobCompleted(_) => JOB_COMPLETED_EVENT_TYPE,
            Self::TranscodeJobFailed(_) => JOB_FAILED_EVENT_TYPE,
            Self::TranscodeJobCancelled(_) => JOB_CANCELLED_EVENT_TYPE,
            Self::TranscodeJobRetried(_) => JOB_RETRIED_EVENT_TYPE,
            Self::TranscodeJobRequeued(_) => JOB_REQUEUED_EVENT_TYPE,
        }
    }
}

/// A transcode domain event.
#[derive(Debug, Clone)]
pub struct TranscodeEvent {
    /// Event metadata.
    pub metadata: EventMetadata,
    /// Event-specific payload.
    pub kind: TranscodeEventKind,
}

impl DomainEvent for TranscodeEvent {
    fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    fn to_payload(&self) -> serde_json::Value {
        let payload = match &self.kind {
            TranscodeEventKind::TranscodeJobCreated(e) => serde_json::to_value(e),
            TranscodeEventKind::TranscodeJobStarted(e) => serde_json::to_value(e),
            TranscodeEventKind::TranscodeJobProgress(e) => serde_json::to_value(e),
            TranscodeEventKind::TranscodeJobCompleted(e) => serde_json::to_value(e),
            TranscodeEventKind::TranscodeJobFailed(e) => serde_json::to_value(e),
            TranscodeEventKind::TranscodeJobCancelled(e) => serde_json::to_value(e),
            TranscodeEventKind::TranscodeJobRetried(e) => serde_json::to_value(e),
            TranscodeEventKind::TranscodeJobRequeued(e) => serde_json::to_value(e),
        };
        payload.expect("transcode event serialization is infallible")
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

/// Registers the payload type of every transcode event.
pub fn register_events(registry: &mut EventRegistry) {
    registry.register::<TranscodeJobCreated>(JOB_CREATED_EVENT_TYPE);
    registry.register::<TranscodeJobStarted>(JOB_STARTED_EVENT_TYPE);
    registry.register::<TranscodeJobProgress>(JOB_PROGRESS_EVENT_TYPE);
    registry.register::<TranscodeJobCompleted>(JOB_COMPLETED_EVENT_TYPE);
    registry.register::<TranscodeJobFailed>(JOB_FAILED_EVENT_TYPE);
    registry.register::<TranscodeJobCancelled>(JOB_CANCELLED_EVENT_TYPE);
    registry.register::<TranscodeJobRetried>(JOB_RETRIED_EVENT_TYPE);
    registry.register::<TranscodeJobRequeued>(JOB_REQUEUED_EVENT_TYPE);
}
