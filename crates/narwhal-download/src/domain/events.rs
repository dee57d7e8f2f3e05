//! Domain events for downloads.

use narwhal_core::event::{DomainEvent, EventMetadata};
use narwhal_core::ports::DownloadKind;
use narwhal_core::registry::EventRegistry;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bounded context tag stamped on every download event.
pub const BOUNDED_CONTEXT: &str = "download";

/// Event type identifier for [`DownloadCreated`].
pub const DOWNLOAD_CREATED_EVENT_TYPE: &str = "DownloadCreated";

/// Event type identifier for [`DownloadStarted`].
pub const DOWNLOAD_STARTED_EVENT_TYPE: &str = "DownloadStarted";

/// Event type identifier for [`DownloadCompleted`].
pub const DOWNLOAD_COMPLETED_EVENT_TYPE: &str = "DownloadCompleted";

/// Event type identifier for [`DownloadFailed`].
pub const DOWNLOAD_FAILED_EVENT_TYPE: &str = "DownloadFailed";

/// Event type identifier for [`DownloadCancelled`].
pub const DOWNLOAD_CANCELLED_EVENT_TYPE: &str = "DownloadCancelled";

/// Event type identifier for [`DownloadRequeued`].
pub const DOWNLOAD_REQUEUED_EVENT_TYPE: &str = "DownloadRequeued";

/// Emitted when a download is registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadCreated {
    /// The download identifier.
    pub download_id: Uuid,
    /// Source URL.
    pub url: String,
    /// Detected transfer kind.
    pub kind: DownloadKind,
    /// Destination directory.
    pub target_path: String,
}

/// Emitted when the transfer begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadStarted {
    /// The download identifier.
    pub download_id: Uuid,
    /// Engine performing the transfer.
    pub engine: String,
}

/// Emitted when the transfer finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadCompleted {
    /// The download identifier.
    pub download_id: Uuid,
    /// Path of the downloaded media.
    pub downloaded_path: String,
    /// Bytes transferred.
    pub bytes: u64,
}

/// Emitted when the transfer fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadFailed {
    /// The download identifier.
    pub download_id: Uuid,
    /// Failure reason.
    pub error: String,
}

/// Emitted when the download is cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadCancelled {
    /// The download identifier.
    pub download_id: Uuid,
}

/// Emitted when an interrupted transfer is queued to start over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequeued {
    /// The download identifier.
    pub download_id: Uuid,
}

/// Event payload variants for downloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DownloadEventKind {
    /// Registered.
    DownloadCreated(DownloadCreated),
    /// Transfer began.
    DownloadStarted(DownloadStarted),
    /// Transfer finished.
    DownloadCompleted(DownloadCompleted),
    /// Transfer failed.
    DownloadFailed(DownloadFailed),
    /// Cancelled.
    DownloadCancelled(DownloadCancelled),
    /// Interrupted transfer queued again.
    DownloadRequeued(DownloadRequeued),
}

impl DownloadEventKind {
    /// Event type identifier of this payload.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::DownloadCreated(_) => DOWNLOAD_CREATED_EVENT_TYPE,
            Self::DownloadStarted(_) => DOWNLOAD_STARTED_EVENT_TYPE,
            Self::DownloadCompleted(_) => DOWNLOAD_COMPLETED_EVENT_TYPE,
            Self::DownloadFailed(_) => DOWNLOAD_FAILED_EVENT_TYPE,
            Self::DownloadCancelled(_) => DOWNLOAD_CANCELLED_EVENT_TYPE,
            Self::DownloadRequeued(_) => DOWNLOAD_REQUEUED_EVENT_TYPE,
        }
    }
}

/// A download domain event.
#[derive(Debug, Clone)]
pub struct DownloadEvent {
    /// Event metadata.
    pub metadata: EventMetadata,
    /// Event-specific payload.
    pub kind: DownloadEventKind,
}

impl DomainEvent for DownloadEvent {
    fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    fn to_payload(&self) -> serde_json::Value {
        let payload = match &self.kind {
            DownloadEventKind::DownloadCreated(e) => serde_json::to_value(e),
            DownloadEventKind::DownloadStarted(e) => serde_json::to_value(e),
            DownloadEventKind::DownloadCompleted(e) => serde_json::to_value(e),
            DownloadEventKind::DownloadFailed(e) => serde_json::to_value(e),
            DownloadEventKind::DownloadCancelled(e) => serde_json::to_value(e),
            DownloadEventKind::DownloadRequeued(e) => serde_json::to_value(e),
        };
        payload.expect("download event serialization is infallible")
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

/// Registers the payload type of every download event.
pub fn register_events(registry: &mut EventRegistry) {
    registry.register::<DownloadCreated>(DOWNLOAD_CREATED_EVENT_TYPE);
    registry.register::<DownloadStarted>(DOWNLOAD_STARTED_EVENT_TYPE);
    registry.register::<DownloadCompleted>(DOWNLOAD_COMPLETED_EVENT_TYPE);
    registry.register::<DownloadFailed>(DOWNLOAD_FAILED_EVENT_TYPE);
    registry.register::<DownloadCancelled>(DOWNLOAD_CANCELLED_EVENT_TYPE);
    registry.register::<DownloadRequeued>(DOWNLOAD_REQUEUED_EVENT_TYPE);
}
