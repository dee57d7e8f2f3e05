//! Domain events for the media catalog.

use narwhal_core::event::{DomainEvent, EventMetadata};
use narwhal_core::ports::MediaStatus;
use narwhal_core::registry::EventRegistry;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bounded context tag stamped on every media event.
pub const BOUNDED_CONTEXT: &str = "media";

/// Event type identifier for [`MediaCreated`].
pub const MEDIA_CREATED_EVENT_TYPE: &str = "MediaCreated";

/// Event type identifier for [`MediaStatusChanged`].
pub const MEDIA_STATUS_CHANGED_EVENT_TYPE: &str = "MediaStatusChanged";

/// Event type identifier for [`MediaFileUpdated`].
pub const MEDIA_FILE_UPDATED_EVENT_TYPE: &str = "MediaFileUpdated";

/// Event type identifier for [`MediaDetailsUpdated`].
pub const MEDIA_DETAILS_UPDATED_EVENT_TYPE: &str = "MediaDetailsUpdated";

/// Event type identifier for [`EpisodeAdded`].
pub const EPISODE_ADDED_EVENT_TYPE: &str = "EpisodeAdded";

/// Event type identifier for [`EpisodeRemoved`].
pub const EPISODE_REMOVED_EVENT_TYPE: &str = "EpisodeRemoved";

/// Event type identifier for [`MediaDeleted`].
pub const MEDIA_DELETED_EVENT_TYPE: &str = "MediaDeleted";

/// Kind of media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    /// A movie.
    Movie,
    /// A series.
    Series,
    /// An episode of a series.
    Episode,
}

impl MediaType {
    /// Wire/tag form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Movie => "movie",
            Self::Series => "series",
            Self::Episode => "episode",
        }
    }
}

impl std::str::FromStr for MediaType {
    type Err = narwhal_core::error::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "movie" => Ok(Self::Movie),
            "series" => Ok(Self::Series),
            "episode" => Ok(Self::Episode),
            other => Err(narwhal_core::error::DomainError::Validation(format!(
                "unknown media type: {other}"
            ))),
        }
    }
}

/// Where to fetch a new item from and where to put the playable output.
///
/// Carried on `MediaCreated` so a subscriber can start processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingRequest {
    /// Source URL (HTTP, magnet link or NZB).
    pub download_url: String,
    /// Directory downloads are written to.
    pub target_path: String,
    /// Directory transcode output is written to.
    pub output_path: String,
    /// Transcode profile tag.
    #[serde(default = "default_profile")]
    pub transcode_profile: String,
}

fn default_profile() -> String {
    "hls".to_owned()
}

/// Emitted when a movie, series or episode is added to the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaCreated {
    /// The media identifier.
    pub media_id: Uuid,
    /// The kind of media.
    pub media_type: MediaType,
    /// Title.
    pub title: String,
    /// Owning series, for episodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_id: Option<Uuid>,
    /// Processing to start, if requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing: Option<ProcessingRequest>,
}

/// Emitted when the lifecycle status changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaStatusChanged {
    /// The media identifier.
    pub media_id: Uuid,
    /// The kind of media.
    pub media_type: MediaType,
    /// Previous status.
    pub from: MediaStatus,
    /// New status.
    pub to: MediaStatus,
}

/// Emitted when the playable file changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFileUpdated {
    /// The media identifier.
    pub media_id: Uuid,
    /// The kind of media.
    pub media_type: MediaType,
    /// Absolute path of the playable file.
    pub file_path: String,
}

/// Emitted when descriptive fields change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaDetailsUpdated {
    /// The media identifier.
    pub media_id: Uuid,
    /// The kind of media.
    pub media_type: MediaType,
    /// New title.
    pub title: String,
    /// New duration in minutes.
    pub duration_minutes: Option<u32>,
}

/// Emitted on a series when an episode joins it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeAdded {
    /// The series identifier.
    pub series_id: Uuid,
    /// The episode identifier.
    pub episode_id: Uuid,
    /// Season number (≥ 1).
    pub season_number: u32,
    /// Episode number within the season (≥ 1).
    pub episode_number: u32,
}

/// Emitted on a series when an episode leaves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRemoved {
    /// The series identifier.
    pub series_id: Uuid,
    /// The episode identifier.
    pub episode_id: Uuid,
}

/// Emitted when an item is removed from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaDeleted {
    /// The media identifier.
    pub media_id: Uuid,
    /// The kind of media.
    pub media_type: MediaType,
}

/// Event payload variants for the media catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MediaEventKind {
    /// An item was created.
    MediaCreated(MediaCreated),
    /// Status changed.
    MediaStatusChanged(MediaStatusChanged),
    /// Playable file changed.
    MediaFileUpdated(MediaFileUpdated),
    /// Descriptive fields changed.
    MediaDetailsUpdated(MediaDetailsUpdated),
    /// An episode joined a series.
    EpisodeAdded(EpisodeAdded),
    /// An episode left a series.
    EpisodeRemoved(EpisodeRemoved),
    /// An item was deleted.
    MediaDeleted(MediaDeleted),
}

impl MediaEventKind {
    /// Event type identifier of this payload.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MediaCreated(_) => MEDIA_CREATED_EVENT_TYPE,
            Self::MediaStatusChanged(_) => MEDIA_STATUS_CHANGED_EVENT_TYPE,
            Self::MediaFileUpdated(_) => MEDIA_FILE_UPDATED_EVENT_TYPE,
            Self::MediaDetailsUpdated(_) => MEDIA_DETAILS_UPDATED_EVENT_TYPE,
            Self::EpisodeAdded(_) => EPISODE_ADDED_EVENT_TYPE,
            Self::EpisodeRemoved(_) => EPISODE_REMOVED_EVENT_TYPE,
            Self::MediaDeleted(_) => MEDIA_DELETED_EVENT_TYPE,
        }
    }
}

/// A media domain event.
#[derive(Debug, Clone)]
pub struct MediaEvent {
    /// Event metadata.
    pub metadata: EventMetadata,
    /// Event-specific payload.
    pub kind: MediaEventKind,
}

impl DomainEvent for MediaEvent {
    fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    fn to_payload(&self) -> serde_json::Value {
        // Serialization of derived Serialize types to Value is infallible.
        let payload = match &self.kind {
            MediaEventKind::MediaCreated(e) => serde_json::to_value(e),
            MediaEventKind::MediaStatusChanged(e) => serde_json::to_value(e),
            MediaEventKind::MediaFileUpdated(e) => serde_json::to_value(e),
            MediaEventKind::MediaDetailsUpdated(e) => serde_json::to_value(e),
            MediaEventKind::EpisodeAdded(e) => serde_json::to_value(e),
            MediaEventKind::EpisodeRemoved(e) => serde_json::to_value(e),
            MediaEventKind::MediaDeleted(e) => serde_json::to_value(e),
        };
        payload.expect("media event serialization is infallible")
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

/// Registers the payload type of every media event.
pub fn register_events(registry: &mut EventRegistry) {
    registry.register::<MediaCreated>(MEDIA_CREATED_EVENT_TYPE);
    registry.register::<MediaStatusChanged>(MEDIA_STATUS_CHANGED_EVENT_TYPE);
    registry.register::<MediaFileUpdated>(MEDIA_FILE_UPDATED_EVENT_TYPE);
    registry.register::<MediaDetailsUpdated>(MEDIA_DETAILS_UPDATED_EVENT_TYPE);
    registry.register::<EpisodeAdded>(EPISODE_ADDED_EVENT_TYPE);
    registry.register::<EpisodeRemoved>(EPISODE_REMOVED_EVENT_TYPE);
    registry.register::<MediaDeleted>(MEDIA_DELETED_EVENT_TYPE);
}
