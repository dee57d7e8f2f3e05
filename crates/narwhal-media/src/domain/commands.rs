//! Commands for the media catalog.

use narwhal_core::command::Command;
use narwhal_core::ports::MediaStatus;
use uuid::Uuid;

use super::events::{MediaType, ProcessingRequest};

/// Command to add a movie to the catalog.
#[derive(Debug, Clone)]
pub struct CreateMovie {
    /// Title.
    pub title: String,
    /// Release year.
    pub release_year: Option<u16>,
    /// Runtime in minutes.
    pub duration_minutes: Option<u32>,
    /// Processing to start once the movie exists.
    pub processing: Option<ProcessingRequest>,
}

impl Command for CreateMovie {
    fn command_type(&self) -> &'static str {
        "media.create_movie"
    }
}

/// Command to add a series to the catalog.
#[derive(Debug, Clone)]
pub struct CreateSeries {
    /// Title.
    pub title: String,
    /// Release year.
    pub release_year: Option<u16>,
}

impl Command for CreateSeries {
    fn command_type(&self) -> &'static str {
        "media.create_series"
    }
}

/// Command to add an episode to an existing series.
#[derive(Debug, Clone)]
pub struct AddEpisode {
    /// The owning series.
    pub series_id: Uuid,
    /// Season number (≥ 1).
    pub season_number: u32,
    /// Episode number within the season (≥ 1).
    pub episode_number: u32,
    /// Title.
    pub title: String,
    /// Runtime in minutes.
    pub duration_minutes: Option<u32>,
    /// Processing to start once the episode exists.
    pub processing: Option<ProcessingRequest>,
}

impl Command for AddEpisode {
    fn command_type(&self) -> &'static str {
        "media.add_episode"
    }
}

/// Command to move a movie or episode along the status lattice.
#[derive(Debug, Clone)]
pub struct UpdateMediaStatus {
    /// Movie or episode identifier.
    pub media_id: Uuid,
    /// Kind of the item; series have no status.
    pub media_type: MediaType,
    /// Target status.
    pub status: MediaStatus,
}

impl Command for UpdateMediaStatus {
    fn command_type(&self) -> &'static str {
        "media.update_status"
    }
}

/// Command to set the playable file of a movie or episode.
#[derive(Debug, Clone)]
pub struct UpdateMediaFile {
    /// Movie or episode identifier.
    pub media_id: Uuid,
    /// Kind of the item.
    pub media_type: MediaType,
    /// Absolute path of the playable file.
    pub file_path: String,
}

impl Command for UpdateMediaFile {
    fn command_type(&self) -> &'static str {
        "media.update_file"
    }
}

/// Command to replace the descriptive fields of an item.
///
/// `release_year` is ignored for episodes and `duration_minutes` for series.
#[derive(Debug, Clone)]
pub struct UpdateMediaDetails {
    /// Identifier of the item.
    pub media_id: Uuid,
    /// Kind of the item.
    pub media_type: MediaType,
    /// New title.
    pub title: String,
    /// New release year.
    pub release_year: Option<u16>,
    /// New runtime in minutes.
    pub duration_minutes: Option<u32>,
}

impl Command for UpdateMediaDetails {
    fn command_type(&self) -> &'static str {
        "media.update_details"
    }
}

/// Command to remove an item. Deleting a series removes its episodes.
#[derive(Debug, Clone)]
pub struct DeleteMedia {
    /// Identifier of the item.
    pub media_id: Uuid,
    /// Kind of the item.
    pub media_type: MediaType,
}

impl Command for DeleteMedia {
    fn command_type(&self) -> &'static str {
        "media.delete"
    }
}
