//! Aggregate roots for the media catalog.
//!
//! `Movie` and `Episode` carry the processing lifecycle; `Series` owns the
//! ordered index of its episodes and enforces their numbering invariants.

use std::path::Path;

use narwhal_core::aggregate::{AggregateRoot, AggregateState};
use narwhal_core::clock::Clock;
use narwhal_core::context::Context;
use narwhal_core::error::DomainError;
use narwhal_core::event::EventMetadata;
use narwhal_core::ports::MediaStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{
    BOUNDED_CONTEXT, EpisodeAdded, EpisodeRemoved, MediaCreated, MediaDeleted, MediaDetailsUpdated, MediaEvent,
    MediaEventKind, MediaFileUpdated, MediaStatusChanged, MediaType, ProcessingRequest,
};

/// Maximum title length in characters.
pub const MAX_TITLE_LEN: usize = 255;

/// Maximum runtime in minutes.
pub const MAX_DURATION_MINUTES: u32 = 1000;

/// Maximum number of episodes in one series.
pub const MAX_EPISODES_PER_SERIES: usize = 1000;

fn validate_title(title: &str) -> Result<(), DomainError> {
    if title.trim().is_empty() {
        return Err(DomainError::Validation("title must not be empty".into()));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(DomainError::Validation(format!(
            "title must be at most {MAX_TITLE_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_duration(duration_minutes: Option<u32>) -> Result<(), DomainError> {
    match duration_minutes {
        Some(minutes) if minutes > MAX_DURATION_MINUTES => Err(DomainError::Validation(format!(
            "duration must be at most {MAX_DURATION_MINUTES} minutes"
        ))),
        _ => Ok(()),
    }
}

fn validate_file_path(file_path: Option<&str>) -> Result<(), DomainError> {
    match file_path {
        Some(path) if !Path::new(path).is_absolute() => Err(DomainError::Validation(format!(
            "file path must be absolute: {path}"
        ))),
        _ => Ok(()),
    }
}

fn check_transition(current: MediaStatus, to: MediaStatus) -> Result<bool, DomainError> {
    if current == to {
        return Ok(false);
    }
    if current.can_transition_to(to) {
        Ok(true)
    } else {
        Err(DomainError::Validation(format!(
            "illegal status transition {current} -> {to}"
        )))
    }
}

fn record(
    state: &mut AggregateState,
    events: &mut Vec<MediaEvent>,
    aggregate_type: &str,
    ctx: &Context,
    clock: &dyn Clock,
    kind: MediaEventKind,
) {
    let version = state.touch(clock);
    let metadata = EventMetadata::new(
        kind.event_type(),
        aggregate_type,
        state.id,
        version,
        BOUNDED_CONTEXT,
        ctx,
        state.updated_at,
    );
    events.push(MediaEvent { metadata, kind });
}

/// A movie.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Movie {
    #[serde(flatten)]
    state: AggregateState,
    title: String,
    release_year: Option<u16>,
    duration_minutes: Option<u32>,
    status: MediaStatus,
    file_path: Option<String>,
    #[serde(skip)]
    uncommitted_events: Vec<MediaEvent>,
}

impl Movie {
    /// Creates a pending movie and records `MediaCreated`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the title or duration is invalid.
    pub fn create(
        ctx: &Context,
        clock: &dyn Clock,
        title: &str,
        release_year: Option<u16>,
        duration_minutes: Option<u32>,
        processing: Option<ProcessingRequest>,
    ) -> Result<Self, DomainError> {
        validate_title(title)?;
        validate_duration(duration_minutes)?;
        let mut movie = Self {
            state: AggregateState::new(Uuid::new_v4(), clock),
            title: title.to_owned(),
            release_year,
            duration_minutes,
            status: MediaStatus::Pending,
            file_path: None,
            uncommitted_events: Vec::new(),
        };
        let kind = MediaEventKind::MediaCreated(MediaCreated {
            media_id: movie.state.id,
            media_type: MediaType::Movie,
            title: movie.title.clone(),
            series_id: None,
            processing,
        });
        movie.record(ctx, clock, kind);
        Ok(movie)
    }

    fn record(&mut self, ctx: &Context, clock: &dyn Clock, kind: MediaEventKind) {
        record(&mut self.state, &mut self.uncommitted_events, Self::AGGREGATE_TYPE, ctx, clock, kind);
    }

    /// Title.
    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Release year.
    #[must_use]
    pub fn release_year(&self) -> Option<u16> {
        self.release_year
    }

    /// Runtime in minutes.
    #[must_use]
    pub fn duration_minutes(&self) -> Option<u32> {
        self.duration_minutes
    }

    /// Lifecycle status.
    #[must_use]
    pub fn status(&self) -> MediaStatus {
        self.status
    }

    /// Playable file, once transcoded.
    #[must_use]
    pub fn file_path(&self) -> Option<&str> {
        self.file_path.as_deref()
    }

    /// Moves to `to`. Returns `false` without recording anything when the
    /// movie already has that status.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a transition outside the lattice.
    pub fn change_status(&mut self, ctx: &Context, clock: &dyn Clock, to: MediaStatus) -> Result<bool, DomainError> {
        let from = self.status;
        if !check_transition(from, to)? {
            return Ok(false);
        }
        self.status = to;
        let kind = MediaEventKind::MediaStatusChanged(MediaStatusChanged {
            media_id: self.state.id,
            media_type: MediaType::Movie,
            from,
            to,
        });
        self.record(ctx, clock, kind);
        Ok(true)
    }

    /// Sets the playable file. Returns `false` when the path is unchanged.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the path is not absolute.
    pub fn set_file_path(&mut self, ctx: &Context, clock: &dyn Clock, file_path: &str) -> Result<bool, DomainError> {
        validate_file_path(Some(file_path))?;
        if self.file_path.as_deref() == Some(file_path) {
            return Ok(false);
        }
        self.file_path = Some(file_path.to_owned());
        let kind = MediaEventKind::MediaFileUpdated(MediaFileUpdated {
            media_id: self.state.id,
            media_type: MediaType::Movie,
            file_path: file_path.to_owned(),
        });
        self.record(ctx, clock, kind);
        Ok(true)
    }

    /// Replaces the descriptive fields.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the title or duration is invalid.
    pub fn update_details(
        &mut self,
        ctx: &Context,
        clock: &dyn Clock,
        title: &str,
        release_year: Option<u16>,
        duration_minutes: Option<u32>,
    ) -> Result<(), DomainError> {
        validate_title(title)?;
        validate_duration(duration_minutes)?;
        self.title = title.to_owned();
        self.release_year = release_year;
        self.duration_minutes = duration_minutes;
        let kind = MediaEventKind::MediaDetailsUpdated(MediaDetailsUpdated {
            media_id: self.state.id,
            media_type: MediaType::Movie,
            title: self.title.clone(),
            duration_minutes,
        });
        self.record(ctx, clock, kind);
        Ok(())
    }

    /// Records `MediaDeleted`; the caller removes the document.
    pub fn mark_deleted(&mut self, ctx: &Context, clock: &dyn Clock) {
        let kind = MediaEventKind::MediaDeleted(MediaDeleted {
            media_id: self.state.id,
            media_type: MediaType::Movie,
        });
        self.record(ctx, clock, kind);
    }
}

impl AggregateRoot for Movie {
    type Event = MediaEvent;
    const AGGREGATE_TYPE: &'static str = "Movie";

    fn state(&self) -> &AggregateState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut AggregateState {
        &mut self.state
    }

    fn validate(&self) -> Result<(), DomainError> {
        validate_title(&self.title)?;
        validate_duration(self.duration_minutes)?;
        validate_file_path(self.file_path.as_deref())
    }

    fn status_tag(&self) -> &'static str {
        self.status.as_str()
    }

    fn uncommitted_events(&self) -> &[MediaEvent] {
        &self.uncommitted_events
    }

    fn take_uncommitted_events(&mut self) -> Vec<MediaEvent> {
        std::mem::take(&mut self.uncommitted_events)
    }
}

/// An episode of a series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    #[serde(flatten)]
    state: AggregateState,
    series_id: Uuid,
    season_number: u32,
    episode_number: u32,
    title: String,
    duration_minutes: Option<u32>,
    status: MediaStatus,
    file_path: Option<String>,
    #[serde(skip)]
    uncommitted_events: Vec<MediaEvent>,
}

impl Episode {
    /// Creates a pending episode of `series_id` and records `MediaCreated`.
    ///
    /// Use [`Series::add_episode`] in the same unit of work to index it.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the numbering, title or duration is invalid.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        ctx: &Context,
        clock: &dyn Clock,
        series_id: Uuid,
        season_number: u32,
        episode_number: u32,
        title: &str,
        duration_minutes: Option<u32>,
        processing: Option<ProcessingRequest>,
    ) -> Result<Self, DomainError> {
        validate_numbering(season_number, episode_number)?;
        validate_title(title)?;
        validate_duration(duration_minutes)?;
        let mut episode = Self {
            state: AggregateState::new(Uuid::new_v4(), clock),
            series_id,
            season_number,
            episode_number,
            title: title.to_owned(),
            duration_minutes,
            status: MediaStatus::Pending,
            file_path: None,
            uncommitted_events: Vec::new(),
        };
        let kind = MediaEventKind::MediaCreated(MediaCreated {
            media_id: episode.state.id,
            media_type: MediaType::Episode,
            title: episode.title.clone(),
            series_id: Some(series_id),
            processing,
        });
        episode.record(ctx, clock, kind);
        Ok(episode)
    }

    fn record(&mut self, ctx: &Context, clock: &dyn Clock, kind: MediaEventKind) {
        record(&mut self.state, &mut self.uncommitted_events, Self::AGGREGATE_TYPE, ctx, clock, kind);
    }

    /// Owning series.
    #[must_use]
    pub fn series_id(&self) -> Uuid {
        self.series_id
    }

    /// Season number.
    #[must_use]
    pub fn season_number(&self) -> u32 {
        self.season_number
    }

    /// Episode number within the season.
    #[must_use]
    pub fn episode_number(&self) -> u32 {
        self.episode_number
    }

    /// Title.
    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Runtime in minutes.
    #[must_use]
    pub fn duration_minutes(&self) -> Option<u32> {
        self.duration_minutes
    }

    /// Lifecycle status.
    #[must_use]
    pub fn status(&self) -> MediaStatus {
        self.status
    }

    /// Playable file, once transcoded.
    #[must_use]
    pub fn file_path(&self) -> Option<&str> {
        self.file_path.as_deref()
    }

    /// Moves to `to`; see [`Movie::change_status`].
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a transition outside the lattice.
    pub fn change_status(&mut self, ctx: &Context, clock: &dyn Clock, to: MediaStatus) -> Result<bool, DomainError> {
        let from = self.status;
        if !check_transition(from, to)? {
            return Ok(false);
        }
        self.status = to;
        let kind = MediaEventKind::MediaStatusChanged(MediaStatusChanged {
            media_id: self.state.id,
            media_type: MediaType::Episode,
            from,
            to,
        });
        self.record(ctx, clock, kind);
        Ok(true)
    }

    /// Sets the playable file; see [`Movie::set_file_path`].
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the path is not absolute.
    pub fn set_file_path(&mut self, ctx: &Context, clock: &dyn Clock, file_path: &str) -> Result<bool, DomainError> {
        validate_file_path(Some(file_path))?;
        if self.file_path.as_deref() == Some(file_path) {
            return Ok(false);
        }
        self.file_path = Some(file_path.to_owned());
        let kind = MediaEventKind::MediaFileUpdated(MediaFileUpdated {
            media_id: self.state.id,
            media_type: MediaType::Episode,
            file_path: file_path.to_owned(),
        });
        self.record(ctx, clock, kind);
        Ok(true)
    }

    /// Replaces the descriptive fields.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the title or duration is invalid.
    pub fn update_details(
        &mut self,
        ctx: &Context,
        clock: &dyn Clock,
        title: &str,
        duration_minutes: Option<u32>,
    ) -> Result<(), DomainError> {
        validate_title(title)?;
        validate_duration(duration_minutes)?;
        self.title = title.to_owned();
        self.duration_minutes = duration_minutes;
        let kind = MediaEventKind::MediaDetailsUpdated(MediaDetailsUpdated {
            media_id: self.state.id,
            media_type: MediaType::Episode,
            title: self.title.clone(),
            duration_minutes,
        });
        self.record(ctx, clock, kind);
        Ok(())
    }

    /// Records `MediaDeleted`; the caller removes the document.
    pub fn mark_deleted(&mut self, ctx: &Context, clock: &dyn Clock) {
        let kind = MediaEventKind::MediaDeleted(MediaDeleted {
            media_id: self.state.id,
            media_type: MediaType::Episode,
        });
        self.record(ctx, clock, kind);
    }
}

fn validate_numbering(season_number: u32, episode_number: u32) -> Result<(), DomainError> {
    if season_number == 0 || episode_number == 0 {
        return Err(DomainError::Validation(
            "season and episode numbers start at 1".into(),
        ));
    }
    Ok(())
}

impl AggregateRoot for Episode {
    type Event = MediaEvent;
    const AGGREGATE_TYPE: &'static str = "Episode";

    fn state(&self) -> &AggregateState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut AggregateState {
        &mut self.state
    }

    fn validate(&self) -> Result<(), DomainError> {
        validate_numbering(self.season_number, self.episode_number)?;
        validate_title(&self.title)?;
        validate_duration(self.duration_minutes)?;
        validate_file_path(self.file_path.as_deref())
    }

    fn status_tag(&self) -> &'static str {
        self.status.as_str()
    }

    fn uncommitted_events(&self) -> &[MediaEvent] {
        &self.uncommitted_events
    }

    fn take_uncommitted_events(&mut self) -> Vec<MediaEvent> {
        std::mem::take(&mut self.uncommitted_events)
    }
}

/// Position of an episode inside its series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeEntry {
    /// Episode aggregate id.
    pub episode_id: Uuid,
    /// Season number.
    pub season_number: u32,
    /// Episode number within the season.
    pub episode_number: u32,
}

/// A series and the ordered index of its episodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    #[serde(flatten)]
    state: AggregateState,
    title: String,
    release_year: Option<u16>,
    episodes: Vec<EpisodeEntry>,
    #[serde(skip)]
    uncommitted_events: Vec<MediaEvent>,
}

impl Series {
    /// Creates an empty series and records `MediaCreated`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the title is invalid.
    pub fn create(ctx: &Context, clock: &dyn Clock, title: &str, release_year: Option<u16>) -> Result<Self, DomainError> {
        validate_title(title)?;
        let mut series = Self {
            state: AggregateState::new(Uuid::new_v4(), clock),
            title: title.to_owned(),
            release_year,
            episodes: Vec::new(),
            uncommitted_events: Vec::new(),
        };
        let kind = MediaEventKind::MediaCreated(MediaCreated {
            media_id: series.state.id,
            media_type: MediaType::Series,
            title: series.title.clone(),
            series_id: None,
            processing: None,
        });
        series.record(ctx, clock, kind);
        Ok(series)
    }

    fn record(&mut self, ctx: &Context, clock: &dyn Clock, kind: MediaEventKind) {
        record(&mut self.state, &mut self.uncommitted_events, Self::AGGREGATE_TYPE, ctx, clock, kind);
    }

    /// Title.
    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Release year.
    #[must_use]
    pub fn release_year(&self) -> Option<u16> {
        self.release_year
    }

    /// Episodes ordered by season then episode number.
    #[must_use]
    pub fn episodes(&self) -> &[EpisodeEntry] {
        &self.episodes
    }

    /// Distinct season numbers, ascending.
    #[must_use]
    pub fn seasons(&self) -> Vec<u32> {
        let mut seasons: Vec<u32> = self.episodes.iter().map(|e| e.season_number).collect();
        seasons.dedup();
        seasons
    }

    /// Episodes of one season, in order.
    #[must_use]
    pub fn season(&self, season_number: u32) -> Vec<EpisodeEntry> {
        self.episodes
            .iter()
            .filter(|e| e.season_number == season_number)
            .copied()
            .collect()
    }

    /// Indexes `episode` in this series and records `EpisodeAdded`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the episode belongs to another
    /// series or the series is full, and `DomainError::Conflict` if its
    /// season/episode pair is already taken.
    pub fn add_episode(&mut self, ctx: &Context, clock: &dyn Clock, episode: &Episode) -> Result<(), DomainError> {
        if episode.series_id() != self.state.id {
            return Err(DomainError::Validation(format!(
                "episode {} belongs to series {}",
                episode.aggregate_id(),
                episode.series_id()
            )));
        }
        if self.episodes.len() >= MAX_EPISODES_PER_SERIES {
            return Err(DomainError::Validation(format!(
                "a series holds at most {MAX_EPISODES_PER_SERIES} episodes"
            )));
        }
        let key = (episode.season_number(), episode.episode_number());
        if self
            .episodes
            .iter()
            .any(|e| (e.season_number, e.episode_number) == key || e.episode_id == episode.aggregate_id())
        {
            return Err(DomainError::Conflict(format!(
                "S{:02}E{:02} already exists in series {}",
                key.0, key.1, self.state.id
            )));
        }
        let entry = EpisodeEntry {
            episode_id: episode.aggregate_id(),
            season_number: key.0,
            episode_number: key.1,
        };
        let position = self
            .episodes
            .partition_point(|e| (e.season_number, e.episode_number) < key);
        self.episodes.insert(position, entry);
        let kind = MediaEventKind::EpisodeAdded(EpisodeAdded {
            series_id: self.state.id,
            episode_id: entry.episode_id,
            season_number: entry.season_number,
            episode_number: entry.episode_number,
        });
        self.record(ctx, clock, kind);
        Ok(())
    }

    /// Removes an episode from the index and records `EpisodeRemoved`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` if the episode is not in this series.
    pub fn remove_episode(&mut self, ctx: &Context, clock: &dyn Clock, episode_id: Uuid) -> Result<(), DomainError> {
        let position = self
            .episodes
            .iter()
            .position(|e| e.episode_id == episode_id)
            .ok_or_else(|| DomainError::not_found("Episode", episode_id))?;
        self.episodes.remove(position);
        let kind = MediaEventKind::EpisodeRemoved(EpisodeRemoved {
            series_id: self.state.id,
            episode_id,
        });
        self.record(ctx, clock, kind);
        Ok(())
    }

    /// Renames the series.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the title is invalid.
    pub fn update_details(
        &mut self,
        ctx: &Context,
        clock: &dyn Clock,
        title: &str,
        release_year: Option<u16>,
    ) -> Result<(), DomainError> {
        validate_title(title)?;
        self.title = title.to_owned();
        self.release_year = release_year;
        let kind = MediaEventKind::MediaDetailsUpdated(MediaDetailsUpdated {
            media_id: self.state.id,
            media_type: MediaType::Series,
            title: self.title.clone(),
            duration_minutes: None,
        });
        self.record(ctx, clock, kind);
        Ok(())
    }

    /// Records `MediaDeleted`; the caller removes the document and its episodes.
    pub fn mark_deleted(&mut self, ctx: &Context, clock: &dyn Clock) {
        let kind = MediaEventKind::MediaDeleted(MediaDeleted {
            media_id: self.state.id,
            media_type: MediaType::Series,
        });
        self.record(ctx, clock, kind);
    }
}

impl AggregateRoot for Series {
    type Event = MediaEvent;
    const AGGREGATE_TYPE: &'static str = "Series";

    fn state(&self) -> &AggregateState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut AggregateState {
        &mut self.state
    }

    fn validate(&self) -> Result<(), DomainError> {
        validate_title(&self.title)?;
        if self.episodes.len() > MAX_EPISODES_PER_SERIES {
            return Err(DomainError::Validation(format!(
                "a series holds at most {MAX_EPISODES_PER_SERIES} episodes"
            )));
        }
        for (index, entry) in self.episodes.iter().enumerate() {
            validate_numbering(entry.season_number, entry.episode_number)?;
            if self.episodes[..index].iter().any(|e| {
                (e.season_number, e.episode_number) == (entry.season_number, entry.episode_number)
            }) {
                return Err(DomainError::Validation(format!(
                    "duplicate episode S{:02}E{:02}",
                    entry.season_number, entry.episode_number
                )));
            }
        }
        Ok(())
    }

    fn status_tag(&self) -> &'static str {
        "series"
    }

    fn uncommitted_events(&self) -> &[MediaEvent] {
        &self.uncommitted_events
    }

    fn take_uncommitted_events(&mut self) -> Vec<MediaEvent> {
        std::mem::take(&mut self.uncommitted_events)
    }
}

/// Any catalog item.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "media_type", rename_all = "snake_case")]
pub enum Media {
    /// A movie.
    Movie(Movie),
    /// A series.
    Series(Series),
    /// An episode.
    Episode(Episode),
}

impl Media {
    /// The variant tag.
    #[must_use]
    pub fn media_type(&self) -> MediaType {
        match self {
            Self::Movie(_) => MediaType::Movie,
            Self::Series(_) => MediaType::Series,
            Self::Episode(_) => MediaType::Episode,
        }
    }

    /// Aggregate id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        match self {
            Self::Movie(m) => m.aggregate_id(),
            Self::Series(s) => s.aggregate_id(),
            Self::Episode(e) => e.aggregate_id(),
        }
    }

    /// Aggregate version.
    #[must_use]
    pub fn version(&self) -> i64 {
        match self {
            Self::Movie(m) => m.version(),
            Self::Series(s) => s.version(),
            Self::Episode(e) => e.version(),
        }
    }

    /// Title.
    #[must_use]
    pub fn title(&self) -> &str {
        match self {
            Self::Movie(m) => m.title(),
            Self::Series(s) => s.title(),
            Self::Episode(e) => e.title(),
        }
    }

    /// Lifecycle status; series have none.
    #[must_use]
    pub fn status(&self) -> Option<MediaStatus> {
        match self {
            Self::Movie(m) => Some(m.status()),
            Self::Series(_) => None,
            Self::Episode(e) => Some(e.status()),
        }
    }

    /// Season numbers; empty for anything but a series.
    #[must_use]
    pub fn seasons(&self) -> Vec<u32> {
        match self {
            Self::Series(s) => s.seasons(),
            Self::Movie(_) | Self::Episode(_) => Vec::new(),
        }
    }

    /// Checks every invariant of the wrapped aggregate.
    ///
    /// # Errors
    ///
    /// Returns the first violation.
    pub fn validate(&self) -> Result<(), DomainError> {
        match self {
            Self::Movie(m) => m.validate(),
            Self::Series(s) => s.validate(),
            Self::Episode(e) => e.validate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use narwhal_core::event::DomainEvent;
    use narwhal_test_support::{FixedClock, TickingClock};

    fn clock() -> FixedClock {
        FixedClock(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap())
    }

    fn movie() -> Movie {
        Movie::create(&Context::background(), &clock(), "Heat", Some(1995), Some(170), None).unwrap()
    }

    #[test]
    fn test_create_movie_records_media_created_at_version_one() {
        // Arrange
        let ctx = Context::background().with_correlation("trace-1");

        // Act
        let movie = Movie::create(&ctx, &clock(), "Heat", Some(1995), Some(170), None).unwrap();

        // Assert
        assert_eq!(movie.version(), 1);
        assert_eq!(movie.status(), MediaStatus::Pending);
        let events = movie.uncommitted_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "MediaCreated");
        assert_eq!(events[0].metadata.sequence_number, 1);
        assert_eq!(events[0].metadata.aggregate_type, "Movie");
        assert_eq!(events[0].metadata.correlation_id, "trace-1");
    }

    #[test]
    fn test_title_must_be_present_and_bounded() {
        let ctx = Context::background();
        let long = "x".repeat(256);

        assert!(matches!(
            Movie::create(&ctx, &clock(), "  ", None, None, None),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            Movie::create(&ctx, &clock(), &long, None, None, None),
            Err(DomainError::Validation(_))
        ));
        assert!(Movie::create(&ctx, &clock(), &"x".repeat(255), None, None, None).is_ok());
    }

    #[test]
    fn test_duration_bounded_by_one_thousand_minutes() {
        let ctx = Context::background();

        assert!(Movie::create(&ctx, &clock(), "Long", None, Some(1000), None).is_ok());
        assert!(matches!(
            Movie::create(&ctx, &clock(), "Longer", None, Some(1001), None),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn test_every_mutation_bumps_version_and_never_rewinds_updated_at() {
        // Arrange
        let start = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        let clock = TickingClock::new(start, Duration::seconds(1));
        let ctx = Context::background();
        let mut movie = Movie::create(&ctx, &clock, "Heat", None, None, None).unwrap();

        // Act
        let before = (movie.version(), movie.state().updated_at);
        movie.change_status(&ctx, &clock, MediaStatus::Downloading).unwrap();
        let after = (movie.version(), movie.state().updated_at);

        // Assert
        assert_eq!(after.0, before.0 + 1);
        assert!(after.1 >= before.1);
    }

    #[test]
    fn test_status_follows_the_lattice() {
        let ctx = Context::background();
        let mut movie = movie();

        assert!(movie.change_status(&ctx, &clock(), MediaStatus::Downloading).unwrap());
        assert!(movie.change_status(&ctx, &clock(), MediaStatus::Transcoding).unwrap());
        assert!(movie.change_status(&ctx, &clock(), MediaStatus::Ready).unwrap());
        let err = movie.change_status(&ctx, &clock(), MediaStatus::Pending).unwrap_err();

        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(movie.status(), MediaStatus::Ready);
    }

    #[test]
    fn test_reapplying_status_is_a_no_op() {
        let ctx = Context::background();
        let mut movie = movie();
        movie.change_status(&ctx, &clock(), MediaStatus::Downloading).unwrap();
        let version = movie.version();

        let changed = movie.change_status(&ctx, &clock(), MediaStatus::Downloading).unwrap();

        assert!(!changed);
        assert_eq!(movie.version(), version);
        assert_eq!(movie.uncommitted_events().len(), 2);
    }

    #[test]
    fn test_file_path_must_be_absolute() {
        let ctx = Context::background();
        let mut movie = movie();

        let err = movie.set_file_path(&ctx, &clock(), "relative/master.m3u8").unwrap_err();
        let changed = movie.set_file_path(&ctx, &clock(), "/h/M/master.m3u8").unwrap();
        let again = movie.set_file_path(&ctx, &clock(), "/h/M/master.m3u8").unwrap();

        assert!(matches!(err, DomainError::Validation(_)));
        assert!(changed);
        assert!(!again);
        assert_eq!(movie.file_path(), Some("/h/M/master.m3u8"));
    }

    fn series_with_episode(season: u32, number: u32) -> (Series, Episode) {
        let ctx = Context::background();
        let mut series = Series::create(&ctx, &clock(), "The Wire", Some(2002)).unwrap();
        let episode =
            Episode::create(&ctx, &clock(), series.aggregate_id(), season, number, "The Target", Some(62), None)
                .unwrap();
        series.add_episode(&ctx, &clock(), &episode).unwrap();
        (series, episode)
    }

    #[test]
    fn test_series_rejects_duplicate_season_episode_pair() {
        // Arrange
        let ctx = Context::background();
        let (mut series, _) = series_with_episode(1, 1);
        let duplicate =
            Episode::create(&ctx, &clock(), series.aggregate_id(), 1, 1, "Again", None, None).unwrap();

        // Act
        let err = series.add_episode(&ctx, &clock(), &duplicate).unwrap_err();

        // Assert
        assert!(matches!(err, DomainError::Conflict(_)));
        assert_eq!(series.episodes().len(), 1);
    }

    #[test]
    fn test_series_keeps_episodes_ordered_and_enumerates_seasons() {
        let ctx = Context::background();
        let (mut series, _) = series_with_episode(2, 1);
        for (season, number) in [(1, 2), (1, 1), (3, 5)] {
            let episode =
                Episode::create(&ctx, &clock(), series.aggregate_id(), season, number, "Ep", None, None).unwrap();
            series.add_episode(&ctx, &clock(), &episode).unwrap();
        }

        let order: Vec<(u32, u32)> = series
            .episodes()
            .iter()
            .map(|e| (e.season_number, e.episode_number))
            .collect();

        assert_eq!(order, [(1, 1), (1, 2), (2, 1), (3, 5)]);
        assert_eq!(series.seasons(), [1, 2, 3]);
        assert_eq!(series.season(1).len(), 2);
    }

    #[test]
    fn test_episode_of_another_series_is_rejected() {
        let ctx = Context::background();
        let mut series = Series::create(&ctx, &clock(), "The Wire", None).unwrap();
        let stray = Episode::create(&ctx, &clock(), Uuid::new_v4(), 1, 1, "Stray", None, None).unwrap();

        let err = series.add_episode(&ctx, &clock(), &stray).unwrap_err();

        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn test_series_holds_at_most_one_thousand_episodes() {
        let ctx = Context::background();
        let mut series = Series::create(&ctx, &clock(), "Long Runner", None).unwrap();
        for number in 1..=1000 {
            let episode =
                Episode::create(&ctx, &clock(), series.aggregate_id(), 1, number, "Ep", None, None).unwrap();
            series.add_episode(&ctx, &clock(), &episode).unwrap();
        }
        let overflow = Episode::create(&ctx, &clock(), series.aggregate_id(), 2, 1, "Ep", None, None).unwrap();

        let err = series.add_episode(&ctx, &clock(), &overflow).unwrap_err();

        assert!(matches!(err, DomainError::Validation(_)));
        assert!(series.validate().is_ok());
    }

    #[test]
    fn test_episode_numbers_start_at_one() {
        let err =
            Episode::create(&Context::background(), &clock(), Uuid::new_v4(), 0, 1, "Pilot", None, None).unwrap_err();

        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn test_media_variant_dispatch() {
        let (series, episode) = series_with_episode(1, 1);
        let items = [Media::Movie(movie()), Media::Series(series), Media::Episode(episode)];

        let types: Vec<MediaType> = items.iter().map(Media::media_type).collect();

        assert_eq!(types, [MediaType::Movie, MediaType::Series, MediaType::Episode]);
        assert_eq!(items[1].seasons(), [1]);
        assert!(items[1].status().is_none());
        assert_eq!(items[2].status(), Some(MediaStatus::Pending));
        assert!(items.iter().all(|m| m.validate().is_ok()));
    }

    #[test]
    fn test_document_round_trip_keeps_state() {
        let ctx = Context::background();
        let mut movie = movie();
        movie.set_file_path(&ctx, &clock(), "/h/M/master.m3u8").unwrap();

        let document = serde_json::to_value(&movie).unwrap();
        let decoded: Movie = serde_json::from_value(document.clone()).unwrap();

        assert_eq!(document["status"], "pending");
        assert_eq!(document["title"], "Heat");
        assert_eq!(decoded.version(), movie.version());
        assert_eq!(decoded.file_path(), movie.file_path());
        assert!(decoded.uncommitted_events().is_empty());
    }
}
