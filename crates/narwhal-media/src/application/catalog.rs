//! The media catalog application service.
//!
//! Every command runs the outbox protocol: open a unit of work, mutate and
//! save the aggregates, append their events to the event store, dispatch the
//! domain events in-process, commit, and only then publish the integration
//! envelopes. A failed publish after commit is logged and left for
//! [`MediaCatalog::republish_unpublished`].

use std::sync::Arc;

use async_trait::async_trait;
use narwhal_core::aggregate::AggregateRoot;
use narwhal_core::clock::Clock;
use narwhal_core::command::Command;
use narwhal_core::context::Context;
use narwhal_core::dispatcher::DomainEventDispatcher;
use narwhal_core::error::DomainError;
use narwhal_core::memory::{InMemoryUnitOfWork, MemoryAggregateStore, MemoryEventStore};
use narwhal_core::ports::{IntegrationPublisher, MediaService, MediaStatus};
use narwhal_core::repository::{AggregateStore, EventStore, StoredEvent, Transaction, UnitOfWork, stored_events_of};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::aggregates::{Episode, Movie, Series};
use crate::domain::commands::{
    AddEpisode, CreateMovie, CreateSeries, DeleteMedia, UpdateMediaDetails, UpdateMediaFile, UpdateMediaStatus,
};
use crate::domain::events::MediaType;
use crate::domain::repositories::{EpisodeRepository, MediaRepository, MovieRepository, SeriesRepository};

/// Persistence the catalog runs against.
#[derive(Clone)]
pub struct CatalogStores {
    /// Unit of work shared by every store below.
    pub uow: Arc<dyn UnitOfWork>,
    /// Movie documents.
    pub movies: Arc<dyn AggregateStore<Movie>>,
    /// Series documents.
    pub series: Arc<dyn AggregateStore<Series>>,
    /// Episode documents.
    pub episodes: Arc<dyn AggregateStore<Episode>>,
    /// Domain event log.
    pub events: Arc<dyn EventStore>,
}

impl CatalogStores {
    /// In-memory stores enlisted in one in-memory unit of work.
    #[must_use]
    pub fn in_memory() -> Self {
        let uow = InMemoryUnitOfWork::new();
        Self {
            movies: MemoryAggregateStore::<Movie>::new(&uow),
            series: MemoryAggregateStore::<Series>::new(&uow),
            episodes: MemoryAggregateStore::<Episode>::new(&uow),
            events: MemoryEventStore::new(&uow),
            uow: Arc::new(uow),
        }
    }
}

impl std::fmt::Debug for CatalogStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogStores").finish_non_exhaustive()
    }
}

/// Commands and queries over movies, series and episodes.
pub struct MediaCatalog {
    uow: Arc<dyn UnitOfWork>,
    movies: MovieRepository,
    series: SeriesRepository,
    episodes: EpisodeRepository,
    events: Arc<dyn EventStore>,
    dispatcher: Arc<DomainEventDispatcher>,
    publisher: Arc<dyn IntegrationPublisher>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MediaCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaCatalog")
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl MediaCatalog {
    /// Creates a catalog with an empty domain event dispatcher.
    #[must_use]
    pub fn new(stores: CatalogStores, publisher: Arc<dyn IntegrationPublisher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            uow: stores.uow,
            movies: MediaRepository::new(stores.movies),
            series: MediaRepository::new(stores.series),
            episodes: MediaRepository::new(stores.episodes),
            events: stores.events,
            dispatcher: Arc::new(DomainEventDispatcher::new()),
            publisher,
            clock,
        }
    }

    /// Replaces the domain event dispatcher.
    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Arc<DomainEventDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// The in-process dispatcher run inside every unit of work.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<DomainEventDispatcher> {
        &self.dispatcher
    }

    /// Movie repository.
    #[must_use]
    pub fn movies(&self) -> &MovieRepository {
        &self.movies
    }

    /// Series repository.
    #[must_use]
    pub fn series(&self) -> &SeriesRepository {
        &self.series
    }

    /// Episode repository.
    #[must_use]
    pub fn episodes(&self) -> &EpisodeRepository {
        &self.episodes
    }

    /// Handles [`CreateMovie`].
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for invalid fields and
    /// `DomainError::Conflict` if a movie with the same title and year exists.
    pub async fn create_movie(&self, ctx: &Context, command: &CreateMovie) -> Result<Movie, DomainError> {
        let tx = self.uow.begin(ctx).await?;
        let outcome = self.stage_create_movie(tx.context(), command).await;
        let movie = self.complete(ctx, tx, outcome).await?;
        info!(
            command_type = command.command_type(),
            media_id = %movie.aggregate_id(),
            correlation_id = ctx.correlation_id(),
            "movie created"
        );
        Ok(movie)
    }

    async fn stage_create_movie(
        &self,
        ctx: &Context,
        command: &CreateMovie,
    ) -> Result<(Movie, Vec<StoredEvent>), DomainError> {
        let existing = self.movies.find_by_title(ctx, &command.title).await?;
        if existing.iter().any(|m| m.release_year() == command.release_year) {
            return Err(DomainError::Conflict(format!(
                "a movie titled {:?} from {:?} already exists",
                command.title, command.release_year
            )));
        }
        let mut movie = Movie::create(
            ctx,
            self.clock.as_ref(),
            &command.title,
            command.release_year,
            command.duration_minutes,
            command.processing.clone(),
        )?;
        let mut staged = Vec::new();
        self.stage(ctx, &self.movies, &mut movie, &mut staged).await?;
        Ok((movie, staged))
    }

    /// Handles [`CreateSeries`].
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for an invalid title and
    /// `DomainError::Conflict` if a series with the same title and year exists.
    pub async fn create_series(&self, ctx: &Context, command: &CreateSeries) -> Result<Series, DomainError> {
        let tx = self.uow.begin(ctx).await?;
        let outcome = self.stage_create_series(tx.context(), command).await;
        let series = self.complete(ctx, tx, outcome).await?;
        info!(
            command_type = command.command_type(),
            media_id = %series.aggregate_id(),
            correlation_id = ctx.correlation_id(),
            "series created"
        );
        Ok(series)
    }

    async fn stage_create_series(
        &self,
        ctx: &Context,
        command: &CreateSeries,
    ) -> Result<(Series, Vec<StoredEvent>), DomainError> {
        let existing = self.series.find_by_title(ctx, &command.title).await?;
        if existing.iter().any(|s| s.release_year() == command.release_year) {
            return Err(DomainError::Conflict(format!(
                "a series titled {:?} from {:?} already exists",
                command.title, command.release_year
            )));
        }
        let mut series = Series::create(ctx, self.clock.as_ref(), &command.title, command.release_year)?;
        let mut staged = Vec::new();
        self.stage(ctx, &self.series, &mut series, &mut staged).await?;
        Ok((series, staged))
    }

    /// Handles [`AddEpisode`]: creates the episode and indexes it in its
    /// series within one unit of work.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown series,
    /// `DomainError::Conflict` for a taken season/episode pair and
    /// `DomainError::Validation` for invalid fields.
    pub async fn add_episode(&self, ctx: &Context, command: &AddEpisode) -> Result<Episode, DomainError> {
        let tx = self.uow.begin(ctx).await?;
        let outcome = self.stage_add_episode(tx.context(), command).await;
        let episode = self.complete(ctx, tx, outcome).await?;
        info!(
            command_type = command.command_type(),
            series_id = %command.series_id,
            media_id = %episode.aggregate_id(),
            season = command.season_number,
            episode = command.episode_number,
            "episode added"
        );
        Ok(episode)
    }

    async fn stage_add_episode(
        &self,
        ctx: &Context,
        command: &AddEpisode,
    ) -> Result<(Episode, Vec<StoredEvent>), DomainError> {
        let clock = self.clock.as_ref();
        let mut series = self.series.get(ctx, command.series_id).await?;
        let mut episode = Episode::create(
            ctx,
            clock,
            command.series_id,
            command.season_number,
            command.episode_number,
            &command.title,
            command.duration_minutes,
            command.processing.clone(),
        )?;
        series.add_episode(ctx, clock, &episode)?;
        let mut staged = Vec::new();
        self.stage(ctx, &self.episodes, &mut episode, &mut staged).await?;
        self.stage(ctx, &self.series, &mut series, &mut staged).await?;
        Ok((episode, staged))
    }

    /// Handles [`UpdateMediaStatus`]. Returns `false` when the item already
    /// had the requested status.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown item and
    /// `DomainError::Validation` for an illegal transition or a series.
    pub async fn update_status(&self, ctx: &Context, command: &UpdateMediaStatus) -> Result<bool, DomainError> {
        let tx = self.uow.begin(ctx).await?;
        let outcome = self.stage_update_status(tx.context(), command).await;
        let changed = self.complete(ctx, tx, outcome).await?;
        if changed {
            info!(
                media_id = %command.media_id,
                media_type = command.media_type.as_str(),
                status = %command.status,
                correlation_id = ctx.correlation_id(),
                "media status changed"
            );
        } else {
            debug!(media_id = %command.media_id, status = %command.status, "media status unchanged");
        }
        Ok(changed)
    }

    async fn stage_update_status(
        &self,
        ctx: &Context,
        command: &UpdateMediaStatus,
    ) -> Result<(bool, Vec<StoredEvent>), DomainError> {
        let clock = self.clock.as_ref();
        let mut staged = Vec::new();
        let changed = match command.media_type {
            MediaType::Movie => {
                let mut movie = self.movies.get(ctx, command.media_id).await?;
                let changed = movie.change_status(ctx, clock, command.status)?;
                if changed {
                    self.stage(ctx, &self.movies, &mut movie, &mut staged).await?;
                }
                changed
            }
            MediaType::Episode => {
                let mut episode = self.episodes.get(ctx, command.media_id).await?;
                let changed = episode.change_status(ctx, clock, command.status)?;
                if changed {
                    self.stage(ctx, &self.episodes, &mut episode, &mut staged).await?;
                }
                changed
            }
            MediaType::Series => {
                return Err(DomainError::Validation("a series has no processing status".into()));
            }
        };
        Ok((changed, staged))
    }

    /// Handles [`UpdateMediaFile`]. Returns `false` when the path is unchanged.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown item and
    /// `DomainError::Validation` for a relative path or a series.
    pub async fn update_file(&self, ctx: &Context, command: &UpdateMediaFile) -> Result<bool, DomainError> {
        let tx = self.uow.begin(ctx).await?;
        let outcome = self.stage_update_file(tx.context(), command).await;
        let changed = self.complete(ctx, tx, outcome).await?;
        if changed {
            info!(media_id = %command.media_id, file_path = %command.file_path, "media file updated");
        }
        Ok(changed)
    }

    async fn stage_update_file(
        &self,
        ctx: &Context,
        command: &UpdateMediaFile,
    ) -> Result<(bool, Vec<StoredEvent>), DomainError> {
        let clock = self.clock.as_ref();
        let mut staged = Vec::new();
        let changed = match command.media_type {
            MediaType::Movie => {
                let mut movie = self.movies.get(ctx, command.media_id).await?;
                let changed = movie.set_file_path(ctx, clock, &command.file_path)?;
                if changed {
                    self.stage(ctx, &self.movies, &mut movie, &mut staged).await?;
                }
                changed
            }
            MediaType::Episode => {
                let mut episode = self.episodes.get(ctx, command.media_id).await?;
                let changed = episode.set_file_path(ctx, clock, &command.file_path)?;
                if changed {
                    self.stage(ctx, &self.episodes, &mut episode, &mut staged).await?;
                }
                changed
            }
            MediaType::Series => {
                return Err(DomainError::Validation("a series has no playable file".into()));
            }
        };
        Ok((changed, staged))
    }

    /// Handles [`UpdateMediaDetails`].
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown item and
    /// `DomainError::Validation` for invalid fields.
    pub async fn update_details(&self, ctx: &Context, command: &UpdateMediaDetails) -> Result<(), DomainError> {
        let tx = self.uow.begin(ctx).await?;
        let outcome = self.stage_update_details(tx.context(), command).await;
        self.complete(ctx, tx, outcome).await?;
        info!(media_id = %command.media_id, title = %command.title, "media details updated");
        Ok(())
    }

    async fn stage_update_details(
        &self,
        ctx: &Context,
        command: &UpdateMediaDetails,
    ) -> Result<((), Vec<StoredEvent>), DomainError> {
        let clock = self.clock.as_ref();
        let mut staged = Vec::new();
        match command.media_type {
            MediaType::Movie => {
                let mut movie = self.movies.get(ctx, command.media_id).await?;
                movie.update_details(
                    ctx,
                    clock,
                    &command.title,
                    command.release_year,
                    command.duration_minutes,
                )?;
                self.stage(ctx, &self.movies, &mut movie, &mut staged).await?;
            }
            MediaType::Series => {
                let mut series = self.series.get(ctx, command.media_id).await?;
                series.update_details(ctx, clock, &command.title, command.release_year)?;
                self.stage(ctx, &self.series, &mut series, &mut staged).await?;
            }
            MediaType::Episode => {
                let mut episode = self.episodes.get(ctx, command.media_id).await?;
                episode.update_details(ctx, clock, &command.title, command.duration_minutes)?;
                self.stage(ctx, &self.episodes, &mut episode, &mut staged).await?;
            }
        }
        Ok(((), staged))
    }

    /// Handles [`DeleteMedia`]. A series takes its episodes with it; an
    /// episode is removed from its series' index.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown item.
    pub async fn delete(&self, ctx: &Context, command: &DeleteMedia) -> Result<(), DomainError> {
        let tx = self.uow.begin(ctx).await?;
        let outcome = self.stage_delete(tx.context(), command).await;
        self.complete(ctx, tx, outcome).await?;
        info!(media_id = %command.media_id, media_type = command.media_type.as_str(), "media deleted");
        Ok(())
    }

    async fn stage_delete(&self, ctx: &Context, command: &DeleteMedia) -> Result<((), Vec<StoredEvent>), DomainError> {
        let clock = self.clock.as_ref();
        let mut staged = Vec::new();
        match command.media_type {
            MediaType::Movie => {
                let mut movie = self.movies.get(ctx, command.media_id).await?;
                movie.mark_deleted(ctx, clock);
                self.stage_removal(ctx, &self.movies, &mut movie, &mut staged).await?;
            }
            MediaType::Series => {
                let mut series = self.series.get(ctx, command.media_id).await?;
                for mut episode in self.episodes.find_by_series(ctx, command.media_id).await? {
                    episode.mark_deleted(ctx, clock);
                    self.stage_removal(ctx, &self.episodes, &mut episode, &mut staged).await?;
                }
                series.mark_deleted(ctx, clock);
                self.stage_removal(ctx, &self.series, &mut series, &mut staged).await?;
            }
            MediaType::Episode => {
                let mut episode = self.episodes.get(ctx, command.media_id).await?;
                if let Some(mut series) = self.series.find_by_id(ctx, episode.series_id()).await? {
                    series.remove_episode(ctx, clock, episode.aggregate_id())?;
                    self.stage(ctx, &self.series, &mut series, &mut staged).await?;
                }
                episode.mark_deleted(ctx, clock);
                self.stage_removal(ctx, &self.episodes, &mut episode, &mut staged).await?;
            }
        }
        Ok(((), staged))
    }

    /// Publishes committed events that were never accepted by the broker.
    ///
    /// Returns the number of events published.
    ///
    /// # Errors
    ///
    /// Returns the event store failure; individual publish failures are
    /// logged and left for the next sweep.
    pub async fn republish_unpublished(&self, ctx: &Context, limit: usize) -> Result<usize, DomainError> {
        let pending = self.events.unpublished(ctx, limit).await?;
        let published = self.publish_committed(ctx, &pending).await;
        if !pending.is_empty() {
            info!(pending = pending.len(), published, "outbox sweep finished");
        }
        Ok(published)
    }

    async fn stage<A: AggregateRoot>(
        &self,
        ctx: &Context,
        repo: &MediaRepository<A>,
        aggregate: &mut A,
        staged: &mut Vec<StoredEvent>,
    ) -> Result<(), DomainError> {
        let stored = stored_events_of(aggregate);
        repo.save(ctx, aggregate).await?;
        self.events.save(ctx, &stored).await?;
        let events = aggregate.take_uncommitted_events();
        self.dispatcher.dispatch_all(ctx, &events).await?;
        staged.extend(stored);
        Ok(())
    }

    async fn stage_removal<A: AggregateRoot>(
        &self,
        ctx: &Context,
        repo: &MediaRepository<A>,
        aggregate: &mut A,
        staged: &mut Vec<StoredEvent>,
    ) -> Result<(), DomainError> {
        let stored = stored_events_of(aggregate);
        repo.delete(ctx, aggregate.aggregate_id()).await?;
        self.events.save(ctx, &stored).await?;
        let events = aggregate.take_uncommitted_events();
        self.dispatcher.dispatch_all(ctx, &events).await?;
        staged.extend(stored);
        Ok(())
    }

    async fn complete<T>(
        &self,
        ctx: &Context,
        tx: Box<dyn Transaction>,
        outcome: Result<(T, Vec<StoredEvent>), DomainError>,
    ) -> Result<T, DomainError> {
        let (value, staged) = match outcome {
            Ok(done) => done,
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                return Err(err);
            }
        };
        tx.commit().await?;
        self.publish_committed(ctx, &staged).await;
        Ok(value)
    }

    async fn publish_committed(&self, ctx: &Context, events: &[StoredEvent]) -> usize {
        let ctx = ctx.clone().without_transaction();
        let mut published = 0;
        for event in events {
            match self.publisher.publish(&ctx, event.to_envelope()).await {
                Ok(ack) => {
                    published += 1;
                    debug!(
                        event_id = %event.event_id,
                        event_type = %event.event_type,
                        stream = %ack.stream,
                        sequence = ack.sequence,
                        "integration event published"
                    );
                    if let Err(err) = self.events.mark_published(&ctx, event.event_id, self.clock.now()).await {
                        warn!(event_id = %event.event_id, error = %err, "failed to mark event published");
                    }
                }
                Err(err) => warn!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    aggregate_id = %event.aggregate_id,
                    error = %err,
                    "integration publish failed after commit"
                ),
            }
        }
        published
    }
}

#[async_trait]
impl MediaService for MediaCatalog {
    async fn update_movie_status(&self, ctx: &Context, movie_id: Uuid, status: MediaStatus) -> Result<(), DomainError> {
        let command = UpdateMediaStatus {
            media_id: movie_id,
            media_type: MediaType::Movie,
            status,
        };
        self.update_status(ctx, &command).await.map(|_| ())
    }

    async fn update_episode_status(&self, ctx: &Context, episode_id: Uuid, status: MediaStatus) -> Result<(), DomainError> {
        let command = UpdateMediaStatus {
            media_id: episode_id,
            media_type: MediaType::Episode,
            status,
        };
        self.update_status(ctx, &command).await.map(|_| ())
    }

    async fn update_movie_file(&self, ctx: &Context, movie_id: Uuid, file_path: &str) -> Result<(), DomainError> {
        let command = UpdateMediaFile {
            media_id: movie_id,
            media_type: MediaType::Movie,
            file_path: file_path.to_owned(),
        };
        self.update_file(ctx, &command).await.map(|_| ())
    }

    async fn update_episode_file(&self, ctx: &Context, episode_id: Uuid, file_path: &str) -> Result<(), DomainError> {
        let command = UpdateMediaFile {
            media_id: episode_id,
            media_type: MediaType::Episode,
            file_path: file_path.to_owned(),
        };
        self.update_file(ctx, &command).await.map(|_| ())
    }
}
