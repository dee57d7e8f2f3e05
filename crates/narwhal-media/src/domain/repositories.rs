//! Repositories for the media aggregates.
//!
//! Each repository wraps a document store. Calls made with a
//! transaction-scoped context participate in that transaction.

use std::sync::Arc;

use narwhal_core::aggregate::AggregateRoot;
use narwhal_core::context::Context;
use narwhal_core::error::DomainError;
use narwhal_core::ports::MediaStatus;
use narwhal_core::repository::AggregateStore;
use uuid::Uuid;

use super::aggregates::{Episode, Movie, Series};

/// Repository over one media aggregate type.
pub struct MediaRepository<A: AggregateRoot> {
    store: Arc<dyn AggregateStore<A>>,
}

/// Movie repository.
pub type MovieRepository = MediaRepository<Movie>;

/// Series repository.
pub type SeriesRepository = MediaRepository<Series>;

/// Episode repository.
pub type EpisodeRepository = MediaRepository<Episode>;

impl<A: AggregateRoot> Clone for MediaRepository<A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<A: AggregateRoot> std::fmt::Debug for MediaRepository<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaRepository")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .finish_non_exhaustive()
    }
}

impl<A: AggregateRoot> MediaRepository<A> {
    /// Creates a repository over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn AggregateStore<A>>) -> Self {
        Self { store }
    }

    /// Persists the aggregate under optimistic concurrency.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ConcurrentModification` if the stored version
    /// moved since the aggregate was loaded.
    pub async fn save(&self, ctx: &Context, aggregate: &mut A) -> Result<(), DomainError> {
        self.store.save(ctx, aggregate).await
    }

    /// Loads an aggregate.
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    pub async fn find_by_id(&self, ctx: &Context, id: Uuid) -> Result<Option<A>, DomainError> {
        self.store.find_by_id(ctx, id).await
    }

    /// Loads an aggregate that must exist.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` if it does not.
    pub async fn get(&self, ctx: &Context, id: Uuid) -> Result<A, DomainError> {
        self.store
            .find_by_id(ctx, id)
            .await?
            .ok_or_else(|| DomainError::not_found(A::AGGREGATE_TYPE, id))
    }

    /// Removes an aggregate.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` if it does not exist.
    pub async fn delete(&self, ctx: &Context, id: Uuid) -> Result<(), DomainError> {
        self.store.delete(ctx, id).await
    }

    /// Aggregates with exactly this title.
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    pub async fn find_by_title(&self, ctx: &Context, title: &str) -> Result<Vec<A>, DomainError> {
        self.store
            .find_by_field(ctx, "title", &serde_json::Value::from(title))
            .await
    }

    /// Every stored aggregate, oldest first.
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    pub async fn find_all(&self, ctx: &Context) -> Result<Vec<A>, DomainError> {
        let mut all = self.store.find_all(ctx).await?;
        all.sort_by_key(|a| (a.state().created_at, a.aggregate_id()));
        Ok(all)
    }

    async fn find_by_status(&self, ctx: &Context, status: MediaStatus) -> Result<Vec<A>, DomainError> {
        self.store
            .find_by_field(ctx, "status", &serde_json::Value::from(status.as_str()))
            .await
    }
}

impl MediaRepository<Movie> {
    /// Movies in `status`.
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    pub async fn find_movies_by_status(&self, ctx: &Context, status: MediaStatus) -> Result<Vec<Movie>, DomainError> {
        self.find_by_status(ctx, status).await
    }
}

impl MediaRepository<Episode> {
    /// Episodes in `status`.
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    pub async fn find_episodes_by_status(
        &self,
        ctx: &Context,
        status: MediaStatus,
    ) -> Result<Vec<Episode>, DomainError> {
        self.find_by_status(ctx, status).await
    }

    /// Episodes of a series ordered by season and episode number.
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    pub async fn find_by_series(&self, ctx: &Context, series_id: Uuid) -> Result<Vec<Episode>, DomainError> {
        let mut episodes = self
            .store
            .find_by_field(ctx, "series_id", &serde_json::Value::from(series_id.to_string()))
            .await?;
        episodes.sort_by_key(|e| (e.season_number(), e.episode_number()));
        Ok(episodes)
    }

    /// Episodes of one season of a series, in order.
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    pub async fn find_by_season(
        &self,
        ctx: &Context,
        series_id: Uuid,
        season_number: u32,
    ) -> Result<Vec<Episode>, DomainError> {
        let mut episodes = self.find_by_series(ctx, series_id).await?;
        episodes.retain(|e| e.season_number() == season_number);
        Ok(episodes)
    }
}
