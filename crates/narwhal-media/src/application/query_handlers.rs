//! Read-side operations of the media catalog.

use narwhal_core::context::Context;
use narwhal_core::error::DomainError;
use narwhal_core::ports::MediaStatus;
use uuid::Uuid;

use crate::application::catalog::MediaCatalog;
use crate::domain::aggregates::{Episode, Media, Movie, Series};

impl MediaCatalog {
    /// Looks an item up by id across movies, series and episodes.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` if no item has this id.
    pub async fn get_media(&self, ctx: &Context, id: Uuid) -> Result<Media, DomainError> {
        if let Some(movie) = self.movies().find_by_id(ctx, id).await? {
            return Ok(Media::Movie(movie));
        }
        if let Some(series) = self.series().find_by_id(ctx, id).await? {
            return Ok(Media::Series(series));
        }
        match self.episodes().find_by_id(ctx, id).await? {
            Some(episode) => Ok(Media::Episode(episode)),
            None => Err(DomainError::not_found("Media", id)),
        }
    }

    /// Movies, optionally restricted to one status.
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    pub async fn list_movies(&self, ctx: &Context, status: Option<MediaStatus>) -> Result<Vec<Movie>, DomainError> {
        match status {
            Some(status) => self.movies().find_movies_by_status(ctx, status).await,
            None => self.movies().find_all(ctx).await,
        }
    }

    /// Every series.
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    pub async fn list_series(&self, ctx: &Context) -> Result<Vec<Series>, DomainError> {
        self.series().find_all(ctx).await
    }

    /// Episodes of a series, optionally one season only.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown series.
    pub async fn series_episodes(
        &self,
        ctx: &Context,
        series_id: Uuid,
        season: Option<u32>,
    ) -> Result<Vec<Episode>, DomainError> {
        self.series().get(ctx, series_id).await?;
        match season {
            Some(season) => self.episodes().find_by_season(ctx, series_id, season).await,
            None => self.episodes().find_by_series(ctx, series_id).await,
        }
    }

    /// Items with exactly this title.
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    pub async fn find_by_title(&self, ctx: &Context, title: &str) -> Result<Vec<Media>, DomainError> {
        let mut found: Vec<Media> = self
            .movies()
            .find_by_title(ctx, title)
            .await?
            .into_iter()
            .map(Media::Movie)
            .collect();
        found.extend(self.series().find_by_title(ctx, title).await?.into_iter().map(Media::Series));
        found.extend(self.episodes().find_by_title(ctx, title).await?.into_iter().map(Media::Episode));
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use narwhal_core::aggregate::AggregateRoot;
    use narwhal_core::clock::SystemClock;
    use narwhal_core::ports::MediaService;
    use narwhal_test_support::RecordingPublisher;

    use super::*;
    use crate::application::catalog::CatalogStores;
    use crate::domain::commands::{AddEpisode, CreateMovie, CreateSeries};
    use crate::domain::events::MediaType;

    fn catalog() -> MediaCatalog {
        MediaCatalog::new(
            CatalogStores::in_memory(),
            Arc::new(RecordingPublisher::new()),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn test_get_media_resolves_every_variant() {
        // Arrange
        let catalog = catalog();
        let ctx = Context::background();
        let movie = catalog
            .create_movie(
                &ctx,
                &CreateMovie {
                    title: "Alien".to_owned(),
                    release_year: Some(1979),
                    duration_minutes: None,
                    processing: None,
                },
            )
            .await
            .unwrap();
        let series = catalog
            .create_series(
                &ctx,
                &CreateSeries {
                    title: "Alien".to_owned(),
                    release_year: Some(2025),
                },
            )
            .await
            .unwrap();

        // Act
        let found_movie = catalog.get_media(&ctx, movie.aggregate_id()).await.unwrap();
        let found_series = catalog.get_media(&ctx, series.aggregate_id()).await.unwrap();
        let missing = catalog.get_media(&ctx, Uuid::new_v4()).await.unwrap_err();
        let by_title = catalog.find_by_title(&ctx, "Alien").await.unwrap();

        // Assert
        assert_eq!(found_movie.media_type(), MediaType::Movie);
        assert_eq!(found_series.media_type(), MediaType::Series);
        assert!(matches!(missing, DomainError::NotFound { entity: "Media", .. }));
        assert_eq!(by_title.len(), 2);
    }

    #[tokio::test]
    async fn test_list_movies_filters_by_status() {
        let catalog = catalog();
        let ctx = Context::background();
        for title in ["Heat", "Ronin"] {
            catalog
                .create_movie(
                    &ctx,
                    &CreateMovie {
                        title: title.to_owned(),
                        release_year: None,
                        duration_minutes: None,
                        processing: None,
                    },
                )
                .await
                .unwrap();
        }
        let ronin = catalog.movies().find_by_title(&ctx, "Ronin").await.unwrap().remove(0);
        catalog
            .update_movie_status(&ctx, ronin.aggregate_id(), MediaStatus::Downloading)
            .await
            .unwrap();

        let downloading = catalog.list_movies(&ctx, Some(MediaStatus::Downloading)).await.unwrap();
        let all = catalog.list_movies(&ctx, None).await.unwrap();

        assert_eq!(downloading.len(), 1);
        assert_eq!(downloading[0].title(), "Ronin");
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_series_episodes_by_season() {
        let catalog = catalog();
        let ctx = Context::background();
        let series = catalog
            .create_series(
                &ctx,
                &CreateSeries {
                    title: "Andor".to_owned(),
                    release_year: Some(2022),
                },
            )
            .await
            .unwrap();
        for (season, number) in [(2, 1), (1, 2), (1, 1)] {
            catalog
                .add_episode(
                    &ctx,
                    &AddEpisode {
                        series_id: series.aggregate_id(),
                        season_number: season,
                        episode_number: number,
                        title: format!("S{season}E{number}"),
                        duration_minutes: None,
                        processing: None,
                    },
                )
                .await
                .unwrap();
        }

        let first = catalog.series_episodes(&ctx, series.aggregate_id(), Some(1)).await.unwrap();
        let all = catalog.series_episodes(&ctx, series.aggregate_id(), None).await.unwrap();
        let unknown = catalog.series_episodes(&ctx, Uuid::new_v4(), None).await.unwrap_err();

        assert_eq!(first.iter().map(Episode::episode_number).collect::<Vec<_>>(), [1, 2]);
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].season_number(), 2);
        assert!(matches!(unknown, DomainError::NotFound { .. }));
    }
}
