//! Routes for the media catalog.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{
    Json, Router,
    routing::{get, put},
};
use narwhal_core::ports::MediaStatus;
use narwhal_media::domain::commands;
use narwhal_media::{Episode, Media, Movie, ProcessingRequest, Series};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use super::RequestContext;
use crate::error::ApiError;
use crate::state::AppState;

/// Request body for POST /movies.
#[derive(Debug, Deserialize)]
pub struct CreateMovieRequest {
    /// Title.
    pub title: String,
    /// Release year.
    pub release_year: Option<u16>,
    /// Runtime in minutes.
    pub duration_minutes: Option<u32>,
    /// Processing to start once the movie exists.
    pub processing: Option<ProcessingRequest>,
}

/// Request body for POST /series.
#[derive(Debug, Deserialize)]
pub struct CreateSeriesRequest {
    /// Title.
    pub title: String,
    /// Release year.
    pub release_year: Option<u16>,
}

/// Request body for POST /series/{id}/episodes.
#[derive(Debug, Deserialize)]
pub struct AddEpisodeRequest {
    /// Season number.
    pub season_number: u32,
    /// Episode number within the season.
    pub episode_number: u32,
    /// Title.
    pub title: String,
    /// Runtime in minutes.
    pub duration_minutes: Option<u32>,
    /// Processing to start once the episode exists.
    pub processing: Option<ProcessingRequest>,
}

/// Request body for PUT /media/{id}/status.
#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    /// Target status.
    pub status: MediaStatus,
}

/// Request body for PUT /media/{id}/file.
#[derive(Debug, Deserialize)]
pub struct UpdateFileRequest {
    /// Absolute path of the playable file.
    pub file_path: String,
}

/// Request body for PUT /media/{id}.
#[derive(Debug, Deserialize)]
pub struct UpdateDetailsRequest {
    /// New title.
    pub title: String,
    /// New release year.
    pub release_year: Option<u16>,
    /// New runtime in minutes.
    pub duration_minutes: Option<u32>,
}

/// Response body of a status or file change.
#[derive(Debug, Serialize)]
pub struct ChangeResponse {
    /// `false` when the item already had the requested value.
    pub changed: bool,
}

/// Query string of GET /movies.
#[derive(Debug, Deserialize)]
pub struct MovieFilter {
    /// Only movies in this status.
    pub status: Option<MediaStatus>,
}

/// Query string of GET /series/{id}/episodes.
#[derive(Debug, Deserialize)]
pub struct SeasonFilter {
    /// Only episodes of this season.
    pub season: Option<u32>,
}

/// Query string of GET /media.
#[derive(Debug, Deserialize)]
pub struct TitleFilter {
    /// Exact title.
    pub title: String,
}

/// POST /movies
#[instrument(skip(state, ctx, request), fields(title = %request.title))]
async fn create_movie(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Json(request): Json<CreateMovieRequest>,
) -> Result<(StatusCode, Json<Movie>), ApiError> {
    let command = commands::CreateMovie {
        title: request.title,
        release_year: request.release_year,
        duration_minutes: request.duration_minutes,
        processing: request.processing,
    };
    let movie = state.catalog.create_movie(&ctx, &command).await?;
    info!(correlation_id = ctx.correlation_id(), "movie created");
    Ok((StatusCode::CREATED, Json(movie)))
}

/// GET /movies
#[instrument(skip(state, ctx))]
async fn list_movies(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Query(filter): Query<MovieFilter>,
) -> Result<Json<Vec<Movie>>, ApiError> {
    Ok(Json(state.catalog.list_movies(&ctx, filter.status).await?))
}

/// POST /series
#[instrument(skip(state, ctx, request), fields(title = %request.title))]
async fn create_series(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Json(request): Json<CreateSeriesRequest>,
) -> Result<(StatusCode, Json<Series>), ApiError> {
    let command = commands::CreateSeries {
        title: request.title,
        release_year: request.release_year,
    };
    let series = state.catalog.create_series(&ctx, &command).await?;
    Ok((StatusCode::CREATED, Json(series)))
}

/// GET /series
#[instrument(skip(state, ctx))]
async fn list_series(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
) -> Result<Json<Vec<Series>>, ApiError> {
    Ok(Json(state.catalog.list_series(&ctx).await?))
}

/// POST /series/{id}/episodes
#[instrument(skip(state, ctx, request), fields(%series_id))]
async fn add_episode(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(series_id): Path<Uuid>,
    Json(request): Json<AddEpisodeRequest>,
) -> Result<(StatusCode, Json<Episode>), ApiError> {
    let command = commands::AddEpisode {
        series_id,
        season_number: request.season_number,
        episode_number: request.episode_number,
        title: request.title,
        duration_minutes: request.duration_minutes,
        processing: request.processing,
    };
    let episode = state.catalog.add_episode(&ctx, &command).await?;
    Ok((StatusCode::CREATED, Json(episode)))
}

/// GET /series/{id}/episodes
#[instrument(skip(state, ctx), fields(%series_id))]
async fn series_episodes(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(series_id): Path<Uuid>,
    Query(filter): Query<SeasonFilter>,
) -> Result<Json<Vec<Episode>>, ApiError> {
    Ok(Json(state.catalog.series_episodes(&ctx, series_id, filter.season).await?))
}

/// GET /media
#[instrument(skip(state, ctx))]
async fn find_by_title(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Query(filter): Query<TitleFilter>,
) -> Result<Json<Vec<Media>>, ApiError> {
    Ok(Json(state.catalog.find_by_title(&ctx, &filter.title).await?))
}

/// GET /media/{id}
#[instrument(skip(state, ctx), fields(%media_id))]
async fn get_media(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(media_id): Path<Uuid>,
) -> Result<Json<Media>, ApiError> {
    Ok(Json(state.catalog.get_media(&ctx, media_id).await?))
}

/// PUT /media/{id}
#[instrument(skip(state, ctx, request), fields(%media_id))]
async fn update_details(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(media_id): Path<Uuid>,
    Json(request): Json<UpdateDetailsRequest>,
) -> Result<Json<Media>, ApiError> {
    let media_type = state.catalog.get_media(&ctx, media_id).await?.media_type();
    let command = commands::UpdateMediaDetails {
        media_id,
        media_type,
        title: request.title,
        release_year: request.release_year,
        duration_minutes: request.duration_minutes,
    };
    state.catalog.update_details(&ctx, &command).await?;
    Ok(Json(state.catalog.get_media(&ctx, media_id).await?))
}

/// DELETE /media/{id}
#[instrument(skip(state, ctx), fields(%media_id))]
async fn delete_media(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(media_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let media_type = state.catalog.get_media(&ctx, media_id).await?.media_type();
    let command = commands::DeleteMedia { media_id, media_type };
    state.catalog.delete(&ctx, &command).await?;
    info!(correlation_id = ctx.correlation_id(), "media deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /media/{id}/status
#[instrument(skip(state, ctx, request), fields(%media_id, status = %request.status))]
async fn update_status(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(media_id): Path<Uuid>,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<Json<ChangeResponse>, ApiError> {
    let media_type = state.catalog.get_media(&ctx, media_id).await?.media_type();
    let command = commands::UpdateMediaStatus {
        media_id,
        media_type,
        status: request.status,
    };
    let changed = state.catalog.update_status(&ctx, &command).await?;
    Ok(Json(ChangeResponse { changed }))
}

/// PUT /media/{id}/file
#[instrument(skip(state, ctx, request), fields(%media_id))]
async fn update_file(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(media_id): Path<Uuid>,
    Json(request): Json<UpdateFileRequest>,
) -> Result<Json<ChangeResponse>, ApiError> {
    let media_type = state.catalog.get_media(&ctx, media_id).await?.media_type();
    let command = commands::UpdateMediaFile {
        media_id,
        media_type,
        file_path: request.file_path,
    };
    let changed = state.catalog.update_file(&ctx, &command).await?;
    Ok(Json(ChangeResponse { changed }))
}

/// Returns the router for the media catalog.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/movies", get(list_movies).post(create_movie))
        .route("/series", get(list_series).post(create_series))
        .route("/series/{id}/episodes", get(series_episodes).post(add_episode))
        .route("/media", get(find_by_title))
        .route("/media/{id}", get(get_media).put(update_details).delete(delete_media))
        .route("/media/{id}/status", put(update_status))
        .route("/media/{id}/file", put(update_file))
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::Request;
    use axum::response::Response;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use crate::testing::test_state;

    fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body_bytes).unwrap()
    }

    async fn create_movie_via(app: &Router, title: &str) -> Value {
        let body = json!({ "title": title, "release_year": 1995, "duration_minutes": 170 });
        let response = app.clone().oneshot(json_request("POST", "/movies", &body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response).await
    }

    #[tokio::test]
    async fn test_create_movie_returns_201_with_pending_movie() {
        // Arrange
        let (state, _dir) = test_state().await;
        let app = router().with_state(state);

        // Act
        let json = create_movie_via(&app, "Heat").await;

        // Assert
        assert_eq!(json["title"], "Heat");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["version"], 1);
        Uuid::parse_str(json["id"].as_str().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_create_movie_returns_400_for_blank_title() {
        // Arrange
        let (state, _dir) = test_state().await;
        let app = router().with_state(state);

        // Act
        let response = app
            .oneshot(json_request("POST", "/movies", &json!({ "title": "  " })))
            .await
            .unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], "validation_error");
    }

    #[tokio::test]
    async fn test_create_movie_returns_422_for_missing_title() {
        // Arrange
        let (state, _dir) = test_state().await;
        let app = router().with_state(state);

        // Act
        let response = app.oneshot(json_request("POST", "/movies", &json!({}))).await.unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_get_media_returns_tagged_movie() {
        // Arrange
        let (state, _dir) = test_state().await;
        let app = router().with_state(state);
        let created = create_movie_via(&app, "Heat").await;
        let id = created["id"].as_str().unwrap();

        // Act
        let response = app.oneshot(get_request(&format!("/media/{id}"))).await.unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["media_type"], "movie");
        assert_eq!(json["title"], "Heat");
    }

    #[tokio::test]
    async fn test_get_media_returns_404_for_unknown_id() {
        // Arrange
        let (state, _dir) = test_state().await;
        let app = router().with_state(state);

        // Act
        let response = app
            .oneshot(get_request(&format!("/media/{}", Uuid::new_v4())))
            .await
            .unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error"], "not_found");
    }

    #[tokio::test]
    async fn test_list_movies_filters_by_status() {
        // Arrange
        let (state, _dir) = test_state().await;
        let app = router().with_state(state);
        let heat = create_movie_via(&app, "Heat").await;
        create_movie_via(&app, "Ronin").await;
        let id = heat["id"].as_str().unwrap();
        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                &format!("/media/{id}/status"),
                &json!({ "status": "downloading" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Act
        let all = body_json(app.clone().oneshot(get_request("/movies")).await.unwrap()).await;
        let downloading = body_json(app.oneshot(get_request("/movies?status=downloading")).await.unwrap()).await;

        // Assert
        assert_eq!(all.as_array().unwrap().len(), 2);
        let downloading = downloading.as_array().unwrap();
        assert_eq!(downloading.len(), 1);
        assert_eq!(downloading[0]["title"], "Heat");
    }

    #[tokio::test]
    async fn test_update_status_reports_unchanged_for_same_status() {
        // Arrange
        let (state, _dir) = test_state().await;
        let app = router().with_state(state);
        let created = create_movie_via(&app, "Heat").await;
        let uri = format!("/media/{}/status", created["id"].as_str().unwrap());

        // Act
        let response = app
            .oneshot(json_request("PUT", &uri, &json!({ "status": "pending" })))
            .await
            .unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["changed"], false);
    }

    #[tokio::test]
    async fn test_update_status_returns_400_for_illegal_transition() {
        // Arrange
        let (state, _dir) = test_state().await;
        let app = router().with_state(state);
        let created = create_movie_via(&app, "Heat").await;
        let uri = format!("/media/{}/status", created["id"].as_str().unwrap());

        // Act
        let response = app
            .oneshot(json_request("PUT", &uri, &json!({ "status": "ready" })))
            .await
            .unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_add_episode_and_list_by_season() {
        // Arrange
        let (state, _dir) = test_state().await;
        let app = router().with_state(state);
        let response = app
            .clone()
            .oneshot(json_request("POST", "/series", &json!({ "title": "The Wire", "release_year": 2002 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let series = body_json(response).await;
        let uri = format!("/series/{}/episodes", series["id"].as_str().unwrap());
        for (season, episode) in [(1, 1), (1, 2), (2, 1)] {
            let body = json!({
                "season_number": season,
                "episode_number": episode,
                "title": format!("S{season}E{episode}"),
            });
            let response = app.clone().oneshot(json_request("POST", &uri, &body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        // Act
        let season_one = body_json(app.oneshot(get_request(&format!("{uri}?season=1"))).await.unwrap()).await;

        // Assert
        let season_one = season_one.as_array().unwrap();
        assert_eq!(season_one.len(), 2);
        assert!(season_one.iter().all(|episode| episode["season_number"] == 1));
    }

    #[tokio::test]
    async fn test_add_episode_returns_404_for_unknown_series() {
        // Arrange
        let (state, _dir) = test_state().await;
        let app = router().with_state(state);
        let body = json!({ "season_number": 1, "episode_number": 1, "title": "Pilot" });

        // Act
        let response = app
            .oneshot(json_request("POST", &format!("/series/{}/episodes", Uuid::new_v4()), &body))
            .await
            .unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_media_returns_204_then_404() {
        // Arrange
        let (state, _dir) = test_state().await;
        let app = router().with_state(state);
        let created = create_movie_via(&app, "Heat").await;
        let uri = format!("/media/{}", created["id"].as_str().unwrap());

        // Act
        let deleted = app
            .clone()
            .oneshot(Request::builder().method("DELETE").uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let fetched = app.oneshot(get_request(&uri)).await.unwrap();

        // Assert
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
        assert_eq!(fetched.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_find_by_title_matches_exact_title() {
        // Arrange
        let (state, _dir) = test_state().await;
        let app = router().with_state(state);
        create_movie_via(&app, "Heat").await;
        create_movie_via(&app, "Ronin").await;

        // Act
        let json = body_json(app.oneshot(get_request("/media?title=Heat")).await.unwrap()).await;

        // Assert
        let found = json.as_array().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["media_type"], "movie");
    }
}
