//! Routes for transcode jobs.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{
    Json, Router,
    routing::{get, post},
};
use narwhal_core::aggregate::AggregateRoot;
use narwhal_transcode::{Capabilities, JobOptions, TranscodeJob};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use super::RequestContext;
use crate::error::ApiError;
use crate::state::AppState;

/// Request body for POST /jobs.
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    /// Absolute path of the source file.
    pub input_path: String,
    /// Absolute output directory (HLS) or file.
    pub output_path: String,
    /// Profile tag, e.g. `hls` or `mp4`.
    pub profile: String,
    /// Overrides of the profile defaults.
    #[serde(default)]
    pub options: JobOptions,
    /// Start the job right after creating it.
    #[serde(default)]
    pub start: bool,
}

/// Response body of the job lifecycle actions.
#[derive(Debug, Serialize)]
pub struct JobActionResponse {
    /// The job acted on.
    pub job_id: Uuid,
    /// Action accepted.
    pub action: &'static str,
}

/// POST /jobs
#[instrument(skip(state, ctx, request), fields(profile = %request.profile))]
async fn create_job(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<TranscodeJob>), ApiError> {
    let job = state
        .transcodes
        .create_job(
            &ctx,
            &request.input_path,
            &request.output_path,
            &request.profile,
            &request.options,
        )
        .await?;
    if !request.start {
        return Ok((StatusCode::CREATED, Json(job)));
    }
    let job_id = job.aggregate_id();
    state.transcodes.start_job(&ctx, job_id).await?;
    info!(%job_id, "transcode job created and started");
    Ok((StatusCode::CREATED, Json(state.transcodes.get_job(&ctx, job_id).await?)))
}

/// GET /jobs
#[instrument(skip(state, ctx))]
async fn list_jobs(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
) -> Result<Json<Vec<TranscodeJob>>, ApiError> {
    Ok(Json(state.transcodes.list_jobs(&ctx).await?))
}

/// GET /jobs/{id}
#[instrument(skip(state, ctx), fields(%job_id))]
async fn get_job(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(job_id): Path<Uuid>,
) -> Result<Json<TranscodeJob>, ApiError> {
    Ok(Json(state.transcodes.get_job(&ctx, job_id).await?))
}

/// POST /jobs/{id}/start
#[instrument(skip(state, ctx), fields(%job_id))]
async fn start_job(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobActionResponse>), ApiError> {
    state.transcodes.start_job(&ctx, job_id).await?;
    Ok(accepted(job_id, "start"))
}

/// POST /jobs/{id}/cancel
#[instrument(skip(state, ctx), fields(%job_id))]
async fn cancel_job(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobActionResponse>), ApiError> {
    state.transcodes.cancel_job(&ctx, job_id).await?;
    Ok(accepted(job_id, "cancel"))
}

/// POST /jobs/{id}/retry
#[instrument(skip(state, ctx), fields(%job_id))]
async fn retry_job(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobActionResponse>), ApiError> {
    state.transcodes.retry_job(&ctx, job_id).await?;
    Ok(accepted(job_id, "retry"))
}

/// GET /capabilities
async fn capabilities(State(state): State<AppState>) -> Json<Capabilities> {
    Json(state.transcodes.capabilities().clone())
}

fn accepted(job_id: Uuid, action: &'static str) -> (StatusCode, Json<JobActionResponse>) {
    (StatusCode::ACCEPTED, Json(JobActionResponse { job_id, action }))
}

/// Returns the router for transcode jobs.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/capabilities", get(capabilities))
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/start", post(start_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/retry", post(retry_job))
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

    fn post_request(uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body_bytes).unwrap()
    }

    async fn create_pending_job(app: &Router) -> String {
        let body = json!({
            "input_path": "/media/in/heat.mkv",
            "output_path": "/media/out/heat",
            "profile": "hls_720p",
            "options": { "crf": 21 },
        });
        let response = app.clone().oneshot(post_request("/jobs", &body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        json["id"].as_str().unwrap().to_owned()
    }

    #[tokio::test]
    async fn test_create_job_returns_201_with_pending_job() {
        // Arrange
        let (state, _dir) = test_state().await;
        let app = router().with_state(state);

        // Act
        let id = create_pending_job(&app).await;
        let response = app
            .oneshot(Request::builder().uri(format!("/jobs/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "pending");
        assert_eq!(json["profile"], "hls_720p");
        assert_eq!(json["retry_count"], 0);
    }

    #[tokio::test]
    async fn test_create_job_keeps_resolution_rate_and_extra_args() {
        // Arrange
        let (state, _dir) = test_state().await;
        let app = router().with_state(state);
        let body = json!({
            "input_path": "/media/in/heat.mkv",
            "output_path": "/media/out/heat.mp4",
            "profile": "mp4",
            "options": {
                "resolution": { "width": 1280, "height": 720 },
                "frame_rate": 25.0,
                "extra_args": ["-tune", "film"],
            },
        });

        // Act
        let response = app.oneshot(post_request("/jobs", &body)).await.unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["options"]["resolution"], json!({ "width": 1280, "height": 720 }));
        assert_eq!(json["options"]["frame_rate"], 25.0);
        assert_eq!(json["options"]["extra_args"], json!(["-tune", "film"]));
        assert_eq!(json["probe"], Value::Null);
    }

    #[tokio::test]
    async fn test_create_job_returns_400_for_unknown_profile() {
        // Arrange
        let (state, _dir) = test_state().await;
        let app = router().with_state(state);
        let body = json!({
            "input_path": "/media/in/heat.mkv",
            "output_path": "/media/out/heat",
            "profile": "av1_8k",
        });

        // Act
        let response = app.oneshot(post_request("/jobs", &body)).await.unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_job_returns_400_for_relative_input() {
        // Arrange
        let (state, _dir) = test_state().await;
        let app = router().with_state(state);
        let body = json!({ "input_path": "heat.mkv", "output_path": "/media/out/heat", "profile": "mp4" });

        // Act
        let response = app.oneshot(post_request("/jobs", &body)).await.unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancel_pending_job_returns_202_and_cancels() {
        // Arrange
        let (state, _dir) = test_state().await;
        let app = router().with_state(state.clone());
        let id = create_pending_job(&app).await;

        // Act
        let response = app
            .oneshot(post_request(&format!("/jobs/{id}/cancel"), &json!({})))
            .await
            .unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = body_json(response).await;
        assert_eq!(json["action"], "cancel");
        let ctx = narwhal_core::context::Context::background();
        let job = state.transcodes.get_job(&ctx, Uuid::parse_str(&id).unwrap()).await.unwrap();
        assert_eq!(serde_json::to_value(&job).unwrap()["status"], "cancelled");
    }

    #[tokio::test]
    async fn test_retry_pending_job_returns_400() {
        // Arrange
        let (state, _dir) = test_state().await;
        let app = router().with_state(state);
        let id = create_pending_job(&app).await;

        // Act
        let response = app
            .oneshot(post_request(&format!("/jobs/{id}/retry"), &json!({})))
            .await
            .unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_start_unknown_job_returns_404() {
        // Arrange
        let (state, _dir) = test_state().await;
        let app = router().with_state(state);

        // Act
        let response = app
            .oneshot(post_request(&format!("/jobs/{}/start", Uuid::new_v4()), &json!({})))
            .await
            .unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_capabilities_lists_every_profile() {
        // Arrange
        let (state, _dir) = test_state().await;
        let app = router().with_state(state);

        // Act
        let response = app
            .oneshot(Request::builder().uri("/capabilities").body(Body::empty()).unwrap())
            .await
            .unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let profiles = json["profiles"].as_array().unwrap();
        assert_eq!(profiles.len(), 6);
        assert!(profiles.contains(&json!("webm")));
    }
}
