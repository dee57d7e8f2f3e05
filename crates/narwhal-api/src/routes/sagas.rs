//! Routes for saga inspection and manual starts.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Json, Router, routing::get};
use narwhal_saga::{Saga, SagaData, SagaState};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use super::RequestContext;
use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

/// Request body for POST /sagas.
#[derive(Debug, Deserialize)]
pub struct StartSagaRequest {
    /// Registered definition name.
    pub saga_type: String,
    /// Initial step input.
    #[serde(default)]
    pub data: SagaData,
}

/// Response body of POST /sagas.
#[derive(Debug, Serialize)]
pub struct StartSagaResponse {
    /// Identifier of the scheduled saga.
    pub saga_id: Uuid,
    /// State at scheduling time.
    pub state: SagaState,
}

/// Query string of GET /sagas.
#[derive(Debug, Deserialize)]
pub struct SagaFilter {
    /// Only sagas in this state.
    pub state: Option<SagaState>,
    /// Maximum number of sagas returned, newest first.
    pub limit: Option<usize>,
}

/// Response body of GET /sagas/types.
#[derive(Debug, Serialize)]
pub struct SagaTypesResponse {
    /// Registered definition names.
    pub saga_types: Vec<String>,
}

/// POST /sagas
#[instrument(skip(state, ctx, request), fields(saga_type = %request.saga_type))]
async fn start_saga(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Json(request): Json<StartSagaRequest>,
) -> Result<(StatusCode, Json<StartSagaResponse>), ApiError> {
    let handle = state.orchestrator.start_saga(&ctx, &request.saga_type, request.data).await?;
    info!(saga_id = %handle.id(), correlation_id = ctx.correlation_id(), "saga scheduled");
    let response = StartSagaResponse {
        saga_id: handle.id(),
        state: handle.saga.state,
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /sagas
#[instrument(skip(state, ctx))]
async fn list_sagas(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Query(filter): Query<SagaFilter>,
) -> Result<Json<Vec<Saga>>, ApiError> {
    let limit = filter.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    Ok(Json(state.orchestrator.store().list(&ctx, filter.state, limit).await?))
}

/// GET /sagas/types
async fn saga_types(State(state): State<AppState>) -> Json<SagaTypesResponse> {
    Json(SagaTypesResponse {
        saga_types: state.orchestrator.saga_types(),
    })
}

/// GET /sagas/{id}
#[instrument(skip(state, ctx), fields(%saga_id))]
async fn get_saga(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(saga_id): Path<Uuid>,
) -> Result<Json<Saga>, ApiError> {
    Ok(Json(state.orchestrator.get_saga(&ctx, saga_id).await?))
}

/// Returns the router for sagas.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_sagas).post(start_saga))
        .route("/types", get(saga_types))
        .route("/{id}", get(get_saga))
}
