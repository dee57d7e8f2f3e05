//! Routes for inspecting dead-lettered messages.

use axum::extract::State;
use axum::{Json, Router, routing::get};
use chrono::{DateTime, Utc};
use narwhal_broker::DeadLetterRecord;
use narwhal_core::error::DomainError;
use serde::Serialize;
use tracing::instrument;

use crate::error::ApiError;
use crate::state::AppState;

/// One dead letter as shown to operators.
#[derive(Debug, Serialize)]
pub struct DeadLetterView {
    /// Subject the message was originally published on.
    pub original_subject: String,
    /// Original body, lossily decoded as UTF-8.
    pub original_payload: String,
    /// The final handling error.
    pub error: String,
    /// Deliveries made before dead-lettering.
    pub num_delivered: u32,
    /// Stream the message came from.
    pub stream: String,
    /// Sequence in that stream.
    pub stream_sequence: u64,
    /// Consumer group that gave up.
    pub consumer: String,
    /// When the record was written.
    pub failed_at: DateTime<Utc>,
}

impl From<DeadLetterRecord> for DeadLetterView {
    fn from(record: DeadLetterRecord) -> Self {
        Self {
            original_subject: record.original_subject,
            original_payload: String::from_utf8_lossy(&record.original_payload).into_owned(),
            error: record.error,
            num_delivered: record.num_delivered,
            stream: record.stream,
            stream_sequence: record.stream_sequence,
            consumer: record.consumer,
            failed_at: record.failed_at,
        }
    }
}

/// GET /dlq
#[instrument(skip(state))]
async fn list_dead_letters(State(state): State<AppState>) -> Result<Json<Vec<DeadLetterView>>, ApiError> {
    let records = state
        .consumers
        .dead_letters()
        .list()
        .await
        .map_err(DomainError::from)?;
    Ok(Json(records.into_iter().map(DeadLetterView::from).collect()))
}

/// Returns the router for dead letters.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_dead_letters))
}
