//! Route modules organized by component.

pub mod dlq;
pub mod health;
pub mod media;
pub mod sagas;
pub mod transcode;

use std::convert::Infallible;

use axum::Router;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use narwhal_core::context::Context;
use uuid::Uuid;

use crate::state::AppState;

/// Request header carrying the caller's correlation id.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Every route of the API.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .nest("/api/v1", media::router())
        .nest("/api/v1/sagas", sagas::router())
        .nest("/api/v1/transcode", transcode::router())
        .nest("/api/v1/dlq", dlq::router())
}

/// Operation context of one request.
///
/// Correlated by the `x-correlation-id` header when present, otherwise by a
/// fresh id.
#[derive(Debug, Clone)]
pub struct RequestContext(pub Context);

impl<S: Send + Sync> FromRequestParts<S> for RequestContext {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let correlation_id = parts
            .headers
            .get(CORRELATION_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_owned);
        Ok(Self(Context::background().with_correlation(correlation_id)))
    }
}
