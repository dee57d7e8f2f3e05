//! Narwhal API — error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use narwhal_broker::BrokerError;
use narwhal_core::error::{DomainError, ErrorKind};
use narwhal_store::StoreError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Startup and runtime errors for the API server.
#[derive(Debug, Error)]
pub enum AppError {
    /// A required environment variable is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database connection or migration error.
    #[error("database error: {0}")]
    Store(#[from] StoreError),

    /// The event backbone could not be reached or prepared.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// A service failed while booting.
    #[error("startup error: {0}")]
    Domain(#[from] DomainError),

    /// The tracing pipeline could not be installed.
    #[error("telemetry error: {0}")]
    Telemetry(String),

    /// Network binding or I/O error.
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

/// JSON body returned for error responses.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code.
    pub error: &'static str,
    /// Human-readable error message.
    pub message: String,
}

/// HTTP-layer wrapper around `DomainError` that implements `IntoResponse`.
#[derive(Debug)]
pub struct ApiError(pub DomainError);

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        Self(err)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Validation | ErrorKind::Decode => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict | ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::ExternalProcess => StatusCode::BAD_GATEWAY,
        ErrorKind::Infrastructure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            error!(error = %self.0, kind = kind.code(), "request failed");
        }

        let body = ErrorBody {
            error: kind.code(),
            message: self.0.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn status_of(err: DomainError) -> StatusCode {
        let response = ApiError(err).into_response();
        response.status()
    }

    #[test]
    fn test_not_found_maps_to_404() {
        assert_eq!(status_of(DomainError::not_found("Movie", Uuid::new_v4())), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_concurrent_modification_maps_to_409() {
        assert_eq!(
            status_of(DomainError::ConcurrentModification {
                aggregate_id: Uuid::new_v4(),
                expected: 1,
                actual: 2,
            }),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_validation_maps_to_400() {
        assert_eq!(status_of(DomainError::Validation("bad input".into())), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_transient_maps_to_503() {
        assert_eq!(status_of(DomainError::Transient("pool timed out".into())), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_external_process_maps_to_502() {
        assert_eq!(
            status_of(DomainError::ExternalProcess {
                exit_code: Some(1),
                stderr: "Invalid data found".into(),
            }),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_cancelled_maps_to_409() {
        assert_eq!(status_of(DomainError::Cancelled), StatusCode::CONFLICT);
    }

    #[test]
    fn test_infrastructure_maps_to_500() {
        assert_eq!(status_of(DomainError::Infrastructure("db down".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
