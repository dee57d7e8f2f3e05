//! Domain error types.

use thiserror::Error;
use uuid::Uuid;

/// Coarse classification of every failure surfaced by the backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invariant failure on an aggregate or step input.
    Validation,
    /// Missing aggregate, saga or job.
    NotFound,
    /// Duplicate or optimistic-version mismatch.
    Conflict,
    /// Broker timeout, database deadlock, probe timeout.
    Transient,
    /// An external tool exited unsuccessfully.
    ExternalProcess,
    /// The operation context was cancelled.
    Cancelled,
    /// Undecodable payload or programming error.
    Decode,
    /// Any other infrastructure failure.
    Infrastructure,
}

impl ErrorKind {
    /// Machine-readable code used in API responses and dead-letter records.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Transient => "transient_error",
            Self::ExternalProcess => "external_process_error",
            Self::Cancelled => "cancelled",
            Self::Decode => "decode_error",
            Self::Infrastructure => "infrastructure_error",
        }
    }
}

/// Top-level domain error type.
#[derive(Debug, Clone, Error)]
pub enum DomainError {
    /// An aggregate, saga or job was not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity that was looked up.
        entity: &'static str,
        /// The identifier that was looked up.
        id: Uuid,
    },

    /// Optimistic concurrency conflict.
    #[error("concurrent modification of aggregate {aggregate_id}: expected version {expected}, found {actual}")]
    ConcurrentModification {
        /// The aggregate that had the conflict.
        aggregate_id: Uuid,
        /// The version the writer loaded.
        expected: i64,
        /// The version currently stored.
        actual: i64,
    },

    /// A uniqueness or state conflict other than a version mismatch.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A validation error in domain logic.
    #[error("validation error: {0}")]
    Validation(String),

    /// A transient infrastructure failure worth retrying.
    #[error("transient error: {0}")]
    Transient(String),

    /// An external process exited unsuccessfully.
    #[error("external process failed with exit code {exit_code:?}: {stderr}")]
    ExternalProcess {
        /// Exit code, absent when the process was killed by a signal.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// The operation was cancelled through its context.
    #[error("operation cancelled")]
    Cancelled,

    /// A payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl DomainError {
    /// Shorthand for [`DomainError::NotFound`].
    #[must_use]
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    /// Returns the taxonomy kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::ConcurrentModification { .. } | Self::Conflict(_) => ErrorKind::Conflict,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Transient(_) => ErrorKind::Transient,
            Self::ExternalProcess { .. } => ErrorKind::ExternalProcess,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Infrastructure(_) => ErrorKind::Infrastructure,
        }
    }

    /// Whether a retry policy may attempt the failed operation again.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Infrastructure(_))
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_modification_is_a_conflict() {
        let err = DomainError::ConcurrentModification {
            aggregate_id: Uuid::new_v4(),
            expected: 3,
            actual: 4,
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_only_transient_and_infrastructure_are_retriable() {
        assert!(DomainError::Transient("timeout".into()).is_retriable());
        assert!(DomainError::Infrastructure("db down".into()).is_retriable());
        assert!(!DomainError::Validation("bad".into()).is_retriable());
        assert!(!DomainError::Decode("bad json".into()).is_retriable());
        assert!(!DomainError::Cancelled.is_retriable());
    }

    #[test]
    fn test_not_found_message_names_entity() {
        let id = Uuid::new_v4();
        let err = DomainError::not_found("saga", id);
        assert_eq!(err.to_string(), format!("saga not found: {id}"));
        assert_eq!(err.kind().code(), "not_found");
    }
}
