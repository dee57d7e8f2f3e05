//! Saga errors.

use narwhal_core::error::DomainError;
use thiserror::Error;

/// Failures specific to sagas and their steps.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No definition is registered for the saga type.
    #[error("unknown saga type: {0}")]
    UnknownSagaType(String),

    /// A step needs a data key the saga does not carry.
    #[error("saga data is missing key {0}")]
    MissingData(&'static str),

    /// A data key holds a value of the wrong shape.
    #[error("saga data key {key} is invalid: {reason}")]
    InvalidData {
        /// The offending key.
        key: &'static str,
        /// What was wrong with the value.
        reason: String,
    },

    /// The media type cannot be processed.
    #[error("media type {0} cannot be processed")]
    UnsupportedMediaType(String),

    /// The download finished without producing a file.
    #[error("download did not complete: {0}")]
    DownloadFailed(String),

    /// The transcode job finished without producing output.
    #[error("transcode did not complete: {0}")]
    TranscodeFailed(String),
}

impl From<SagaError> for DomainError {
    fn from(err: SagaError) -> Self {
        match err {
            SagaError::UnknownSagaType(_)
            | SagaError::MissingData(_)
            | SagaError::InvalidData { .. }
            | SagaError::UnsupportedMediaType(_) => DomainError::Validation(err.to_string()),
            SagaError::DownloadFailed(reason) | SagaError::TranscodeFailed(reason) => {
                DomainError::ExternalProcess {
                    exit_code: None,
                    stderr: reason,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use narwhal_core::error::ErrorKind;

    #[test]
    fn test_data_errors_are_validation_failures() {
        let missing: DomainError = SagaError::MissingData("media_id").into();
        let unknown: DomainError = SagaError::UnknownSagaType("Backup".into()).into();

        assert_eq!(missing.kind(), ErrorKind::Validation);
        assert!(missing.to_string().contains("media_id"));
        assert_eq!(unknown.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_collaborator_failures_keep_reason() {
        let err: DomainError = SagaError::TranscodeFailed("Conversion failed!".into()).into();

        assert!(matches!(err, DomainError::ExternalProcess { exit_code: None, ref stderr } if stderr == "Conversion failed!"));
    }
}
