//! Download errors.

use narwhal_core::error::DomainError;
use narwhal_core::ports::{DownloadKind, DownloadStatus};
use thiserror::Error;

/// Failures specific to downloads.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// No registered engine handles the URL.
    #[error("no download engine supports {kind:?} url {url}")]
    NoEngine {
        /// Source URL.
        url: String,
        /// Detected kind.
        kind: DownloadKind,
    },

    /// The requested transition is not allowed from the current status.
    #[error("invalid download transition {from:?} -> {to:?}")]
    InvalidStatus {
        /// Current status.
        from: DownloadStatus,
        /// Requested status.
        to: DownloadStatus,
    },

    /// The source could not be read or the target written.
    #[error("download i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DownloadError> for DomainError {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::NoEngine { .. } | DownloadError::InvalidStatus { .. } => {
                DomainError::Validation(err.to_string())
            }
            DownloadError::Io(_) => DomainError::Infrastructure(err.to_string()),
        }
    }
}
