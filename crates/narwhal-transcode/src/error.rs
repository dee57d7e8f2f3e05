//! Transcoding errors.

use narwhal_core::error::DomainError;
use narwhal_core::ports::TranscodeState;
use thiserror::Error;
use uuid::Uuid;

/// Failures specific to transcoding.
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// The profile is not in the engine's capabilities.
    #[error("unsupported transcode profile: {0}")]
    UnsupportedProfile(String),

    /// The requested transition is not allowed from the current state.
    #[error("invalid job status transition {from:?} -> {to:?}")]
    InvalidJobStatus {
        /// Current state.
        from: TranscodeState,
        /// Requested state.
        to: TranscodeState,
    },

    /// The input could not be probed.
    #[error("probe failed: {0}")]
    ProbeFailed(String),

    /// The probe did not answer in time.
    #[error("probe timed out after {0} s")]
    ProbeTimeout(u64),

    /// The run was cancelled.
    #[error("job cancelled")]
    JobCancelled,

    /// The job has used its retry budget.
    #[error("job {job_id} exceeded its {max_retries} retries")]
    MaxRetriesExceeded {
        /// The job.
        job_id: Uuid,
        /// Configured budget.
        max_retries: u32,
    },

    /// `ffmpeg` exited unsuccessfully.
    #[error("ffmpeg exited with {exit_code:?}: {stderr}")]
    ProcessFailed {
        /// Exit status when the process was not killed by a signal.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// A required tool could not be executed.
    #[error("{tool} unavailable: {reason}")]
    ToolUnavailable {
        /// Tool path.
        tool: String,
        /// Failure description.
        reason: String,
    },

    /// Storage key escapes the storage root.
    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    /// Filesystem failure.
    #[error("transcode i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TranscodeError> for DomainError {
    fn from(err: TranscodeError) -> Self {
        match err {
            TranscodeError::UnsupportedProfile(_)
            | TranscodeError::InvalidJobStatus { .. }
            | TranscodeError::MaxRetriesExceeded { .. }
            | TranscodeError::InvalidKey(_) => DomainError::Validation(err.to_string()),
            TranscodeError::ProbeTimeout(_) => DomainError::Transient(err.to_string()),
            TranscodeError::ProbeFailed(reason) => DomainError::ExternalProcess {
                exit_code: None,
                stderr: reason,
            },
            TranscodeError::ProcessFailed { exit_code, stderr } => DomainError::ExternalProcess { exit_code, stderr },
            TranscodeError::JobCancelled => DomainError::Cancelled,
            TranscodeError::ToolUnavailable { .. } | TranscodeError::Io(_) => {
                DomainError::Infrastructure(err.to_string())
            }
        }
    }
}
