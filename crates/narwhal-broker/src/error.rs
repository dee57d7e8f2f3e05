//! Broker error types.

use std::time::Duration;

use narwhal_core::error::DomainError;
use thiserror::Error;

/// Failures of the event backbone.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The broker did not acknowledge a publish in time.
    #[error("publish to {subject} not acknowledged within {timeout:?}")]
    PublishTimeout {
        /// Subject of the timed-out publish.
        subject: String,
        /// The acknowledgement bound.
        timeout: Duration,
    },

    /// No stream captures the subject.
    #[error("no stream accepts subject {0}")]
    NoStreamForSubject(String),

    /// The named stream does not exist.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// The named consumer does not exist on the stream.
    #[error("consumer {consumer} not found on stream {stream}")]
    ConsumerNotFound {
        /// Stream name.
        stream: String,
        /// Durable consumer name.
        consumer: String,
    },

    /// A stream with the same name exists with overlapping but different subjects.
    #[error("stream {stream} subjects overlap with {other}")]
    SubjectOverlap {
        /// New stream.
        stream: String,
        /// Existing stream.
        other: String,
    },

    /// An invalid subject or configuration.
    #[error("invalid broker request: {0}")]
    Invalid(String),

    /// The stream is at its limit and rejects new messages.
    #[error("stream {0} is full")]
    StreamFull(String),

    /// The operation was cancelled by its context.
    #[error("broker operation cancelled")]
    Cancelled,

    /// The connection could not be established or was lost.
    #[error("broker connection failed: {0}")]
    Connection(String),
}

impl From<BrokerError> for DomainError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Cancelled => Self::Cancelled,
            BrokerError::PublishTimeout { .. }
            | BrokerError::Connection(_)
            | BrokerError::StreamFull(_) => {
                Self::Transient(err.to_string())
            }
            BrokerError::Invalid(_) | BrokerError::SubjectOverlap { .. } => {
                Self::Validation(err.to_string())
            }
            BrokerError::NoStreamForSubject(_)
            | BrokerError::StreamNotFound(_)
            | BrokerError::ConsumerNotFound { .. } => Self::Infrastructure(err.to_string()),
        }
    }
}
