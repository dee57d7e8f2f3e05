//! The saga instance and its data mapping.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use narwhal_core::error::DomainError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SagaError;

/// Step input and output carried by a saga.
pub type SagaData = serde_json::Map<String, Value>;

/// Documented data keys shared by the media processing steps.
pub mod keys {
    /// Id of the movie or episode being processed.
    pub const MEDIA_ID: &str = "media_id";
    /// `movie` or `episode`.
    pub const MEDIA_TYPE: &str = "media_type";
    /// Source URL handed to the download collaborator.
    pub const DOWNLOAD_URL: &str = "download_url";
    /// Directory downloads are written to.
    pub const TARGET_PATH: &str = "target_path";
    /// Directory transcode output is written to.
    pub const OUTPUT_PATH: &str = "output_path";
    /// Transcode profile tag.
    pub const TRANSCODE_PROFILE: &str = "transcode_profile";
    /// Set once the download exists.
    pub const DOWNLOAD_ID: &str = "download_id";
    /// Set once the transcode job exists.
    pub const TRANSCODE_JOB_ID: &str = "transcode_job_id";
    /// Set once the download completed.
    pub const DOWNLOADED_PATH: &str = "downloaded_path";
    /// Set once the transcode completed.
    pub const TRANSCODED_PATH: &str = "transcoded_path";
}

/// Lifecycle state of a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    /// Persisted, execution not yet begun.
    Pending,
    /// Steps are executing.
    Running,
    /// A step failed; completed steps are being undone.
    Compensating,
    /// Every step succeeded.
    Completed,
    /// Compensation ran after a failure.
    Compensated,
    /// The saga cannot be executed at all.
    Failed,
}

impl SagaState {
    /// Wire/tag form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Compensating => "compensating",
            Self::Completed => "completed",
            Self::Compensated => "compensated",
            Self::Failed => "failed",
        }
    }

    /// Whether the saga will not be resumed.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Compensated | Self::Failed)
    }

    /// States picked up by recovery.
    pub const INCOMPLETE: [Self; 3] = [Self::Pending, Self::Running, Self::Compensating];
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SagaState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "compensating" => Ok(Self::Compensating),
            "completed" => Ok(Self::Completed),
            "compensated" => Ok(Self::Compensated),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::Validation(format!("unknown saga state: {other}"))),
        }
    }
}

/// One execution of a saga definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Saga {
    /// Saga identifier.
    pub id: Uuid,
    /// Registered definition name.
    pub saga_type: String,
    /// Lifecycle state.
    pub state: SagaState,
    /// Index of the step executing or being compensated.
    pub current_step: usize,
    /// Step input and output.
    pub data: SagaData,
    /// Names of the steps that succeeded, in order.
    pub completed_steps: Vec<String>,
    /// Error that triggered compensation.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last persisted change.
    pub updated_at: DateTime<Utc>,
    /// When the first step began.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the saga completed or failed.
    pub completed_at: Option<DateTime<Utc>>,
    /// When compensation finished.
    #[serde(default)]
    pub compensated_at: Option<DateTime<Utc>>,
}

impl Saga {
    /// A pending saga at step 0.
    #[must_use]
    pub fn new(saga_type: impl Into<String>, data: SagaData, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            saga_type: saga_type.into(),
            state: SagaState::Pending,
            current_step: 0,
            data,
            completed_steps: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            compensated_at: None,
        }
    }

    /// Moves `updated_at` forward.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now.max(self.updated_at);
    }

    /// Enters a terminal state and stamps `compensated_at` or
    /// `completed_at`.
    pub fn finish(&mut self, state: SagaState, now: DateTime<Utc>) {
        self.state = state;
        self.touch(now);
        if state == SagaState::Compensated {
            self.compensated_at = Some(self.updated_at);
        } else {
            self.completed_at = Some(self.updated_at);
        }
    }

    /// Records the first entry into `running`; later calls keep the
    /// original time.
    pub fn mark_started(&mut self, now: DateTime<Utc>) {
        self.state = SagaState::Running;
        self.started_at.get_or_insert(now);
    }

    /// Whether the saga will not be resumed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Stores `value` under `key`.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.data.insert(key.to_owned(), value.into());
    }

    /// The string under `key`, if present.
    ///
    /// # Errors
    ///
    /// Returns `SagaError::InvalidData` if the value is not a string.
    pub fn optional_str(&self, key: &'static str) -> Result<Option<&str>, SagaError> {
        match self.data.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) => Ok(Some(value)),
            Some(other) => Err(SagaError::InvalidData {
                key,
                reason: format!("expected a string, found {other}"),
            }),
        }
    }

    /// The non-empty string under `key`.
    ///
    /// # Errors
    ///
    /// Returns `SagaError::MissingData` if the key is absent or empty and
    /// `SagaError::InvalidData` if it is not a string.
    pub fn require_str(&self, key: &'static str) -> Result<&str, SagaError> {
        match self.optional_str(key)? {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(SagaError::MissingData(key)),
        }
    }

    /// The UUID under `key`, if present.
    ///
    /// # Errors
    ///
    /// Returns `SagaError::InvalidData` if the value is not a UUID string.
    pub fn optional_uuid(&self, key: &'static str) -> Result<Option<Uuid>, SagaError> {
        self.optional_str(key)?
            .map(|value| {
                Uuid::parse_str(value).map_err(|e| SagaError::InvalidData {
                    key,
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    /// The UUID under `key`.
    ///
    /// # Errors
    ///
    /// Returns `SagaError::MissingData` or `SagaError::InvalidData`.
    pub fn require_uuid(&self, key: &'static str) -> Result<Uuid, SagaError> {
        self.optional_uuid(key)?.ok_or(SagaError::MissingData(key))
    }
}
