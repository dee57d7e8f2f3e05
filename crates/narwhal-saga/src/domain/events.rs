//! Saga lifecycle events published on the `saga.>` stream.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregate type tag of saga envelopes.
pub const SAGA_AGGREGATE_TYPE: &str = "Saga";

/// Event type identifier for [`SagaStarted`].
pub const SAGA_STARTED_EVENT_TYPE: &str = "SagaStarted";

/// Event type identifier for [`SagaCompleted`].
pub const SAGA_COMPLETED_EVENT_TYPE: &str = "SagaCompleted";

/// Event type identifier for [`SagaCompensated`].
pub const SAGA_COMPENSATED_EVENT_TYPE: &str = "SagaCompensated";

/// Event type identifier for [`SagaFailed`].
pub const SAGA_FAILED_EVENT_TYPE: &str = "SagaFailed";

/// `SagaStep.<name>.completed`.
#[must_use]
pub fn step_completed_event_type(step: &str) -> String {
    format!("SagaStep.{step}.completed")
}

/// `SagaStep.<name>.compensated`.
#[must_use]
pub fn step_compensated_event_type(step: &str) -> String {
    format!("SagaStep.{step}.compensated")
}

/// Emitted once a saga is persisted and its execution scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStarted {
    /// The saga identifier.
    pub saga_id: Uuid,
    /// Definition name.
    pub saga_type: String,
    /// Initial data.
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// Emitted after a step executes or is compensated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStepRecorded {
    /// The saga identifier.
    pub saga_id: Uuid,
    /// Definition name.
    pub saga_type: String,
    /// Step name.
    pub step: String,
    /// Step index within the definition.
    pub step_index: usize,
}

/// Emitted when every step succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaCompleted {
    /// The saga identifier.
    pub saga_id: Uuid,
    /// Definition name.
    pub saga_type: String,
}

/// Emitted when compensation finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaCompensated {
    /// The saga identifier.
    pub saga_id: Uuid,
    /// Definition name.
    pub saga_type: String,
    /// The step failure that triggered compensation.
    pub error: String,
}

/// Emitted when a saga cannot be executed, e.g. its definition is gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFailed {
    /// The saga identifier.
    pub saga_id: Uuid,
    /// Definition name.
    pub saga_type: String,
    /// Why execution was abandoned.
    pub error: String,
}
