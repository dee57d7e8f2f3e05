//! Aggregate root abstraction.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::DomainError;
use crate::event::DomainEvent;

/// Identity, version and timestamps shared by every aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    /// Aggregate identifier.
    pub id: Uuid,
    /// Monotonic version, incremented on every mutation.
    pub version: i64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Version last read from or written to the store.
    #[serde(skip)]
    persisted_version: i64,
}

impl AggregateState {
    /// State for a new, never-persisted aggregate at version 0.
    #[must_use]
    pub fn new(id: Uuid, clock: &dyn Clock) -> Self {
        let now = clock.now();
        Self {
            id,
            version: 0,
            created_at: now,
            updated_at: now,
            persisted_version: 0,
        }
    }

    /// Records a mutation: bumps the version and advances `updated_at`.
    ///
    /// Returns the new version.
    pub fn touch(&mut self, clock: &dyn Clock) -> i64 {
        self.version += 1;
        self.updated_at = clock.now_not_before(self.updated_at);
        self.version
    }

    /// The version the store is expected to hold.
    #[must_use]
    pub fn persisted_version(&self) -> i64 {
        self.persisted_version
    }

    /// Marks the current version as persisted.
    pub fn mark_persisted(&mut self) {
        self.persisted_version = self.version;
    }
}

/// Trait for aggregate roots whose state is persisted as a document and
/// whose mutations emit domain events.
pub trait AggregateRoot: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The event type this aggregate produces.
    type Event: DomainEvent + Clone;

    /// Aggregate type tag used in events and subjects.
    const AGGREGATE_TYPE: &'static str;

    /// Shared identity/version state.
    fn state(&self) -> &AggregateState;

    /// Mutable shared state.
    fn state_mut(&mut self) -> &mut AggregateState;

    /// Checks every invariant of the aggregate.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` describing the first violation.
    fn validate(&self) -> Result<(), DomainError>;

    /// Status tag, for finders and logs.
    fn status_tag(&self) -> &'static str;

    /// Returns uncommitted events produced by command handling.
    fn uncommitted_events(&self) -> &[Self::Event];

    /// Drains uncommitted events after persistence.
    fn take_uncommitted_events(&mut self) -> Vec<Self::Event>;

    /// Returns the aggregate identifier.
    fn aggregate_id(&self) -> Uuid {
        self.state().id
    }

    /// Returns the current version.
    fn version(&self) -> i64 {
        self.state().version
    }
}
