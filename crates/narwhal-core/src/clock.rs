//! Clock abstraction for determinism.

use chrono::{DateTime, Utc};

/// Abstraction over wall-clock time so timestamps are injectable in tests.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Returns the current time, or `floor` if the clock reads earlier.
    ///
    /// Aggregate `updated_at` stamps go through this so they never move
    /// backwards when the system clock is adjusted.
    fn now_not_before(&self, floor: DateTime<Utc>) -> DateTime<Utc> {
        self.now().max(floor)
    }
}

/// Production clock backed by [`Utc::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
