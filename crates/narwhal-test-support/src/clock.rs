//! Deterministic clocks.

use chrono::{DateTime, Duration, Utc};
use narwhal_core::clock::Clock;
use parking_lot::Mutex;

/// A clock that always returns a fixed point in time.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// A clock that advances by a fixed step on every reading.
#[derive(Debug)]
pub struct TickingClock {
    next: Mutex<DateTime<Utc>>,
    step: Duration,
}

impl TickingClock {
    /// Starts at `start`, advancing `step` per call to `now`.
    #[must_use]
    pub fn new(start: DateTime<Utc>, step: Duration) -> Self {
        Self {
            next: Mutex::new(start),
            step,
        }
    }
}

impl Clock for TickingClock {
    fn now(&self) -> DateTime<Utc> {
        let mut next = self.next.lock();
        let now = *next;
        *next = now + self.step;
        now
    }
}
