//! Narwhal API: HTTP surface and process wiring of the media processing
//! backbone.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use narwhal_broker::{MemoryBroker, StreamBroker, default_streams, ensure_streams};
    use narwhal_test_support::FixedClock;
    use tempfile::TempDir;

    use crate::config::NarwhalConfig;
    use crate::state::{AppState, Persistence};

    /// In-memory state whose storage root lives as long as the returned dir.
    pub(crate) async fn test_state() -> (AppState, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().into_owned();
        let config = NarwhalConfig::from_lookup(|key| (key == "STORAGE_ROOT").then(|| root.clone())).unwrap();
        let broker: Arc<dyn StreamBroker> = Arc::new(MemoryBroker::new());
        ensure_streams(broker.as_ref(), default_streams()).await.unwrap();
        let clock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap()));
        let state = AppState::new(&config, &Persistence::memory(), broker, clock);
        (state, dir)
    }
}
