//! Shared application state and service wiring.

use std::sync::Arc;
use std::time::Duration;

use narwhal_broker::{ConsumerGroup, ConsumerGroupHandle, EventPublisher, StreamBroker};
use narwhal_core::clock::Clock;
use narwhal_core::context::Context;
use narwhal_core::error::DomainError;
use narwhal_core::memory::{InMemoryUnitOfWork, MemoryAggregateStore, MemoryEventStore};
use narwhal_core::registry::EventRegistry;
use narwhal_download::{Download, DownloadManager, DownloadStores};
use narwhal_media::{CatalogStores, Episode, MediaCatalog, Movie, Series};
use narwhal_saga::{InMemorySagaStore, MediaProcessing, MediaProcessingTrigger, SagaOrchestrator, SagaStore};
use narwhal_store::PgDatabase;
use narwhal_transcode::{LocalStorage, TranscodeEngine, TranscodeJob, TranscodeSettings, TranscodeStores};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::NarwhalConfig;

/// Interval between outbox sweeps for events whose publish failed.
const OUTBOX_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Events republished per sweep.
const OUTBOX_SWEEP_BATCH: usize = 100;
/// Poll interval of the processing saga steps.
const SAGA_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Process-local stores under one unit of work and one event log.
#[derive(Debug, Clone)]
pub struct MemoryPersistence {
    uow: InMemoryUnitOfWork,
    events: Arc<MemoryEventStore>,
}

impl MemoryPersistence {
    fn new() -> Self {
        let uow = InMemoryUnitOfWork::new();
        let events = MemoryEventStore::new(&uow);
        Self { uow, events }
    }
}

/// Backing storage of every service.
#[derive(Debug, Clone)]
pub enum Persistence {
    /// Process-local stores.
    Memory(MemoryPersistence),
    /// `PostgreSQL` stores sharing one database.
    Postgres(PgDatabase),
}

impl Persistence {
    /// Fresh process-local storage.
    #[must_use]
    pub fn memory() -> Self {
        Self::Memory(MemoryPersistence::new())
    }

    fn catalog_stores(&self) -> CatalogStores {
        match self {
            Self::Memory(m) => CatalogStores {
                movies: MemoryAggregateStore::<Movie>::new(&m.uow),
                series: MemoryAggregateStore::<Series>::new(&m.uow),
                episodes: MemoryAggregateStore::<Episode>::new(&m.uow),
                events: m.events.clone(),
                uow: Arc::new(m.uow.clone()),
            },
            Self::Postgres(db) => CatalogStores {
                uow: db.unit_of_work(),
                movies: db.aggregates::<Movie>(),
                series: db.aggregates::<Series>(),
                episodes: db.aggregates::<Episode>(),
                events: db.event_store(),
            },
        }
    }

    fn download_stores(&self) -> DownloadStores {
        match self {
            Self::Memory(m) => DownloadStores {
                downloads: MemoryAggregateStore::<Download>::new(&m.uow),
                events: m.events.clone(),
                uow: Arc::new(m.uow.clone()),
            },
            Self::Postgres(db) => DownloadStores {
                uow: db.unit_of_work(),
                downloads: db.aggregates::<Download>(),
                events: db.event_store(),
            },
        }
    }

    fn transcode_stores(&self) -> TranscodeStores {
        match self {
            Self::Memory(m) => TranscodeStores {
                jobs: MemoryAggregateStore::<TranscodeJob>::new(&m.uow),
                events: m.events.clone(),
                uow: Arc::new(m.uow.clone()),
            },
            Self::Postgres(db) => TranscodeStores {
                uow: db.unit_of_work(),
                jobs: db.aggregates::<TranscodeJob>(),
                events: db.event_store(),
            },
        }
    }

    fn saga_store(&self) -> Arc<dyn SagaStore> {
        match self {
            Self::Memory(_) => Arc::new(InMemorySagaStore::new()),
            Self::Postgres(db) => db.sagas(),
        }
    }
}

/// Decoders for every event type a consumer may receive.
fn event_registry() -> EventRegistry {
    let mut registry = EventRegistry::new();
    narwhal_media::domain::events::register_events(&mut registry);
    narwhal_download::domain::events::register_events(&mut registry);
    narwhal_transcode::domain::events::register_events(&mut registry);
    registry
}

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Movies, series and episodes.
    pub catalog: Arc<MediaCatalog>,
    /// Source acquisition.
    pub downloads: Arc<DownloadManager>,
    /// Transcode jobs.
    pub transcodes: Arc<TranscodeEngine>,
    /// Saga execution.
    pub orchestrator: SagaOrchestrator,
    /// Integration event consumers and their dead letters.
    pub consumers: Arc<ConsumerGroup>,
    /// Event backbone.
    pub broker: Arc<dyn StreamBroker>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("orchestrator", &self.orchestrator)
            .field("consumers", &self.consumers)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Wires every service onto `persistence` and `broker`.
    ///
    /// The broker's streams must already exist.
    #[must_use]
    pub fn new(
        config: &NarwhalConfig,
        persistence: &Persistence,
        broker: Arc<dyn StreamBroker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let publisher = Arc::new(
            EventPublisher::new(Arc::clone(&broker), Arc::clone(&clock)).with_client_id(config.broker.client_id.clone()),
        );

        let catalog = Arc::new(MediaCatalog::new(
            persistence.catalog_stores(),
            publisher.clone(),
            Arc::clone(&clock),
        ));
        let downloads = Arc::new(DownloadManager::with_filesystem_engine(
            persistence.download_stores(),
            publisher.clone(),
            Arc::clone(&clock),
        ));
        let storage = Arc::new(LocalStorage::new(
            config.storage.root.clone(),
            config.storage.base_url.clone(),
        ));
        let settings = TranscodeSettings {
            ffmpeg_path: config.ffmpeg_path.clone(),
            ffprobe_path: config.ffprobe_path.clone(),
            max_retries: config.transcode_max_retries,
            ..TranscodeSettings::default()
        };
        let transcodes = Arc::new(TranscodeEngine::new(
            persistence.transcode_stores(),
            settings,
            Some(storage),
            publisher.clone(),
            Arc::clone(&clock),
        ));

        let orchestrator = SagaOrchestrator::new(persistence.saga_store(), publisher.clone(), Arc::clone(&clock));
        orchestrator.register(Arc::new(MediaProcessing::new(
            catalog.clone(),
            downloads.clone(),
            transcodes.clone(),
            SAGA_POLL_INTERVAL,
        )));

        let consumers = Arc::new(ConsumerGroup::new(
            config.consumer_group(),
            Arc::clone(&broker),
            publisher,
            Arc::new(event_registry()),
            clock,
        ));
        consumers.register(Arc::new(MediaProcessingTrigger::new(orchestrator.clone())));

        Self {
            catalog,
            downloads,
            transcodes,
            orchestrator,
            consumers,
            broker,
        }
    }

    /// Republishes committed events whose publish failed. Every service
    /// writes to the same event log, so one sweep covers them all.
    ///
    /// # Errors
    ///
    /// Returns the failure to read the event log.
    pub async fn sweep_outbox(&self, ctx: &Context) -> Result<usize, DomainError> {
        self.catalog.republish_unpublished(ctx, OUTBOX_SWEEP_BATCH).await
    }

    /// Starts consuming, restarts interrupted downloads and transcodes,
    /// resumes interrupted sagas and begins outbox sweeps.
    ///
    /// # Errors
    ///
    /// Returns the failure to create the durable consumers or to load
    /// interrupted work.
    pub async fn start(&self, ctx: &Context) -> Result<Background, DomainError> {
        let ctx = ctx.child();
        let consumers = self.consumers.start(&ctx).await?;
        let downloads = self.downloads.recover_interrupted(&ctx).await?;
        let transcodes = self.transcodes.recover_interrupted(&ctx).await?;
        if !downloads.is_empty() || !transcodes.is_empty() {
            info!(downloads = downloads.len(), transcodes = transcodes.len(), "restarted interrupted work");
        }
        let resumed = self.orchestrator.resume_incomplete(&ctx).await?;
        if !resumed.is_empty() {
            info!(count = resumed.len(), "resumed interrupted sagas");
        }

        let state = self.clone();
        let sweep_ctx = ctx.clone();
        let sweeper = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = sweep_ctx.cancelled() => break,
                    () = tokio::time::sleep(OUTBOX_SWEEP_INTERVAL) => {}
                }
                if let Err(err) = state.sweep_outbox(&sweep_ctx).await {
                    warn!(error = %err, "outbox sweep failed");
                }
            }
        });

        Ok(Background {
            ctx,
            consumers,
            sweeper,
        })
    }
}

/// Tasks running behind the HTTP server.
#[derive(Debug)]
pub struct Background {
    ctx: Context,
    consumers: ConsumerGroupHandle,
    sweeper: JoinHandle<()>,
}

impl Background {
    /// Stops consuming and sweeping, then stops running sagas, downloads
    /// and transcodes. Interrupted work resumes on the next start.
    pub async fn shutdown(self, state: &AppState) {
        self.ctx.cancel();
        self.consumers.shutdown().await;
        if let Err(err) = self.sweeper.await {
            warn!(error = %err, "outbox sweeper ended abnormally");
        }
        state.orchestrator.shutdown().await;
        state.downloads.shutdown();
        state.transcodes.shutdown();
        info!("background services stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use narwhal_broker::{MemoryBroker, default_streams, ensure_streams};
    use narwhal_core::ports::{DownloadKind, DownloadService};
    use narwhal_test_support::FixedClock;

    #[tokio::test]
    async fn test_outbox_sweep_republishes_download_events() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().into_owned();
        let config = NarwhalConfig::from_lookup(|key| (key == "STORAGE_ROOT").then(|| root.clone())).unwrap();
        let broker = Arc::new(MemoryBroker::new());
        let clock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap()));
        let state = AppState::new(&config, &Persistence::memory(), broker.clone(), clock);
        let ctx = Context::background();
        let created = state
            .downloads
            .create_download(&ctx, "file:///srv/heat.mkv", DownloadKind::Http, "/srv/incoming")
            .await
            .unwrap();
        ensure_streams(broker.as_ref(), default_streams()).await.unwrap();

        // Act
        let republished = state.sweep_outbox(&ctx).await.unwrap();
        let again = state.sweep_outbox(&ctx).await.unwrap();

        // Assert
        assert_eq!(republished, 1);
        assert_eq!(again, 0);
        let stored = broker.stream_messages("DOWNLOAD_EVENTS", None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].subject.ends_with("DownloadCreated"));
        assert!(String::from_utf8_lossy(&stored[0].payload).contains(&created.id.to_string()));
    }
}
