//! The download manager: persistence, engine selection and background transfers.
//!
//! Each started download runs on its own task under a child of the
//! manager's shutdown token. Mutations of one download are serialized by a
//! per-download lock held in the active map, so a cancel racing the
//! worker's final transition never loses an update.
//!
//! Shutdown stops transfers without cancelling their downloads;
//! [`DownloadManager::recover_interrupted`] requeues and restarts them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use narwhal_core::aggregate::AggregateRoot;
use narwhal_core::clock::Clock;
use narwhal_core::context::Context;
use narwhal_core::error::DomainError;
use narwhal_core::memory::{InMemoryUnitOfWork, MemoryAggregateStore, MemoryEventStore};
use narwhal_core::ports::{DownloadKind, DownloadService, DownloadSnapshot, DownloadStatus, IntegrationPublisher};
use narwhal_core::repository::{AggregateStore, EventStore, UnitOfWork, stored_events_of};
use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::engine::{DownloadEngine, FetchProgress, FetchRequest, Fetched, FilesystemEngine};
use crate::domain::aggregates::Download;
use crate::error::DownloadError;

/// Capacity of the per-download progress channel.
const PROGRESS_CAPACITY: usize = 16;

/// Minimum spacing between persisted progress samples.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Persistence the manager runs against.
#[derive(Clone)]
pub struct DownloadStores {
    /// Unit of work shared by both stores.
    pub uow: Arc<dyn UnitOfWork>,
    /// Download documents.
    pub downloads: Arc<dyn AggregateStore<Download>>,
    /// Domain event log.
    pub events: Arc<dyn EventStore>,
}

impl DownloadStores {
    /// In-memory stores enlisted in one in-memory unit of work.
    #[must_use]
    pub fn in_memory() -> Self {
        let uow = InMemoryUnitOfWork::new();
        Self {
            downloads: MemoryAggregateStore::<Download>::new(&uow),
            events: MemoryEventStore::new(&uow),
            uow: Arc::new(uow),
        }
    }
}

impl std::fmt::Debug for DownloadStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadStores").finish_non_exhaustive()
    }
}

#[derive(Clone)]
struct ActiveDownload {
    token: CancellationToken,
    writes: Arc<Mutex<()>>,
}

struct Inner {
    stores: DownloadStores,
    engines: Vec<Arc<dyn DownloadEngine>>,
    publisher: Arc<dyn IntegrationPublisher>,
    clock: Arc<dyn Clock>,
    active: RwLock<HashMap<Uuid, ActiveDownload>>,
    shutdown: CancellationToken,
}

/// Registers, runs and tracks downloads.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("engines", &self.inner.engines.iter().map(|e| e.name().to_owned()).collect::<Vec<_>>())
            .field("active", &self.inner.active.read().len())
            .finish_non_exhaustive()
    }
}

impl DownloadManager {
    /// Creates a manager with the given engines, consulted in order.
    #[must_use]
    pub fn new(
        stores: DownloadStores,
        engines: Vec<Arc<dyn DownloadEngine>>,
        publisher: Arc<dyn IntegrationPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                stores,
                engines,
                publisher,
                clock,
                active: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// A manager with only the filesystem engine.
    #[must_use]
    pub fn with_filesystem_engine(
        stores: DownloadStores,
        publisher: Arc<dyn IntegrationPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(stores, vec![Arc::new(FilesystemEngine)], publisher, clock)
    }

    /// Number of transfers currently running.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.active.read().len()
    }

    /// Stops every running transfer; their downloads stay in progress.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Requeues and restarts downloads left in progress by an earlier
    /// shutdown. Returns the restarted download ids.
    ///
    /// # Errors
    ///
    /// Store errors. A download that fails to restart is logged and skipped.
    pub async fn recover_interrupted(&self, ctx: &Context) -> Result<Vec<Uuid>, DomainError> {
        let interrupted: Vec<Download> = self
            .inner
            .stores
            .downloads
            .find_all(ctx)
            .await?
            .into_iter()
            .filter(|download| download.status() == DownloadStatus::Downloading)
            .filter(|download| !self.inner.active.read().contains_key(&download.aggregate_id()))
            .collect();
        let mut restarted = Vec::with_capacity(interrupted.len());
        for mut download in interrupted {
            let download_id = download.aggregate_id();
            download.requeue(ctx, self.inner.clock.as_ref())?;
            self.inner.persist(ctx, &mut download).await?;
            match self.start_download(ctx, download_id).await {
                Ok(()) => {
                    info!(%download_id, "interrupted download restarted");
                    restarted.push(download_id);
                }
                Err(err) => warn!(%download_id, error = %err, "interrupted download not restarted"),
            }
        }
        Ok(restarted)
    }
}

impl Inner {
    fn engine_for(&self, url: &str, kind: DownloadKind) -> Result<Arc<dyn DownloadEngine>, DownloadError> {
        self.engines
            .iter()
            .find(|engine| engine.supports(url, kind))
            .cloned()
            .ok_or_else(|| DownloadError::NoEngine {
                url: url.to_owned(),
                kind,
            })
    }

    async fn load(&self, ctx: &Context, id: Uuid) -> Result<Download, DomainError> {
        self.stores
            .downloads
            .find_by_id(ctx, id)
            .await?
            .ok_or_else(|| DomainError::not_found("Download", id))
    }

    async fn persist(&self, ctx: &Context, download: &mut Download) -> Result<(), DomainError> {
        let stored = stored_events_of(download);
        let tx = self.stores.uow.begin(ctx).await?;
        let staged: Result<(), DomainError> = async {
            self.stores.downloads.save(tx.context(), download).await?;
            self.stores.events.save(tx.context(), &stored).await
        }
        .await;
        if let Err(err) = staged {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "rollback failed");
            }
            return Err(err);
        }
        tx.commit().await?;
        download.take_uncommitted_events();

        for event in &stored {
            match self.publisher.publish(ctx, event.to_envelope()).await {
                Ok(_) => {
                    if let Err(err) = self.stores.events.mark_published(ctx, event.event_id, self.clock.now()).await {
                        warn!(event_id = %event.event_id, error = %err, "failed to mark event published");
                    }
                }
                Err(err) => warn!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    download_id = %event.aggregate_id,
                    error = %err,
                    "integration publish failed after commit"
                ),
            }
        }
        Ok(())
    }

    async fn run(
        self: Arc<Self>,
        download_id: Uuid,
        request: FetchRequest,
        engine: Arc<dyn DownloadEngine>,
        active: ActiveDownload,
        correlation_id: String,
    ) {
        let ctx = Context::with_token(active.token.clone()).with_correlation(correlation_id.clone());
        let store_ctx = Context::background().with_correlation(correlation_id);
        let (tx, mut rx) = mpsc::channel(PROGRESS_CAPACITY);

        let fetch = engine.fetch(&ctx, &request, tx);
        tokio::pin!(fetch);
        let mut last_persisted: Option<Instant> = None;
        let result = loop {
            tokio::select! {
                result = &mut fetch => break result,
                Some(sample) = rx.recv() => {
                    if last_persisted.is_none_or(|at| at.elapsed() >= PROGRESS_INTERVAL) {
                        self.record_progress(&store_ctx, download_id, sample, &active).await;
                        last_persisted = Some(Instant::now());
                    }
                }
            }
        };

        self.finish(&store_ctx, download_id, result, &active).await;
        self.active.write().remove(&download_id);
    }

    async fn record_progress(&self, ctx: &Context, download_id: Uuid, sample: FetchProgress, active: &ActiveDownload) {
        let _writes = active.writes.lock().await;
        let outcome: Result<(), DomainError> = async {
            let mut download = self.load(ctx, download_id).await?;
            if download.status().is_terminal() {
                return Ok(());
            }
            download.record_progress(self.clock.as_ref(), sample.bytes, sample.total)?;
            self.persist(ctx, &mut download).await
        }
        .await;
        if let Err(err) = outcome {
            debug!(%download_id, error = %err, "progress not persisted");
        }
    }

    async fn finish(
        &self,
        ctx: &Context,
        download_id: Uuid,
        result: Result<Fetched, DomainError>,
        active: &ActiveDownload,
    ) {
        let _writes = active.writes.lock().await;
        let outcome: Result<(), DomainError> = async {
            let mut download = self.load(ctx, download_id).await?;
            if download.status().is_terminal() {
                return Ok(());
            }
            let clock = self.clock.as_ref();
            match &result {
                Err(_) if self.shutdown.is_cancelled() => {
                    info!(%download_id, "download interrupted by shutdown");
                    return Ok(());
                }
                Ok(fetched) => {
                    download.complete(ctx, clock, &fetched.path.to_string_lossy(), fetched.bytes)?;
                    info!(%download_id, path = %fetched.path.display(), bytes = fetched.bytes, "download completed");
                }
                Err(DomainError::Cancelled) => {
                    download.cancel(ctx, clock);
                    info!(%download_id, "download cancelled");
                }
                Err(err) => {
                    download.fail(ctx, clock, &err.to_string())?;
                    error!(%download_id, error = %err, "download failed");
                }
            }
            self.persist(ctx, &mut download).await
        }
        .await;
        if let Err(err) = outcome {
            error!(%download_id, error = %err, "final download state not persisted");
        }
    }
}

#[async_trait]
impl DownloadService for DownloadManager {
    async fn create_download(
        &self,
        ctx: &Context,
        url: &str,
        kind: DownloadKind,
        target_path: &str,
    ) -> Result<DownloadSnapshot, DomainError> {
        self.inner.engine_for(url, kind)?;
        let mut download = Download::create(ctx, self.inner.clock.as_ref(), url, kind, target_path)?;
        self.inner.persist(ctx, &mut download).await?;
        info!(
            download_id = %download.aggregate_id(),
            kind = kind.as_str(),
            correlation_id = ctx.correlation_id(),
            "download created"
        );
        Ok(download.snapshot())
    }

    async fn start_download(&self, ctx: &Context, download_id: Uuid) -> Result<(), DomainError> {
        if self.inner.active.read().contains_key(&download_id) {
            return Err(DomainError::Validation(format!("download {download_id} is already running")));
        }
        let mut download = self.inner.load(ctx, download_id).await?;
        let engine = self.inner.engine_for(download.url(), download.kind())?;
        download.start(ctx, self.inner.clock.as_ref(), engine.name())?;
        self.inner.persist(ctx, &mut download).await?;

        let active = ActiveDownload {
            token: self.inner.shutdown.child_token(),
            writes: Arc::new(Mutex::new(())),
        };
        self.inner.active.write().insert(download_id, active.clone());
        let request = FetchRequest {
            url: download.url().to_owned(),
            kind: download.kind(),
            target_dir: PathBuf::from(download.target_path()),
        };
        info!(%download_id, engine = engine.name(), "download started");
        tokio::spawn(Arc::clone(&self.inner).run(
            download_id,
            request,
            engine,
            active,
            ctx.correlation_id().to_owned(),
        ));
        Ok(())
    }

    async fn cancel_download(&self, ctx: &Context, download_id: Uuid) -> Result<(), DomainError> {
        let active = self.inner.active.read().get(&download_id).cloned();
        let _writes = match &active {
            Some(active) => {
                active.token.cancel();
                Some(active.writes.lock().await)
            }
            None => None,
        };
        let mut download = self.inner.load(ctx, download_id).await?;
        if download.cancel(ctx, self.inner.clock.as_ref()) {
            self.inner.persist(ctx, &mut download).await?;
            info!(%download_id, "download cancelled");
        } else {
            debug!(%download_id, status = download.status_tag(), "cancel of terminal download ignored");
        }
        Ok(())
    }

    async fn get_download(&self, ctx: &Context, download_id: Uuid) -> Result<DownloadSnapshot, DomainError> {
        Ok(self.inner.load(ctx, download_id).await?.snapshot())
    }
}
