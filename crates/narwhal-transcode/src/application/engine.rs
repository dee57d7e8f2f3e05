//! The transcoding engine: job persistence and `ffmpeg` supervision.
//!
//! A started job runs on its own task. The task probes the input, spawns
//! `ffmpeg` with `-progress pipe:1`, parses its stdout into a bounded
//! progress channel and lets a monitor task persist the latest sample at
//! a fixed interval. Cancellation kills the process. Writes to one job are
//! serialized by a per-job lock so the monitor, a cancel request and the
//! final transition never interleave.
//!
//! Engine shutdown kills running processes but leaves their jobs running
//! in the store. [`TranscodeEngine::recover_interrupted`] requeues and
//! restarts such jobs on the next start.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use narwhal_core::aggregate::AggregateRoot;
use narwhal_core::clock::Clock;
use narwhal_core::context::Context;
use narwhal_core::error::DomainError;
use narwhal_core::memory::{InMemoryUnitOfWork, MemoryAggregateStore, MemoryEventStore};
use narwhal_core::ports::{IntegrationPublisher, TranscodeService, TranscodeState, TranscodeStatus};
use narwhal_core::repository::{AggregateStore, EventStore, UnitOfWork, stored_events_of};
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{Mutex, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::aggregates::{JobProgress, JobResult, MediaProbe, TranscodeJob};
use crate::domain::profile::{Capabilities, EncodingOptions, JobOptions, TranscodeProfile};
use crate::error::TranscodeError;
use crate::playlist::write_master_playlist;
use crate::storage::{LocalStorage, tree_size};
use crate::tools::args::FfmpegPlan;
use crate::tools::probe::{PROBE_TIMEOUT, Prober};
use crate::tools::progress::ProgressParser;

/// Capacity of the per-run progress channel.
const PROGRESS_CAPACITY: usize = 10;

/// Time allowed for stdout to drain after the process exits.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Longest stderr tail kept in failure reasons.
const STDERR_TAIL: usize = 2000;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct TranscodeSettings {
    /// `ffmpeg` executable.
    pub ffmpeg_path: PathBuf,
    /// `ffprobe` executable.
    pub ffprobe_path: PathBuf,
    /// Time allowed for one probe.
    pub probe_timeout: Duration,
    /// Default retry budget of new jobs.
    pub max_retries: u32,
    /// Spacing of persisted progress samples.
    pub progress_interval: Duration,
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            probe_timeout: PROBE_TIMEOUT,
            max_retries: 3,
            progress_interval: Duration::from_secs(1),
        }
    }
}

/// Persistence the engine runs against.
#[derive(Clone)]
pub struct TranscodeStores {
    /// Unit of work shared by both stores.
    pub uow: Arc<dyn UnitOfWork>,
    /// Job documents.
    pub jobs: Arc<dyn AggregateStore<TranscodeJob>>,
    /// Domain event log.
    pub events: Arc<dyn EventStore>,
}

impl TranscodeStores {
    /// In-memory stores enlisted in one in-memory unit of work.
    #[must_use]
    pub fn in_memory() -> Self {
        let uow = InMemoryUnitOfWork::new();
        Self {
            jobs: MemoryAggregateStore::<TranscodeJob>::new(&uow),
            events: MemoryEventStore::new(&uow),
            uow: Arc::new(uow),
        }
    }
}

impl std::fmt::Debug for TranscodeStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeStores").finish_non_exhaustive()
    }
}

#[derive(Clone)]
struct ActiveJob {
    token: CancellationToken,
    writes: Arc<Mutex<()>>,
}

struct RunSpec {
    input: PathBuf,
    output: PathBuf,
    profile: TranscodeProfile,
    options: EncodingOptions,
}

struct RunOutcome {
    plan: FfmpegPlan,
    probe: MediaProbe,
}

struct Inner {
    stores: TranscodeStores,
    settings: TranscodeSettings,
    prober: Prober,
    storage: Option<Arc<LocalStorage>>,
    capabilities: Capabilities,
    publisher: Arc<dyn IntegrationPublisher>,
    clock: Arc<dyn Clock>,
    active: RwLock<HashMap<Uuid, ActiveJob>>,
    shutdown: CancellationToken,
}

/// Creates, runs and tracks transcode jobs.
#[derive(Clone)]
pub struct TranscodeEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TranscodeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeEngine")
            .field("settings", &self.inner.settings)
            .field("active", &self.inner.active.read().len())
            .finish_non_exhaustive()
    }
}

impl TranscodeEngine {
    /// Creates an engine. Outputs below the storage root get storage URLs.
    #[must_use]
    pub fn new(
        stores: TranscodeStores,
        settings: TranscodeSettings,
        storage: Option<Arc<LocalStorage>>,
        publisher: Arc<dyn IntegrationPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let prober = Prober::new(settings.ffprobe_path.clone(), settings.probe_timeout);
        Self {
            inner: Arc::new(Inner {
                stores,
                settings,
                prober,
                storage,
                capabilities: Capabilities::default(),
                publisher,
                clock,
                active: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// What the engine can produce.
    #[must_use]
    pub fn capabilities(&self) -> &Capabilities {
        &self.inner.capabilities
    }

    /// Number of runs in flight.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.active.read().len()
    }

    /// Cancels every run in flight.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Creates a pending job.
    ///
    /// # Errors
    ///
    /// `UnsupportedProfile` for profiles outside the capabilities,
    /// `DomainError::Validation` for empty or relative paths, and store
    /// errors.
    pub async fn create_job(
        &self,
        ctx: &Context,
        input_path: &str,
        output_path: &str,
        profile: &str,
        options: &JobOptions,
    ) -> Result<TranscodeJob, DomainError> {
        let profile: TranscodeProfile = profile.parse()?;
        if !self.inner.capabilities.profiles.contains(&profile) {
            return Err(TranscodeError::UnsupportedProfile(profile.to_string()).into());
        }
        let mut job = TranscodeJob::create(
            ctx,
            self.inner.clock.as_ref(),
            input_path,
            output_path,
            profile,
            EncodingOptions::resolve(profile, options),
            self.inner.settings.max_retries,
        )?;
        self.inner.persist(ctx, &mut job).await?;
        info!(
            job_id = %job.aggregate_id(),
            profile = %profile,
            correlation_id = ctx.correlation_id(),
            "transcode job created"
        );
        Ok(job)
    }

    /// Starts a pending job in the background and returns immediately.
    ///
    /// # Errors
    ///
    /// `InvalidJobStatus` unless the job is pending, `NotFound` for unknown
    /// jobs.
    pub async fn start_job(&self, ctx: &Context, job_id: Uuid) -> Result<(), DomainError> {
        if self.inner.active.read().contains_key(&job_id) {
            return Err(DomainError::Validation(format!("transcode job {job_id} is already running")));
        }
        let mut job = self.inner.load(ctx, job_id).await?;
        job.start(ctx, self.inner.clock.as_ref())?;
        self.inner.persist(ctx, &mut job).await?;

        let active = ActiveJob {
            token: self.inner.shutdown.child_token(),
            writes: Arc::new(Mutex::new(())),
        };
        self.inner.active.write().insert(job_id, active.clone());
        let spec = RunSpec {
            input: PathBuf::from(job.input_path()),
            output: PathBuf::from(job.output_path()),
            profile: job.profile(),
            options: job.options().clone(),
        };
        info!(%job_id, attempt = job.retry_count(), "transcode job started");
        tokio::spawn(Arc::clone(&self.inner).run(job_id, spec, active, ctx.correlation_id().to_owned()));
        Ok(())
    }

    /// Cancels a job, killing its process. Cancelling a terminal job is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown jobs and store errors.
    pub async fn cancel_job(&self, ctx: &Context, job_id: Uuid) -> Result<(), DomainError> {
        let active = self.inner.active.read().get(&job_id).cloned();
        let _writes = match &active {
            Some(active) => {
                active.token.cancel();
                Some(active.writes.lock().await)
            }
            None => None,
        };
        let mut job = self.inner.load(ctx, job_id).await?;
        if job.cancel(ctx, self.inner.clock.as_ref()) {
            self.inner.persist(ctx, &mut job).await?;
            info!(%job_id, "transcode job cancelled");
        } else {
            debug!(%job_id, status = job.status_tag(), "cancel of terminal job ignored");
        }
        Ok(())
    }

    /// Requeues and restarts running jobs left without a process by an
    /// earlier shutdown. Returns the restarted job ids.
    ///
    /// # Errors
    ///
    /// Store errors. A job that fails to restart is logged and skipped.
    pub async fn recover_interrupted(&self, ctx: &Context) -> Result<Vec<Uuid>, DomainError> {
        let interrupted: Vec<TranscodeJob> = self
            .inner
            .stores
            .jobs
            .find_all(ctx)
            .await?
            .into_iter()
            .filter(|job| job.status() == TranscodeState::Running)
            .filter(|job| !self.inner.active.read().contains_key(&job.aggregate_id()))
            .collect();
        let mut restarted = Vec::with_capacity(interrupted.len());
        for mut job in interrupted {
            let job_id = job.aggregate_id();
            job.requeue(ctx, self.inner.clock.as_ref())?;
            self.inner.persist(ctx, &mut job).await?;
            match self.start_job(ctx, job_id).await {
                Ok(()) => {
                    info!(%job_id, "interrupted transcode job restarted");
                    restarted.push(job_id);
                }
                Err(err) => warn!(%job_id, error = %err, "interrupted transcode job not restarted"),
            }
        }
        Ok(restarted)
    }

    /// Re-queues a failed job and starts it.
    ///
    /// # Errors
    ///
    /// `InvalidJobStatus` unless the job failed, `MaxRetriesExceeded` once
    /// its budget is used.
    pub async fn retry_job(&self, ctx: &Context, job_id: Uuid) -> Result<(), DomainError> {
        let mut job = self.inner.load(ctx, job_id).await?;
        job.retry(ctx, self.inner.clock.as_ref())?;
        self.inner.persist(ctx, &mut job).await?;
        info!(%job_id, retry_count = job.retry_count(), "transcode job retried");
        self.start_job(ctx, job_id).await
    }

    /// Loads a job.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown jobs.
    pub async fn get_job(&self, ctx: &Context, job_id: Uuid) -> Result<TranscodeJob, DomainError> {
        self.inner.load(ctx, job_id).await
    }

    /// Every job, oldest first.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn list_jobs(&self, ctx: &Context) -> Result<Vec<TranscodeJob>, DomainError> {
        let mut jobs = self.inner.stores.jobs.find_all(ctx).await?;
        jobs.sort_by_key(|job| job.state().created_at);
        Ok(jobs)
    }
}

fn stderr_tail(text: &str) -> String {
    let text = text.trim();
    if text.len() <= STDERR_TAIL {
        return text.to_owned();
    }
    let start = (text.len() - STDERR_TAIL..text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(text.len());
    text[start..].to_owned()
}

impl Inner {
    async fn load(&self, ctx: &Context, id: Uuid) -> Result<TranscodeJob, DomainError> {
        self.stores
            .jobs
            .find_by_id(ctx, id)
            .await?
            .ok_or_else(|| DomainError::not_found("TranscodeJob", id))
    }

    async fn persist(&self, ctx: &Context, job: &mut TranscodeJob) -> Result<(), DomainError> {
        let stored = stored_events_of(job);
        let tx = self.stores.uow.begin(ctx).await?;
        let staged: Result<(), DomainError> = async {
            self.stores.jobs.save(tx.context(), job).await?;
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
        job.take_uncommitted_events();

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
                    job_id = %event.aggregate_id,
                    error = %err,
                    "integration publish failed after commit"
                ),
            }
        }
        Ok(())
    }

    async fn run(self: Arc<Self>, job_id: Uuid, spec: RunSpec, active: ActiveJob, correlation_id: String) {
        let ctx = Context::with_token(active.token.clone()).with_correlation(correlation_id.clone());
        let store_ctx = Context::background().with_correlation(correlation_id);
        let started = Instant::now();

        let outcome = self.execute(&ctx, &store_ctx, job_id, &spec, &active).await;
        self.finish(&store_ctx, job_id, outcome, started.elapsed(), &active).await;
        self.active.write().remove(&job_id);
    }

    async fn execute(
        self: &Arc<Self>,
        ctx: &Context,
        store_ctx: &Context,
        job_id: Uuid,
        spec: &RunSpec,
        active: &ActiveJob,
    ) -> Result<RunOutcome, TranscodeError> {
        let probe = self.prober.probe(ctx, &spec.input).await?;
        debug!(%job_id, width = probe.width, height = probe.height, duration = probe.duration_seconds, "input probed");
        self.record_probe(store_ctx, job_id, &probe, active).await;
        let plan = FfmpegPlan::build(&spec.input, &spec.output, spec.profile, &spec.options, &probe);
        tokio::fs::create_dir_all(&plan.output_dir).await?;
        for index in 0..plan.variants.len() {
            tokio::fs::create_dir_all(plan.output_dir.join(format!("variant_{index}"))).await?;
        }

        let ffmpeg = &self.settings.ffmpeg_path;
        let mut child = Command::new(ffmpeg)
            .args(&plan.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TranscodeError::ToolUnavailable {
                tool: ffmpeg.display().to_string(),
                reason: e.to_string(),
            })?;
        debug!(%job_id, pid = child.id(), "ffmpeg spawned");

        let (tx, rx) = mpsc::channel::<JobProgress>(PROGRESS_CAPACITY);
        let stdout = child.stdout.take();
        let mut parser = ProgressParser::new(probe.duration_seconds);
        let mut reader = tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Some(sample) = parser.feed(&line) else { continue };
                if tx.try_send(sample).is_err() {
                    warn!(%job_id, percent = sample.percent, "progress sample dropped");
                }
            }
        });
        let stderr = child.stderr.take();
        let collector = tokio::spawn(async move {
            let mut text = String::new();
            let Some(mut stderr) = stderr else { return text };
            if let Err(err) = stderr.read_to_string(&mut text).await {
                debug!(error = %err, "stderr not fully read");
            }
            text
        });
        let monitor = tokio::spawn(Arc::clone(self).monitor(store_ctx.clone(), job_id, rx, active.clone()));

        let exit = tokio::select! {
            status = child.wait() => Some(status),
            () = ctx.cancelled() => None,
        };
        let Some(status) = exit else {
            if let Err(err) = child.kill().await {
                warn!(%job_id, error = %err, "failed to kill ffmpeg");
            }
            reader.abort();
            collector.abort();
            if let Err(err) = monitor.await {
                warn!(%job_id, error = %err, "progress monitor ended abnormally");
            }
            return Err(TranscodeError::JobCancelled);
        };
        let status = status?;

        if tokio::time::timeout(READER_GRACE, &mut reader).await.is_err() {
            reader.abort();
        }
        if let Err(err) = monitor.await {
            warn!(%job_id, error = %err, "progress monitor ended abnormally");
        }
        let stderr = collector.await.unwrap_or_default();

        if !status.success() {
            return Err(TranscodeError::ProcessFailed {
                exit_code: status.code(),
                stderr: stderr_tail(&stderr),
            });
        }
        if spec.profile.is_hls() {
            write_master_playlist(&plan.output_dir, &plan.variants).await?;
        }
        Ok(RunOutcome { plan, probe })
    }

    async fn monitor(self: Arc<Self>, ctx: Context, job_id: Uuid, mut rx: mpsc::Receiver<JobProgress>, active: ActiveJob) {
        let mut ticker = tokio::time::interval(self.settings.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut open = true;
        while open {
            ticker.tick().await;
            let mut latest = None;
            loop {
                match rx.try_recv() {
                    Ok(sample) => latest = Some(sample),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        open = false;
                        break;
                    }
                }
            }
            if let Some(sample) = latest {
                self.record_progress(&ctx, job_id, sample, &active).await;
            }
        }
    }

    async fn record_probe(&self, ctx: &Context, job_id: Uuid, probe: &MediaProbe, active: &ActiveJob) {
        let _writes = active.writes.lock().await;
        let outcome: Result<(), DomainError> = async {
            let mut job = self.load(ctx, job_id).await?;
            if job.status().is_terminal() {
                return Ok(());
            }
            job.record_probe(self.clock.as_ref(), probe.clone())?;
            self.persist(ctx, &mut job).await
        }
        .await;
        if let Err(err) = outcome {
            debug!(%job_id, error = %err, "probe not persisted");
        }
    }

    async fn record_progress(&self, ctx: &Context, job_id: Uuid, sample: JobProgress, active: &ActiveJob) {
        let _writes = active.writes.lock().await;
        let outcome: Result<(), DomainError> = async {
            let mut job = self.load(ctx, job_id).await?;
            if job.status().is_terminal() {
                return Ok(());
            }
            if job.record_progress(ctx, self.clock.as_ref(), sample)? {
                self.persist(ctx, &mut job).await?;
            }
            Ok(())
        }
        .await;
        if let Err(err) = outcome {
            debug!(%job_id, error = %err, "progress not persisted");
        }
    }

    async fn finish(
        &self,
        ctx: &Context,
        job_id: Uuid,
        outcome: Result<RunOutcome, TranscodeError>,
        elapsed: Duration,
        active: &ActiveJob,
    ) {
        let _writes = active.writes.lock().await;
        let persisted: Result<(), DomainError> = async {
            let mut job = self.load(ctx, job_id).await?;
            if job.status().is_terminal() {
                return Ok(());
            }
            let clock = self.clock.as_ref();
            match outcome {
                Err(_) if self.shutdown.is_cancelled() => {
                    info!(%job_id, "transcode run interrupted by shutdown");
                    return Ok(());
                }
                Ok(RunOutcome { plan, probe }) => {
                    let measured = if plan.variants.is_empty() {
                        plan.playable.clone()
                    } else {
                        plan.output_dir.clone()
                    };
                    let output_bytes = tokio::task::spawn_blocking(move || tree_size(&measured))
                        .await
                        .unwrap_or_default();
                    let url = match &self.storage {
                        Some(storage) => storage.url_for_path(&plan.playable),
                        None => format!("file://{}", plan.playable.display()),
                    };
                    let result = JobResult {
                        output_path: plan.playable.to_string_lossy().into_owned(),
                        url,
                        duration_seconds: probe.duration_seconds,
                        elapsed_seconds: elapsed.as_secs_f64(),
                        variant_count: plan.variants.len(),
                        output_bytes,
                    };
                    info!(
                        %job_id,
                        output = %result.output_path,
                        variants = result.variant_count,
                        bytes = result.output_bytes,
                        "transcode job completed"
                    );
                    job.complete(ctx, clock, result)?;
                }
                Err(TranscodeError::JobCancelled) => {
                    job.cancel(ctx, clock);
                    info!(%job_id, "transcode run cancelled");
                }
                Err(err) => {
                    error!(%job_id, error = %err, "transcode job failed");
                    job.fail(ctx, clock, &err.to_string())?;
                }
            }
            self.persist(ctx, &mut job).await
        }
        .await;
        if let Err(err) = persisted {
            error!(%job_id, error = %err, "final job state not persisted");
        }
    }
}

#[async_trait]
impl TranscodeService for TranscodeEngine {
    async fn start_transcode(
        &self,
        ctx: &Context,
        input_path: &str,
        output_path: &str,
        profile: &str,
    ) -> Result<Uuid, DomainError> {
        let job = self
            .create_job(ctx, input_path, output_path, profile, &JobOptions::default())
            .await?;
        let job_id = job.aggregate_id();
        self.start_job(ctx, job_id).await?;
        Ok(job_id)
    }

    async fn resume_transcode(&self, ctx: &Context, job_id: Uuid) -> Result<(), DomainError> {
        if self.inner.active.read().contains_key(&job_id) {
            return Ok(());
        }
        match self.get_job(ctx, job_id).await?.status() {
            TranscodeState::Pending => self.start_job(ctx, job_id).await,
            _ => Ok(()),
        }
    }

    async fn cancel_transcode(&self, ctx: &Context, job_id: Uuid) -> Result<(), DomainError> {
        self.cancel_job(ctx, job_id).await
    }

    async fn job_status(&self, ctx: &Context, job_id: Uuid) -> Result<TranscodeStatus, DomainError> {
        Ok(self.get_job(ctx, job_id).await?.snapshot())
    }
}
