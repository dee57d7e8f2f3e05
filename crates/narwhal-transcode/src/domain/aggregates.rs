//! The `TranscodeJob` aggregate.

use std::path::Path;

use chrono::{DateTime, Utc};
use narwhal_core::aggregate::{AggregateRoot, AggregateState};
use narwhal_core::clock::Clock;
use narwhal_core::context::Context;
use narwhal_core::error::DomainError;
use narwhal_core::event::EventMetadata;
use narwhal_core::ports::{TranscodeState, TranscodeStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{
    BOUNDED_CONTEXT, TranscodeEvent, TranscodeEventKind, TranscodeJobCancelled, TranscodeJobCompleted,
    TranscodeJobCreated, TranscodeJobFailed, TranscodeJobProgress, TranscodeJobRequeued, TranscodeJobRetried, TranscodeJobStarted,
};
use super::profile::{EncodingOptions, TranscodeProfile};
use crate::error::TranscodeError;

/// Progress of the current run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Completion in `[0, 100]`.
    pub percent: f64,
    /// Media time encoded so far (s).
    pub current_seconds: f64,
    /// Input duration (s).
    pub total_seconds: f64,
    /// Encoding speed relative to real time.
    pub speed: Option<f64>,
    /// Estimated seconds remaining.
    pub eta_seconds: Option<f64>,
    /// Frames encoded per second.
    #[serde(default)]
    pub fps: Option<f64>,
    /// Output bitrate (kb/s).
    #[serde(default)]
    pub bitrate_kbps: Option<f64>,
}

/// Stream layout of an input file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaProbe {
    /// Width of the first video stream.
    pub width: u32,
    /// Height of the first video stream.
    pub height: u32,
    /// Container duration (s).
    pub duration_seconds: f64,
    /// Codec of the first video stream.
    pub video_codec: Option<String>,
    /// Codec of the first audio stream.
    pub audio_codec: Option<String>,
    /// Container bitrate (b/s).
    pub bit_rate: Option<u64>,
    /// Frame rate of the first video stream.
    #[serde(default)]
    pub frame_rate: Option<f64>,
}

impl MediaProbe {
    /// Whether the input carries audio.
    #[must_use]
    pub fn has_audio(&self) -> bool {
        self.audio_codec.is_some()
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// Master playlist or output file.
    pub output_path: String,
    /// Public URL of the output.
    pub url: String,
    /// Media duration (s).
    pub duration_seconds: f64,
    /// Wall-clock run time (s).
    pub elapsed_seconds: f64,
    /// Number of HLS variants, 0 for single-file outputs.
    pub variant_count: usize,
    /// Total bytes written.
    pub output_bytes: u64,
}

/// One transcode request and the state of its latest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeJob {
    #[serde(flatten)]
    state: AggregateState,
    input_path: String,
    output_path: String,
    profile: TranscodeProfile,
    options: EncodingOptions,
    status: TranscodeState,
    progress: JobProgress,
    retry_count: u32,
    max_retries: u32,
    error: Option<String>,
    result: Option<JobResult>,
    #[serde(default)]
    probe: Option<MediaProbe>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    uncommitted_events: Vec<TranscodeEvent>,
}

fn require_absolute(label: &str, path: &str) -> Result<(), DomainError> {
    if path.trim().is_empty() {
        return Err(DomainError::Validation(format!("{label} must not be empty")));
    }
    if !Path::new(path).is_absolute() {
        return Err(DomainError::Validation(format!("{label} must be absolute: {path}")));
    }
    Ok(())
}

impl TranscodeJob {
    /// Creates a pending job and records `TranscodeJobCreated`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if either path is empty or relative.
    pub fn create(
        ctx: &Context,
        clock: &dyn Clock,
        input_path: &str,
        output_path: &str,
        profile: TranscodeProfile,
        options: EncodingOptions,
        max_retries: u32,
    ) -> Result<Self, DomainError> {
        require_absolute("input path", input_path)?;
        require_absolute("output path", output_path)?;
        let mut job = Self {
            state: AggregateState::new(Uuid::new_v4(), clock),
            input_path: input_path.to_owned(),
            output_path: output_path.to_owned(),
            profile,
            options,
            status: TranscodeState::Pending,
            progress: JobProgress::default(),
            retry_count: 0,
            max_retries,
            error: None,
            result: None,
            probe: None,
            started_at: None,
            completed_at: None,
            uncommitted_events: Vec::new(),
        };
        let kind = TranscodeEventKind::TranscodeJobCreated(TranscodeJobCreated {
            job_id: job.state.id,
            input_path: job.input_path.clone(),
            output_path: job.output_path.clone(),
            profile,
        });
        job.record(ctx, clock, kind);
        Ok(job)
    }

    fn record(&mut self, ctx: &Context, clock: &dyn Clock, kind: TranscodeEventKind) {
        let version = self.state.touch(clock);
        let metadata = EventMetadata::new(
            kind.event_type(),
            Self::AGGREGATE_TYPE,
            self.state.id,
            version,
            BOUNDED_CONTEXT,
            ctx,
            self.state.updated_at,
        );
        self.uncommitted_events.push(TranscodeEvent { metadata, kind });
    }

    fn transition(&mut self, to: TranscodeState) -> Result<(), TranscodeError> {
        let legal = matches!(
            (self.status, to),
            (TranscodeState::Pending, TranscodeState::Running)
                | (TranscodeState::Running, TranscodeState::Completed)
                | (
                    TranscodeState::Pending | TranscodeState::Running,
                    TranscodeState::Failed | TranscodeState::Cancelled
                )
                | (TranscodeState::Failed, TranscodeState::Pending)
        );
        if !legal {
            return Err(TranscodeError::InvalidJobStatus { from: self.status, to });
        }
        self.status = to;
        Ok(())
    }

    /// Source media.
    #[must_use]
    pub fn input_path(&self) -> &str {
        &self.input_path
    }

    /// Output directory (HLS) or file.
    #[must_use]
    pub fn output_path(&self) -> &str {
        &self.output_path
    }

    /// Requested profile.
    #[must_use]
    pub fn profile(&self) -> TranscodeProfile {
        self.profile
    }

    /// Resolved encoding parameters.
    #[must_use]
    pub fn options(&self) -> &EncodingOptions {
        &self.options
    }

    /// Lifecycle state.
    #[must_use]
    pub fn status(&self) -> TranscodeState {
        self.status
    }

    /// Progress of the current run.
    #[must_use]
    pub fn progress(&self) -> JobProgress {
        self.progress
    }

    /// Retries used so far.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Retry budget.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Failure reason of the latest run.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Outcome of a completed run.
    #[must_use]
    pub fn result(&self) -> Option<&JobResult> {
        self.result.as_ref()
    }

    /// Input layout found by the latest probe.
    #[must_use]
    pub fn probe(&self) -> Option<&MediaProbe> {
        self.probe.as_ref()
    }

    /// Starts a run and records `TranscodeJobStarted`.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidJobStatus` unless the job is pending.
    pub fn start(&mut self, ctx: &Context, clock: &dyn Clock) -> Result<(), DomainError> {
        self.transition(TranscodeState::Running)?;
        self.progress = JobProgress::default();
        self.started_at = Some(clock.now());
        let kind = TranscodeEventKind::TranscodeJobStarted(TranscodeJobStarted {
            job_id: self.state.id,
            attempt: self.retry_count,
        });
        self.record(ctx, clock, kind);
        Ok(())
    }

    /// Stores the probed input layout of the current run.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidJobStatus` unless the job is running.
    pub fn record_probe(&mut self, clock: &dyn Clock, probe: MediaProbe) -> Result<(), DomainError> {
        self.require_running()?;
        self.probe = Some(probe);
        self.state.touch(clock);
        Ok(())
    }

    fn require_running(&self) -> Result<(), TranscodeError> {
        if self.status != TranscodeState::Running {
            return Err(TranscodeError::InvalidJobStatus {
                from: self.status,
                to: TranscodeState::Running,
            });
        }
        Ok(())
    }

    /// Applies a progress sample. Percent is clamped to `[0, 100]` and never
    /// decreases within a run; a sample lowering it or repeating the
    /// current progress is ignored. Returns whether a `TranscodeJobProgress`
    /// event was recorded.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidJobStatus` unless the job is running.
    pub fn record_progress(&mut self, ctx: &Context, clock: &dyn Clock, sample: JobProgress) -> Result<bool, DomainError> {
        self.require_running()?;
        let percent = sample.percent.clamp(0.0, 100.0);
        if percent < self.progress.percent {
            return Ok(false);
        }
        let progress = JobProgress { percent, ..sample };
        if progress == self.progress {
            return Ok(false);
        }
        self.progress = progress;
        let kind = TranscodeEventKind::TranscodeJobProgress(TranscodeJobProgress {
            job_id: self.state.id,
            percent,
            current_seconds: sample.current_seconds,
            speed: sample.speed,
            eta_seconds: sample.eta_seconds,
            fps: sample.fps,
            bitrate_kbps: sample.bitrate_kbps,
        });
        self.record(ctx, clock, kind);
        Ok(true)
    }

    /// Marks the run complete and records `TranscodeJobCompleted`.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidJobStatus` unless the job is running.
    pub fn complete(&mut self, ctx: &Context, clock: &dyn Clock, result: JobResult) -> Result<(), DomainError> {
        self.transition(TranscodeState::Completed)?;
        self.progress.percent = 100.0;
        self.progress.eta_seconds = Some(0.0);
        self.completed_at = Some(clock.now());
        let kind = TranscodeEventKind::TranscodeJobCompleted(TranscodeJobCompleted {
            job_id: self.state.id,
            output_path: result.output_path.clone(),
            url: result.url.clone(),
            duration_seconds: result.duration_seconds,
            elapsed_seconds: result.elapsed_seconds,
            variant_count: result.variant_count,
            output_bytes: result.output_bytes,
        });
        self.result = Some(result);
        self.record(ctx, clock, kind);
        Ok(())
    }

    /// Marks the run failed and records `TranscodeJobFailed`.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidJobStatus` if the job is already terminal.
    pub fn fail(&mut self, ctx: &Context, clock: &dyn Clock, reason: &str) -> Result<(), DomainError> {
        self.transition(TranscodeState::Failed)?;
        self.error = Some(reason.to_owned());
        self.completed_at = Some(clock.now());
        let kind = TranscodeEventKind::TranscodeJobFailed(TranscodeJobFailed {
            job_id: self.state.id,
            error: reason.to_owned(),
            retriable: self.retry_count < self.max_retries,
        });
        self.record(ctx, clock, kind);
        Ok(())
    }

    /// Returns a running job whose run was interrupted to pending, keeping
    /// its retry budget, and records `TranscodeJobRequeued`.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidJobStatus` unless the job is running.
    pub fn requeue(&mut self, ctx: &Context, clock: &dyn Clock) -> Result<(), DomainError> {
        if self.status != TranscodeState::Running {
            return Err(TranscodeError::InvalidJobStatus {
                from: self.status,
                to: TranscodeState::Pending,
            }
            .into());
        }
        self.status = TranscodeState::Pending;
        self.progress = JobProgress::default();
        self.started_at = None;
        let kind = TranscodeEventKind::TranscodeJobRequeued(TranscodeJobRequeued {
            job_id: self.state.id,
            attempt: self.retry_count,
        });
        self.record(ctx, clock, kind);
        Ok(())
    }

    /// Cancels the job. Returns `false` if it was already terminal.
    pub fn cancel(&mut self, ctx: &Context, clock: &dyn Clock) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TranscodeState::Cancelled;
        self.completed_at = Some(clock.now());
        let kind = TranscodeEventKind::TranscodeJobCancelled(TranscodeJobCancelled { job_id: self.state.id });
        self.record(ctx, clock, kind);
        true
    }

    /// Returns a failed job to pending for another run.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidJobStatus` unless the job failed, or with
    /// `MaxRetriesExceeded` once the budget is used.
    pub fn retry(&mut self, ctx: &Context, clock: &dyn Clock) -> Result<(), DomainError> {
        if self.status != TranscodeState::Failed {
            return Err(TranscodeError::InvalidJobStatus {
                from: self.status,
                to: TranscodeState::Pending,
            }
            .into());
        }
        if self.retry_count >= self.max_retries {
            return Err(TranscodeError::MaxRetriesExceeded {
                job_id: self.state.id,
                max_retries: self.max_retries,
            }
            .into());
        }
        self.transition(TranscodeState::Pending)?;
        self.retry_count += 1;
        self.error = None;
        self.result = None;
        self.progress = JobProgress::default();
        self.started_at = None;
        self.completed_at = None;
        let kind = TranscodeEventKind::TranscodeJobRetried(TranscodeJobRetried {
            job_id: self.state.id,
            retry_count: self.retry_count,
        });
        self.record(ctx, clock, kind);
        Ok(())
    }

    /// Read model handed to collaborators.
    #[must_use]
    pub fn snapshot(&self) -> TranscodeStatus {
        TranscodeStatus {
            job_id: self.state.id,
            state: self.status,
            percent: self.progress.percent,
            output_path: self.result.as_ref().map(|r| r.output_path.clone()),
            error: self.error.clone(),
        }
    }
}

impl AggregateRoot for TranscodeJob {
    type Event = TranscodeEvent;
    const AGGREGATE_TYPE: &'static str = "TranscodeJob";

    fn state(&self) -> &AggregateState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut AggregateState {
        &mut self.state
    }

    fn validate(&self) -> Result<(), DomainError> {
        if !(0.0..=100.0).contains(&self.progress.percent) {
            return Err(DomainError::Validation("progress must be within [0, 100]".into()));
        }
        if self.retry_count > self.max_retries {
            return Err(DomainError::Validation("retry count exceeds the retry budget".into()));
        }
        Ok(())
    }

    fn status_tag(&self) -> &'static str {
        match self.status {
            TranscodeState::Pending => "pending",
            TranscodeState::Running => "running",
            TranscodeState::Completed => "completed",
            TranscodeState::Failed => "failed",
            TranscodeState::Cancelled => "cancelled",
        }
    }

    fn uncommitted_events(&self) -> &[TranscodeEvent] {
        &self.uncommitted_events
    }

    fn take_uncommitted_events(&mut self) -> Vec<TranscodeEvent> {
        std::mem::take(&mut self.uncommitted_events)
    }
}
