//! The `Download` aggregate.

use std::path::Path;

use chrono::{DateTime, Utc};
use narwhal_core::aggregate::{AggregateRoot, AggregateState};
use narwhal_core::clock::Clock;
use narwhal_core::context::Context;
use narwhal_core::error::DomainError;
use narwhal_core::event::EventMetadata;
use narwhal_core::ports::{DownloadKind, DownloadSnapshot, DownloadStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{
    BOUNDED_CONTEXT, DownloadCancelled, DownloadCompleted, DownloadCreated, DownloadEvent, DownloadEventKind,
    DownloadFailed, DownloadRequeued, DownloadStarted,
};
use crate::error::DownloadError;

/// A transfer of one media source into a target directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Download {
    #[serde(flatten)]
    state: AggregateState,
    url: String,
    kind: DownloadKind,
    target_path: String,
    status: DownloadStatus,
    bytes_downloaded: u64,
    total_bytes: Option<u64>,
    downloaded_path: Option<String>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    uncommitted_events: Vec<DownloadEvent>,
}

impl Download {
    /// Registers a queued download and records `DownloadCreated`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the URL is empty or the target
    /// path is not absolute.
    pub fn create(
        ctx: &Context,
        clock: &dyn Clock,
        url: &str,
        kind: DownloadKind,
        target_path: &str,
    ) -> Result<Self, DomainError> {
        if url.trim().is_empty() {
            return Err(DomainError::Validation("download url must not be empty".into()));
        }
        if !Path::new(target_path).is_absolute() {
            return Err(DomainError::Validation(format!(
                "target path must be absolute: {target_path}"
            )));
        }
        let mut download = Self {
            state: AggregateState::new(Uuid::new_v4(), clock),
            url: url.to_owned(),
            kind,
            target_path: target_path.to_owned(),
            status: DownloadStatus::Queued,
            bytes_downloaded: 0,
            total_bytes: None,
            downloaded_path: None,
            error: None,
            started_at: None,
            completed_at: None,
            uncommitted_events: Vec::new(),
        };
        let kind = DownloadEventKind::DownloadCreated(DownloadCreated {
            download_id: download.state.id,
            url: download.url.clone(),
            kind,
            target_path: download.target_path.clone(),
        });
        download.record(ctx, clock, kind);
        Ok(download)
    }

    fn record(&mut self, ctx: &Context, clock: &dyn Clock, kind: DownloadEventKind) {
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
        self.uncommitted_events.push(DownloadEvent { metadata, kind });
    }

    fn transition(&mut self, to: DownloadStatus) -> Result<(), DomainError> {
        let legal = matches!(
            (self.status, to),
            (DownloadStatus::Queued, DownloadStatus::Downloading)
                | (DownloadStatus::Downloading, DownloadStatus::Completed)
                | (
                    DownloadStatus::Queued | DownloadStatus::Downloading,
                    DownloadStatus::Failed | DownloadStatus::Cancelled
                )
        );
        if !legal {
            return Err(DownloadError::InvalidStatus { from: self.status, to }.into());
        }
        self.status = to;
        Ok(())
    }

    /// Source URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Transfer kind.
    #[must_use]
    pub fn kind(&self) -> DownloadKind {
        self.kind
    }

    /// Destination directory.
    #[must_use]
    pub fn target_path(&self) -> &str {
        &self.target_path
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> DownloadStatus {
        self.status
    }

    /// Path of the downloaded media once completed.
    #[must_use]
    pub fn downloaded_path(&self) -> Option<&str> {
        self.downloaded_path.as_deref()
    }

    /// Failure reason.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Completion percentage in `[0, 100]`.
    #[must_use]
    pub fn progress_percent(&self) -> f64 {
        match (self.status, self.total_bytes) {
            (DownloadStatus::Completed, _) => 100.0,
            (_, Some(total)) if total > 0 => {
                #[allow(clippy::cast_precision_loss)]
                let percent = self.bytes_downloaded as f64 / total as f64 * 100.0;
                percent.clamp(0.0, 100.0)
            }
            _ => 0.0,
        }
    }

    /// Begins the transfer with `engine`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` unless the download is queued.
    pub fn start(&mut self, ctx: &Context, clock: &dyn Clock, engine: &str) -> Result<(), DomainError> {
        self.transition(DownloadStatus::Downloading)?;
        self.started_at = Some(clock.now());
        let kind = DownloadEventKind::DownloadStarted(DownloadStarted {
            download_id: self.state.id,
            engine: engine.to_owned(),
        });
        self.record(ctx, clock, kind);
        Ok(())
    }

    /// Records transfer progress. Byte counts never move backwards.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` unless the download is running.
    pub fn record_progress(
        &mut self,
        clock: &dyn Clock,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    ) -> Result<(), DomainError> {
        if self.status != DownloadStatus::Downloading {
            return Err(DownloadError::InvalidStatus {
                from: self.status,
                to: DownloadStatus::Downloading,
            }
            .into());
        }
        self.bytes_downloaded = self.bytes_downloaded.max(bytes_downloaded);
        self.total_bytes = total_bytes.or(self.total_bytes);
        self.state.touch(clock);
        Ok(())
    }

    /// Marks the transfer finished with the file at `downloaded_path`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` unless the download is running or
    /// the path is not absolute.
    pub fn complete(
        &mut self,
        ctx: &Context,
        clock: &dyn Clock,
        downloaded_path: &str,
        bytes: u64,
    ) -> Result<(), DomainError> {
        if !Path::new(downloaded_path).is_absolute() {
            return Err(DomainError::Validation(format!(
                "downloaded path must be absolute: {downloaded_path}"
            )));
        }
        self.transition(DownloadStatus::Completed)?;
        self.downloaded_path = Some(downloaded_path.to_owned());
        self.bytes_downloaded = bytes;
        self.total_bytes = Some(bytes);
        self.completed_at = Some(clock.now());
        let kind = DownloadEventKind::DownloadCompleted(DownloadCompleted {
            download_id: self.state.id,
            downloaded_path: downloaded_path.to_owned(),
            bytes,
        });
        self.record(ctx, clock, kind);
        Ok(())
    }

    /// Marks the transfer failed.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the download is already terminal.
    pub fn fail(&mut self, ctx: &Context, clock: &dyn Clock, reason: &str) -> Result<(), DomainError> {
        self.transition(DownloadStatus::Failed)?;
        self.error = Some(reason.to_owned());
        self.completed_at = Some(clock.now());
        let kind = DownloadEventKind::DownloadFailed(DownloadFailed {
            download_id: self.state.id,
            error: reason.to_owned(),
        });
        self.record(ctx, clock, kind);
        Ok(())
    }

    /// Returns a transfer interrupted mid-flight to the queue and records
    /// `DownloadRequeued`. Byte counts restart from zero.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` unless the download is running.
    pub fn requeue(&mut self, ctx: &Context, clock: &dyn Clock) -> Result<(), DomainError> {
        if self.status != DownloadStatus::Downloading {
            return Err(DownloadError::InvalidStatus {
                from: self.status,
                to: DownloadStatus::Queued,
            }
            .into());
        }
        self.status = DownloadStatus::Queued;
        self.bytes_downloaded = 0;
        self.started_at = None;
        let kind = DownloadEventKind::DownloadRequeued(DownloadRequeued {
            download_id: self.state.id,
        });
        self.record(ctx, clock, kind);
        Ok(())
    }

    /// Cancels the download. Returns `false` if it was already terminal.
    pub fn cancel(&mut self, ctx: &Context, clock: &dyn Clock) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = DownloadStatus::Cancelled;
        self.completed_at = Some(clock.now());
        let kind = DownloadEventKind::DownloadCancelled(DownloadCancelled {
            download_id: self.state.id,
        });
        self.record(ctx, clock, kind);
        true
    }

    /// Read model handed to collaborators.
    #[must_use]
    pub fn snapshot(&self) -> DownloadSnapshot {
        DownloadSnapshot {
            id: self.state.id,
            url: self.url.clone(),
            kind: self.kind,
            target_path: self.target_path.clone(),
            status: self.status,
            progress_percent: self.progress_percent(),
            downloaded_path: self.downloaded_path.clone(),
            error: self.error.clone(),
        }
    }
}

fn status_tag(status: DownloadStatus) -> &'static str {
    match status {
        DownloadStatus::Queued => "queued",
        DownloadStatus::Downloading => "downloading",
        DownloadStatus::Completed => "completed",
        DownloadStatus::Failed => "failed",
        DownloadStatus::Cancelled => "cancelled",
    }
}

impl AggregateRoot for Download {
    type Event = DownloadEvent;
    const AGGREGATE_TYPE: &'static str = "Download";

    fn state(&self) -> &AggregateState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut AggregateState {
        &mut self.state
    }

    fn validate(&self) -> Result<(), DomainError> {
        if self.url.trim().is_empty() {
            return Err(DomainError::Validation("download url must not be empty".into()));
        }
        if self.status == DownloadStatus::Completed && self.downloaded_path.is_none() {
            return Err(DomainError::Validation(
                "a completed download has a downloaded path".into(),
            ));
        }
        Ok(())
    }

    fn status_tag(&self) -> &'static str {
        status_tag(self.status)
    }

    fn uncommitted_events(&self) -> &[DownloadEvent] {
        &self.uncommitted_events
    }

    fn take_uncommitted_events(&mut self) -> Vec<DownloadEvent> {
        std::mem::take(&mut self.uncommitted_events)
    }
}
