//! Collaborator interfaces consumed by the processing core.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::context::Context;
use crate::envelope::IntegrationEnvelope;
use crate::error::DomainError;

/// Acknowledgement returned by a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    /// Stream that persisted the message.
    pub stream: String,
    /// Sequence assigned by the stream.
    pub sequence: u64,
    /// Whether the broker recognised the message id as a duplicate.
    pub duplicate: bool,
}

/// Publishes integration envelopes onto the event backbone.
#[async_trait]
pub trait IntegrationPublisher: Send + Sync {
    /// Publishes one envelope, stamping `published_at`.
    async fn publish(
        &self,
        ctx: &Context,
        envelope: IntegrationEnvelope,
    ) -> Result<PublishAck, DomainError>;
}

/// Media lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaStatus {
    /// Created, not yet processed.
    Pending,
    /// Source is being downloaded.
    Downloading,
    /// Downloaded source awaits transcoding.
    NeedsTranscode,
    /// Being transcoded.
    Transcoding,
    /// Playable.
    Ready,
    /// Processing failed with no further automated recovery.
    Error,
}

impl MediaStatus {
    /// Wire/tag form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::NeedsTranscode => "needs_transcode",
            Self::Transcoding => "transcoding",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }

    /// Whether `self → next` is an edge of the status lattice.
    ///
    /// `error` is reachable from every state; reprocessing may leave `error`
    /// for `pending` or `downloading`; a ready item may be re-queued for
    /// transcoding.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use MediaStatus::{Downloading, Error, NeedsTranscode, Pending, Ready, Transcoding};
        matches!(
            (self, next),
            (_, Error)
                | (Pending, Downloading)
                | (Downloading, Transcoding | NeedsTranscode)
                | (NeedsTranscode, Transcoding)
                | (Transcoding, Ready)
                | (Ready, NeedsTranscode)
                | (Error, Pending | Downloading)
        )
    }
}

impl fmt::Display for MediaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "needs_transcode" => Ok(Self::NeedsTranscode),
            "transcoding" => Ok(Self::Transcoding),
            "ready" => Ok(Self::Ready),
            "error" => Ok(Self::Error),
            other => Err(DomainError::Validation(format!("unknown media status: {other}"))),
        }
    }
}

/// Domain operations on the media catalog used by saga steps.
#[async_trait]
pub trait MediaService: Send + Sync {
    /// Moves a movie to `status`. Re-applying the current status is a no-op.
    async fn update_movie_status(&self, ctx: &Context, movie_id: Uuid, status: MediaStatus) -> Result<(), DomainError>;

    /// Moves an episode to `status`. Re-applying the current status is a no-op.
    async fn update_episode_status(&self, ctx: &Context, episode_id: Uuid, status: MediaStatus) -> Result<(), DomainError>;

    /// Sets the playable file of a movie. Setting the same path is a no-op.
    async fn update_movie_file(&self, ctx: &Context, movie_id: Uuid, file_path: &str) -> Result<(), DomainError>;

    /// Sets the playable file of an episode. Setting the same path is a no-op.
    async fn update_episode_file(&self, ctx: &Context, episode_id: Uuid, file_path: &str) -> Result<(), DomainError>;
}

/// Transfer protocol of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadKind {
    /// Plain HTTP(S) transfer.
    Http,
    /// `BitTorrent` magnet link.
    Torrent,
    /// Usenet NZB.
    Usenet,
}

impl DownloadKind {
    /// Detects the kind from the URL: `magnet:?` prefix is a torrent, a
    /// `.nzb` suffix is usenet, anything else HTTP.
    #[must_use]
    pub fn detect(url: &str) -> Self {
        if url.starts_with("magnet:?") {
            Self::Torrent
        } else if std::path::Path::new(url)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("nzb"))
        {
            Self::Usenet
        } else {
            Self::Http
        }
    }

    /// Wire/tag form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Torrent => "torrent",
            Self::Usenet => "usenet",
        }
    }
}

/// Progress status of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Created, not started.
    Queued,
    /// Transfer in progress.
    Downloading,
    /// Finished; `downloaded_path` is set.
    Completed,
    /// Transfer failed.
    Failed,
    /// Cancelled by request.
    Cancelled,
}

impl DownloadStatus {
    /// Whether no further transition will happen.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Read model of a download returned by the download collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    /// Download identifier.
    pub id: Uuid,
    /// Source URL.
    pub url: String,
    /// Detected transfer kind.
    pub kind: DownloadKind,
    /// Directory the download writes into.
    pub target_path: String,
    /// Current status.
    pub status: DownloadStatus,
    /// Completion percentage.
    pub progress_percent: f64,
    /// Path of the downloaded media once completed.
    pub downloaded_path: Option<String>,
    /// Failure reason.
    pub error: Option<String>,
}

/// Download collaborator.
#[async_trait]
pub trait DownloadService: Send + Sync {
    /// Registers a download without starting it.
    async fn create_download(
        &self,
        ctx: &Context,
        url: &str,
        kind: DownloadKind,
        target_path: &str,
    ) -> Result<DownloadSnapshot, DomainError>;

    /// Starts a queued download.
    async fn start_download(&self, ctx: &Context, download_id: Uuid) -> Result<(), DomainError>;

    /// Cancels a download; cancelling a terminal download is a no-op.
    async fn cancel_download(&self, ctx: &Context, download_id: Uuid) -> Result<(), DomainError>;

    /// Returns the current state of a download.
    async fn get_download(&self, ctx: &Context, download_id: Uuid) -> Result<DownloadSnapshot, DomainError>;
}

/// Lifecycle state of a transcode job as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeState {
    /// Created, not started.
    Pending,
    /// External process running.
    Running,
    /// Output complete.
    Completed,
    /// Run failed.
    Failed,
    /// Cancelled by request.
    Cancelled,
}

impl TranscodeState {
    /// Whether no further transition will happen for this run.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Snapshot of a transcode job returned by the transcode collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeStatus {
    /// Job identifier.
    pub job_id: Uuid,
    /// Lifecycle state.
    pub state: TranscodeState,
    /// Progress of the current run in `[0, 100]`.
    pub percent: f64,
    /// Playable output (master playlist or file) once completed.
    pub output_path: Option<String>,
    /// Failure reason.
    pub error: Option<String>,
}

/// Transcode collaborator.
#[async_trait]
pub trait TranscodeService: Send + Sync {
    /// Creates and starts a job; returns its id.
    async fn start_transcode(
        &self,
        ctx: &Context,
        input_path: &str,
        output_path: &str,
        profile: &str,
    ) -> Result<Uuid, DomainError>;

    /// Starts a job left pending; a no-op for jobs that are running or
    /// terminal.
    async fn resume_transcode(&self, ctx: &Context, job_id: Uuid) -> Result<(), DomainError>;

    /// Cancels a job; cancelling a terminal job is a no-op.
    async fn cancel_transcode(&self, ctx: &Context, job_id: Uuid) -> Result<(), DomainError>;

    /// Returns the current state of a job.
    async fn job_status(&self, ctx: &Context, job_id: Uuid) -> Result<TranscodeStatus, DomainError>;
}

/// Reader handed to and returned from storage backends.
pub type StorageReader = Box<dyn AsyncRead + Send + Unpin>;

/// Blob storage sink for transcode output.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Stores the content of `reader` under `key`; returns the byte count.
    async fn store(&self, ctx: &Context, key: &str, reader: StorageReader) -> Result<u64, DomainError>;

    /// Opens the content stored under `key`.
    async fn retrieve(&self, ctx: &Context, key: &str) -> Result<StorageReader, DomainError>;

    /// Removes `key`; removing a missing key is a no-op.
    async fn delete(&self, ctx: &Context, key: &str) -> Result<(), DomainError>;

    /// Whether `key` exists.
    async fn exists(&self, ctx: &Context, key: &str) -> Result<bool, DomainError>;

    /// Public URL of `key`.
    fn get_url(&self, key: &str) -> String;
}
