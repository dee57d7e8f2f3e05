//! Recording collaborator fakes for saga and engine tests.

use std::collections::HashMap;

use async_trait::async_trait;
use narwhal_core::context::Context;
use narwhal_core::error::DomainError;
use narwhal_core::ports::{
    DownloadKind, DownloadService, DownloadSnapshot, DownloadStatus, MediaService, MediaStatus,
    TranscodeService, TranscodeState, TranscodeStatus,
};
use parking_lot::Mutex;
use uuid::Uuid;

/// A call observed by [`RecordingMediaService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaCall {
    /// `update_movie_status` or `update_episode_status`.
    Status {
        /// Media id.
        id: Uuid,
        /// Requested status.
        status: MediaStatus,
    },
    /// `update_movie_file` or `update_episode_file`.
    File {
        /// Media id.
        id: Uuid,
        /// Requested path.
        path: String,
    },
}

/// A media service that records calls and optionally rejects one status.
#[derive(Debug, Default)]
pub struct RecordingMediaService {
    calls: Mutex<Vec<MediaCall>>,
    reject: Mutex<Option<MediaStatus>>,
}

impl RecordingMediaService {
    /// Creates a service accepting every call.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every update to `status` with a validation error.
    pub fn reject_status(&self, status: MediaStatus) {
        *self.reject.lock() = Some(status);
    }

    /// Snapshot of every accepted call.
    #[must_use]
    pub fn calls(&self) -> Vec<MediaCall> {
        self.calls.lock().clone()
    }

    /// Statuses requested for `id`, in order.
    #[must_use]
    pub fn statuses(&self, id: Uuid) -> Vec<MediaStatus> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                MediaCall::Status { id: call_id, status } if *call_id == id => Some(*status),
                _ => None,
            })
            .collect()
    }

    fn status(&self, id: Uuid, status: MediaStatus) -> Result<(), DomainError> {
        if *self.reject.lock() == Some(status) {
            return Err(DomainError::Validation(format!("status {status} rejected")));
        }
        self.calls.lock().push(MediaCall::Status { id, status });
        Ok(())
    }

    fn file(&self, id: Uuid, path: &str) {
        self.calls.lock().push(MediaCall::File {
            id,
            path: path.to_owned(),
        });
    }
}

#[async_trait]
impl MediaService for RecordingMediaService {
    async fn update_movie_status(&self, _ctx: &Context, movie_id: Uuid, status: MediaStatus) -> Result<(), DomainError> {
        self.status(movie_id, status)
    }

    async fn update_episode_status(&self, _ctx: &Context, episode_id: Uuid, status: MediaStatus) -> Result<(), DomainError> {
        self.status(episode_id, status)
    }

    async fn update_movie_file(&self, _ctx: &Context, movie_id: Uuid, file_path: &str) -> Result<(), DomainError> {
        self.file(movie_id, file_path);
        Ok(())
    }

    async fn update_episode_file(&self, _ctx: &Context, episode_id: Uuid, file_path: &str) -> Result<(), DomainError> {
        self.file(episode_id, file_path);
        Ok(())
    }
}

/// A download service whose downloads finish as soon as they start.
///
/// Completed downloads land at `<target_path>/<id>.mkv`.
#[derive(Debug, Default)]
pub struct InstantDownloadService {
    downloads: Mutex<HashMap<Uuid, DownloadSnapshot>>,
    created: Mutex<Vec<Uuid>>,
    cancelled: Mutex<Vec<Uuid>>,
    failure: Mutex<Option<String>>,
}

impl InstantDownloadService {
    /// Creates a service whose downloads succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every started download fail with `reason`.
    pub fn fail_with(&self, reason: &str) {
        *self.failure.lock() = Some(reason.to_owned());
    }

    /// Ids passed to `create_download`, in order.
    #[must_use]
    pub fn created(&self) -> Vec<Uuid> {
        self.created.lock().clone()
    }

    /// Ids passed to `cancel_download`, in order.
    #[must_use]
    pub fn cancelled(&self) -> Vec<Uuid> {
        self.cancelled.lock().clone()
    }

    /// The snapshot of one download.
    #[must_use]
    pub fn snapshot(&self, id: Uuid) -> Option<DownloadSnapshot> {
        self.downloads.lock().get(&id).cloned()
    }
}

#[async_trait]
impl DownloadService for InstantDownloadService {
    async fn create_download(
        &self,
        _ctx: &Context,
        url: &str,
        kind: DownloadKind,
        target_path: &str,
    ) -> Result<DownloadSnapshot, DomainError> {
        let snapshot = DownloadSnapshot {
            id: Uuid::new_v4(),
            url: url.to_owned(),
            kind,
            target_path: target_path.to_owned(),
            status: DownloadStatus::Queued,
            progress_percent: 0.0,
            downloaded_path: None,
            error: None,
        };
        self.created.lock().push(snapshot.id);
        self.downloads.lock().insert(snapshot.id, snapshot.clone());
        Ok(snapshot)
    }

    async fn start_download(&self, _ctx: &Context, download_id: Uuid) -> Result<(), DomainError> {
        let failure = self.failure.lock().clone();
        let mut downloads = self.downloads.lock();
        let download = downloads
            .get_mut(&download_id)
            .ok_or_else(|| DomainError::not_found("Download", download_id))?;
        if download.status != DownloadStatus::Queued {
            return Ok(());
        }
        match failure {
            Some(reason) => {
                download.status = DownloadStatus::Failed;
                download.error = Some(reason);
            }
            None => {
                download.status = DownloadStatus::Completed;
                download.progress_percent = 100.0;
                download.downloaded_path = Some(format!("{}/{download_id}.mkv", download.target_path));
            }
        }
        Ok(())
    }

    async fn cancel_download(&self, _ctx: &Context, download_id: Uuid) -> Result<(), DomainError> {
        self.cancelled.lock().push(download_id);
        if let Some(download) = self.downloads.lock().get_mut(&download_id) {
            if !download.status.is_terminal() {
                download.status = DownloadStatus::Cancelled;
            }
        }
        Ok(())
    }

    async fn get_download(&self, _ctx: &Context, download_id: Uuid) -> Result<DownloadSnapshot, DomainError> {
        self.downloads
            .lock()
            .get(&download_id)
            .cloned()
            .ok_or_else(|| DomainError::not_found("Download", download_id))
    }
}

/// A transcode service whose jobs finish as soon as they start.
///
/// Completed jobs report `<output_path>/master.m3u8`.
#[derive(Debug, Default)]
pub struct InstantTranscodeService {
    jobs: Mutex<HashMap<Uuid, TranscodeStatus>>,
    started: Mutex<Vec<(String, String, String)>>,
    cancelled: Mutex<Vec<Uuid>>,
    failure: Mutex<Option<String>>,
}

impl InstantTranscodeService {
    /// Creates a service whose jobs succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every job fail with `reason`.
    pub fn fail_with(&self, reason: &str) {
        *self.failure.lock() = Some(reason.to_owned());
    }

    /// `(input, output, profile)` of every started job.
    #[must_use]
    pub fn started(&self) -> Vec<(String, String, String)> {
        self.started.lock().clone()
    }

    /// Ids passed to `cancel_transcode`, in order.
    #[must_use]
    pub fn cancelled(&self) -> Vec<Uuid> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl TranscodeService for InstantTranscodeService {
    async fn start_transcode(
        &self,
        _ctx: &Context,
        input_path: &str,
        output_path: &str,
        profile: &str,
    ) -> Result<Uuid, DomainError> {
        let job_id = Uuid::new_v4();
        self.started
            .lock()
            .push((input_path.to_owned(), output_path.to_owned(), profile.to_owned()));
        let status = match self.failure.lock().clone() {
            Some(reason) => TranscodeStatus {
                job_id,
                state: TranscodeState::Failed,
                percent: 0.0,
                output_path: None,
                error: Some(reason),
            },
            None => TranscodeStatus {
                job_id,
                state: TranscodeState::Completed,
                percent: 100.0,
                output_path: Some(format!("{output_path}/master.m3u8")),
                error: None,
            },
        };
        self.jobs.lock().insert(job_id, status);
        Ok(job_id)
    }

    async fn resume_transcode(&self, _ctx: &Context, job_id: Uuid) -> Result<(), DomainError> {
        if self.jobs.lock().contains_key(&job_id) {
            Ok(())
        } else {
            Err(DomainError::not_found("TranscodeJob", job_id))
        }
    }

    async fn cancel_transcode(&self, _ctx: &Context, job_id: Uuid) -> Result<(), DomainError> {
        self.cancelled.lock().push(job_id);
        Ok(())
    }

    async fn job_status(&self, _ctx: &Context, job_id: Uuid) -> Result<TranscodeStatus, DomainError> {
        self.jobs
            .lock()
            .get(&job_id)
            .cloned()
            .ok_or_else(|| DomainError::not_found("TranscodeJob", job_id))
    }
}
