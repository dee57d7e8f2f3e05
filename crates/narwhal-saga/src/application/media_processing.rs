//! The `MediaProcessing` saga: download a source, transcode it, publish the result.
//!
//! Steps, in order: status `downloading`, download, status `transcoding`,
//! transcode, status `ready`. Every status step compensates to `error`;
//! the download and transcode steps compensate by cancelling their work.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use narwhal_core::context::Context;
use narwhal_core::error::DomainError;
use narwhal_core::ports::{
    DownloadKind, DownloadService, DownloadStatus, MediaService, MediaStatus, TranscodeService, TranscodeState,
};
use narwhal_media::{MediaType, ProcessingRequest};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::saga::{Saga, SagaData, keys};
use crate::domain::step::{SagaDefinition, SagaStep};
use crate::error::SagaError;

/// Registered type name of the media processing saga.
pub const MEDIA_PROCESSING_SAGA: &str = "MediaProcessing";

/// Default transcode profile when the request names none.
pub const DEFAULT_PROFILE: &str = "hls";

/// How often download and transcode state is polled.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Builds the initial data of a processing saga.
#[must_use]
pub fn processing_data(media_id: Uuid, media_type: MediaType, request: &ProcessingRequest) -> SagaData {
    let mut data = SagaData::new();
    data.insert(keys::MEDIA_ID.into(), media_id.to_string().into());
    data.insert(keys::MEDIA_TYPE.into(), media_type.as_str().into());
    data.insert(keys::DOWNLOAD_URL.into(), request.download_url.clone().into());
    data.insert(keys::TARGET_PATH.into(), request.target_path.clone().into());
    data.insert(keys::OUTPUT_PATH.into(), request.output_path.clone().into());
    data.insert(keys::TRANSCODE_PROFILE.into(), request.transcode_profile.clone().into());
    data
}

/// The processed movie or episode.
#[derive(Debug, Clone, Copy)]
struct MediaTarget {
    id: Uuid,
    kind: MediaType,
}

impl MediaTarget {
    fn of(saga: &Saga) -> Result<Self, SagaError> {
        let id = saga.require_uuid(keys::MEDIA_ID)?;
        let tag = saga.require_str(keys::MEDIA_TYPE)?;
        let kind = match tag.parse::<MediaType>() {
            Ok(kind @ (MediaType::Movie | MediaType::Episode)) => kind,
            Ok(MediaType::Series) | Err(_) => return Err(SagaError::UnsupportedMediaType(tag.to_owned())),
        };
        Ok(Self { id, kind })
    }

    async fn set_status(self, media: &dyn MediaService, ctx: &Context, status: MediaStatus) -> Result<(), DomainError> {
        match self.kind {
            MediaType::Episode => media.update_episode_status(ctx, self.id, status).await,
            _ => media.update_movie_status(ctx, self.id, status).await,
        }
    }

    async fn set_file(self, media: &dyn MediaService, ctx: &Context, path: &str) -> Result<(), DomainError> {
        match self.kind {
            MediaType::Episode => media.update_episode_file(ctx, self.id, path).await,
            _ => media.update_movie_file(ctx, self.id, path).await,
        }
    }
}

/// Sleeps one poll interval unless `ctx` is cancelled first.
async fn pause(ctx: &Context, interval: Duration) -> Result<(), DomainError> {
    tokio::select! {
        () = ctx.cancelled() => Err(DomainError::Cancelled),
        () = tokio::time::sleep(interval) => Ok(()),
    }
}

/// Moves the media to a fixed status; compensates to `error`.
pub struct UpdateMediaStatus {
    name: String,
    status: MediaStatus,
    media: Arc<dyn MediaService>,
}

impl UpdateMediaStatus {
    /// A step setting `status`.
    #[must_use]
    pub fn new(status: MediaStatus, media: Arc<dyn MediaService>) -> Self {
        let name = format!("UpdateStatus_{}", status.as_str());
        Self { name, status, media }
    }
}

#[async_trait]
impl SagaStep for UpdateMediaStatus {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &Context, saga: &mut Saga) -> Result<(), DomainError> {
        let target = MediaTarget::of(saga)?;
        target.set_status(self.media.as_ref(), ctx, self.status).await
    }

    async fn compensate(&self, ctx: &Context, saga: &Saga) -> Result<(), DomainError> {
        let target = MediaTarget::of(saga)?;
        target.set_status(self.media.as_ref(), ctx, MediaStatus::Error).await
    }
}

/// Creates, starts and waits for the download; records `downloaded_path`.
pub struct DownloadMedia {
    downloads: Arc<dyn DownloadService>,
    poll_interval: Duration,
}

impl DownloadMedia {
    /// A step using `downloads`.
    #[must_use]
    pub fn new(downloads: Arc<dyn DownloadService>, poll_interval: Duration) -> Self {
        Self {
            downloads,
            poll_interval,
        }
    }
}

#[async_trait]
impl SagaStep for DownloadMedia {
    fn name(&self) -> &str {
        "DownloadMedia"
    }

    async fn execute(&self, ctx: &Context, saga: &mut Saga) -> Result<(), DomainError> {
        let download_id = match saga.optional_uuid(keys::DOWNLOAD_ID)? {
            Some(id) => id,
            None => {
                let url = saga.require_str(keys::DOWNLOAD_URL)?;
                let target = saga.require_str(keys::TARGET_PATH)?;
                let kind = DownloadKind::detect(url);
                let snapshot = self.downloads.create_download(ctx, url, kind, target).await?;
                info!(saga_id = %saga.id, download_id = %snapshot.id, kind = kind.as_str(), "download created");
                saga.set(keys::DOWNLOAD_ID, snapshot.id.to_string());
                snapshot.id
            }
        };

        let mut snapshot = self.downloads.get_download(ctx, download_id).await?;
        if snapshot.status == DownloadStatus::Queued {
            self.downloads.start_download(ctx, download_id).await?;
        }
        loop {
            match snapshot.status {
                DownloadStatus::Completed => {
                    let path = snapshot
                        .downloaded_path
                        .ok_or_else(|| SagaError::DownloadFailed("completed without a file".into()))?;
                    saga.set(keys::DOWNLOADED_PATH, path);
                    return Ok(());
                }
                DownloadStatus::Failed => {
                    let reason = snapshot.error.unwrap_or_else(|| "download failed".into());
                    return Err(SagaError::DownloadFailed(reason).into());
                }
                DownloadStatus::Cancelled => {
                    return Err(SagaError::DownloadFailed("download was cancelled".into()).into());
                }
                DownloadStatus::Queued | DownloadStatus::Downloading => {
                    debug!(download_id = %download_id, percent = snapshot.progress_percent, "waiting for download");
                }
            }
            snapshot = self.downloads.get_download(ctx, download_id).await?;
            if !snapshot.status.is_terminal() {
                pause(ctx, self.poll_interval).await?;
            }
        }
    }

    async fn compensate(&self, ctx: &Context, saga: &Saga) -> Result<(), DomainError> {
        match saga.optional_uuid(keys::DOWNLOAD_ID)? {
            Some(download_id) => self.downloads.cancel_download(ctx, download_id).await,
            None => Ok(()),
        }
    }
}

/// Starts and waits for the transcode job; points the media at its output.
pub struct TranscodeMedia {
    transcodes: Arc<dyn TranscodeService>,
    media: Arc<dyn MediaService>,
    poll_interval: Duration,
}

impl TranscodeMedia {
    /// A step using `transcodes` and `media`.
    #[must_use]
    pub fn new(transcodes: Arc<dyn TranscodeService>, media: Arc<dyn MediaService>, poll_interval: Duration) -> Self {
        Self {
            transcodes,
            media,
            poll_interval,
        }
    }
}

#[async_trait]
impl SagaStep for TranscodeMedia {
    fn name(&self) -> &str {
        "TranscodeMedia"
    }

    async fn execute(&self, ctx: &Context, saga: &mut Saga) -> Result<(), DomainError> {
        let target = MediaTarget::of(saga)?;
        let job_id = match saga.optional_uuid(keys::TRANSCODE_JOB_ID)? {
            Some(id) => id,
            None => {
                let input = saga.require_str(keys::DOWNLOADED_PATH)?;
                let output = saga.require_str(keys::OUTPUT_PATH)?;
                let profile = saga.optional_str(keys::TRANSCODE_PROFILE)?.unwrap_or(DEFAULT_PROFILE);
                let job_id = self.transcodes.start_transcode(ctx, input, output, profile).await?;
                info!(saga_id = %saga.id, job_id = %job_id, profile, "transcode started");
                saga.set(keys::TRANSCODE_JOB_ID, job_id.to_string());
                job_id
            }
        };
        if self.transcodes.job_status(ctx, job_id).await?.state == TranscodeState::Pending {
            self.transcodes.resume_transcode(ctx, job_id).await?;
        }

        let output = loop {
            let status = self.transcodes.job_status(ctx, job_id).await?;
            match status.state {
                TranscodeState::Completed => {
                    break status
                        .output_path
                        .ok_or_else(|| SagaError::TranscodeFailed("completed without output".into()))?;
                }
                TranscodeState::Failed => {
                    let reason = status.error.unwrap_or_else(|| "transcode failed".into());
                    return Err(SagaError::TranscodeFailed(reason).into());
                }
                TranscodeState::Cancelled => {
                    return Err(SagaError::TranscodeFailed("transcode was cancelled".into()).into());
                }
                TranscodeState::Pending | TranscodeState::Running => {
                    debug!(job_id = %job_id, percent = status.percent, "waiting for transcode");
                    pause(ctx, self.poll_interval).await?;
                }
            }
        };

        target.set_file(self.media.as_ref(), ctx, &output).await?;
        saga.set(keys::TRANSCODED_PATH, output);
        Ok(())
    }

    async fn compensate(&self, ctx: &Context, saga: &Saga) -> Result<(), DomainError> {
        match saga.optional_uuid(keys::TRANSCODE_JOB_ID)? {
            Some(job_id) => self.transcodes.cancel_transcode(ctx, job_id).await,
            None => Ok(()),
        }
    }
}

/// The canonical media processing definition.
pub struct MediaProcessing {
    steps: Vec<Arc<dyn SagaStep>>,
}

impl MediaProcessing {
    /// Wires the five steps to their collaborators.
    #[must_use]
    pub fn new(
        media: Arc<dyn MediaService>,
        downloads: Arc<dyn DownloadService>,
        transcodes: Arc<dyn TranscodeService>,
        poll_interval: Duration,
    ) -> Self {
        let steps: Vec<Arc<dyn SagaStep>> = vec![
            Arc::new(UpdateMediaStatus::new(MediaStatus::Downloading, Arc::clone(&media))),
            Arc::new(DownloadMedia::new(downloads, poll_interval)),
            Arc::new(UpdateMediaStatus::new(MediaStatus::Transcoding, Arc::clone(&media))),
            Arc::new(TranscodeMedia::new(transcodes, Arc::clone(&media), poll_interval)),
            Arc::new(UpdateMediaStatus::new(MediaStatus::Ready, media)),
        ];
        Self { steps }
    }
}

impl std::fmt::Debug for MediaProcessing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.steps.iter().map(|s| s.name()).collect();
        f.debug_struct("MediaProcessing").field("steps", &names).finish()
    }
}

impl SagaDefinition for MediaProcessing {
    fn saga_type(&self) -> &str {
        MEDIA_PROCESSING_SAGA
    }

    fn steps(&self) -> &[Arc<dyn SagaStep>] {
        &self.steps
    }
}
