//! Transfer engines.
//!
//! A [`DownloadEngine`] moves bytes for the URLs it supports and reports
//! progress on a channel. Protocol engines (HTTP, `BitTorrent`, Usenet) plug
//! in behind this seam; [`FilesystemEngine`] handles local `file://` sources.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use narwhal_core::context::Context;
use narwhal_core::error::DomainError;
use narwhal_core::ports::DownloadKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::DownloadError;

const COPY_CHUNK: usize = 64 * 1024;

/// What to fetch and where to put it.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Source URL.
    pub url: String,
    /// Detected kind.
    pub kind: DownloadKind,
    /// Destination directory.
    pub target_dir: PathBuf,
}

/// A progress sample from an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchProgress {
    /// Bytes written so far.
    pub bytes: u64,
    /// Expected size, when known.
    pub total: Option<u64>,
}

/// A finished transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    /// Absolute path of the written media.
    pub path: PathBuf,
    /// Bytes written.
    pub bytes: u64,
}

/// Performs transfers for the URLs it supports.
#[async_trait]
pub trait DownloadEngine: Send + Sync {
    /// Name used in events and logs.
    fn name(&self) -> &str;

    /// Whether this engine handles `url`.
    fn supports(&self, url: &str, kind: DownloadKind) -> bool;

    /// Runs the transfer. Progress is best effort: a full channel drops the
    /// sample. Returns `DomainError::Cancelled` when `ctx` is cancelled.
    async fn fetch(
        &self,
        ctx: &Context,
        request: &FetchRequest,
        progress: mpsc::Sender<FetchProgress>,
    ) -> Result<Fetched, DomainError>;
}

/// Copies `file://` sources into the target directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilesystemEngine;

impl FilesystemEngine {
    fn source_path(url: &str) -> Option<&Path> {
        url.strip_prefix("file://").map(Path::new).filter(|p| p.is_absolute())
    }
}

#[async_trait]
impl DownloadEngine for FilesystemEngine {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn supports(&self, url: &str, kind: DownloadKind) -> bool {
        kind == DownloadKind::Http && Self::source_path(url).is_some()
    }

    async fn fetch(
        &self,
        ctx: &Context,
        request: &FetchRequest,
        progress: mpsc::Sender<FetchProgress>,
    ) -> Result<Fetched, DomainError> {
        let source = Self::source_path(&request.url).ok_or_else(|| DownloadError::NoEngine {
            url: request.url.clone(),
            kind: request.kind,
        })?;
        let file_name = source
            .file_name()
            .ok_or_else(|| DomainError::Validation(format!("source has no file name: {}", request.url)))?;
        let destination = request.target_dir.join(file_name);

        tokio::fs::create_dir_all(&request.target_dir)
            .await
            .map_err(DownloadError::from)?;
        let mut reader = tokio::fs::File::open(source).await.map_err(DownloadError::from)?;
        let total = reader.metadata().await.map_err(DownloadError::from)?.len();
        let mut writer = tokio::fs::File::create(&destination)
            .await
            .map_err(DownloadError::from)?;

        let mut buffer = vec![0_u8; COPY_CHUNK];
        let mut bytes = 0_u64;
        loop {
            if ctx.is_cancelled() {
                drop(writer);
                if let Err(err) = tokio::fs::remove_file(&destination).await {
                    debug!(path = %destination.display(), error = %err, "partial download not removed");
                }
                return Err(DomainError::Cancelled);
            }
            let read = reader.read(&mut buffer).await.map_err(DownloadError::from)?;
            if read == 0 {
                break;
            }
            writer.write_all(&buffer[..read]).await.map_err(DownloadError::from)?;
            bytes += read as u64;
            // A full channel drops the sample.
            let _ = progress.try_send(FetchProgress {
                bytes,
                total: Some(total),
            });
        }
        writer.flush().await.map_err(DownloadError::from)?;

        Ok(Fetched {
            path: destination,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filesystem_engine_supports_only_absolute_file_urls() {
        let engine = FilesystemEngine;

        assert!(engine.supports("file:///srv/a.mkv", DownloadKind::Http));
        assert!(!engine.supports("file://relative/a.mkv", DownloadKind::Http));
        assert!(!engine.supports("https://example.com/a.mkv", DownloadKind::Http));
        assert!(!engine.supports("magnet:?xt=urn:btih:DEADBEEF", DownloadKind::Torrent));
    }

    #[tokio::test]
    async fn test_filesystem_engine_copies_and_reports_progress() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("movie.mkv");
        tokio::fs::write(&source, vec![7_u8; 200_000]).await.unwrap();
        let request = FetchRequest {
            url: format!("file://{}", source.display()),
            kind: DownloadKind::Http,
            target_dir: dir.path().join("out"),
        };
        let (tx, mut rx) = mpsc::channel(16);

        // Act
        let fetched = FilesystemEngine.fetch(&Context::background(), &request, tx).await.unwrap();

        // Assert
        assert_eq!(fetched.bytes, 200_000);
        assert_eq!(fetched.path, dir.path().join("out").join("movie.mkv"));
        assert_eq!(tokio::fs::read(&fetched.path).await.unwrap().len(), 200_000);
        let mut last = None;
        while let Ok(sample) = rx.try_recv() {
            last = Some(sample);
        }
        assert_eq!(last.map(|p| p.total), Some(Some(200_000)));
    }

    #[tokio::test]
    async fn test_cancelled_fetch_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("movie.mkv");
        tokio::fs::write(&source, b"data").await.unwrap();
        let request = FetchRequest {
            url: format!("file://{}", source.display()),
            kind: DownloadKind::Http,
            target_dir: dir.path().join("out"),
        };
        let ctx = Context::background();
        ctx.cancel();
        let (tx, _rx) = mpsc::channel(1);

        let err = FilesystemEngine.fetch(&ctx, &request, tx).await.unwrap_err();

        assert!(matches!(err, DomainError::Cancelled));
        assert!(!dir.path().join("out").join("movie.mkv").exists());
    }
}
