//! Filesystem storage backend.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use narwhal_core::context::Context;
use narwhal_core::error::DomainError;
use narwhal_core::ports::{StorageBackend, StorageReader};
use walkdir::WalkDir;

use crate::error::TranscodeError;

/// Stores blobs as files below a root directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
    base_url: Option<String>,
}

impl LocalStorage {
    /// Storage rooted at `root`; `base_url` prefixes public URLs when set.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, base_url: Option<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.map(|url| url.trim_end_matches('/').to_owned()),
        }
    }

    /// Storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> Result<PathBuf, TranscodeError> {
        let relative = Path::new(key);
        let plain = relative.components().all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !plain {
            return Err(TranscodeError::InvalidKey(key.to_owned()));
        }
        Ok(self.root.join(relative))
    }

    /// Key of a path below the root.
    #[must_use]
    pub fn key_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Option<_>>()?;
        (!parts.is_empty()).then(|| parts.join("/"))
    }

    /// Public URL of `path`: through the storage when it lies below the
    /// root, otherwise a `file://` URL.
    #[must_use]
    pub fn url_for_path(&self, path: &Path) -> String {
        match self.key_of(path) {
            Some(key) => self.get_url(&key),
            None => format!("file://{}", path.display()),
        }
    }
}

/// Total size in bytes of the regular files below `path`.
#[must_use]
pub fn tree_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn store(&self, ctx: &Context, key: &str, mut reader: StorageReader) -> Result<u64, DomainError> {
        ctx.check()?;
        let path = self.path_of(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(TranscodeError::from)?;
        }
        let mut file = tokio::fs::File::create(&path).await.map_err(TranscodeError::from)?;
        let written = tokio::io::copy(&mut reader, &mut file).await.map_err(TranscodeError::from)?;
        Ok(written)
    }

    async fn retrieve(&self, ctx: &Context, key: &str) -> Result<StorageReader, DomainError> {
        ctx.check()?;
        let path = self.path_of(key)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(DomainError::Validation(format!("storage key not found: {key}")))
            }
            Err(err) => Err(TranscodeError::from(err).into()),
        }
    }

    async fn delete(&self, ctx: &Context, key: &str) -> Result<(), DomainError> {
        ctx.check()?;
        let path = self.path_of(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(TranscodeError::from(err).into()),
        }
    }

    async fn exists(&self, ctx: &Context, key: &str) -> Result<bool, DomainError> {
        ctx.check()?;
        let path = self.path_of(key)?;
        Ok(tokio::fs::try_exists(&path).await.map_err(TranscodeError::from)?)
    }

    fn get_url(&self, key: &str) -> String {
        match &self.base_url {
            Some(base) => format!("{base}/{key}"),
            None => format!("file://{}", self.root.join(key).display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_store_retrieve_delete() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path(), None);
        let ctx = Context::background();

        // Act
        let written = storage
            .store(&ctx, "M/variant_0/segment_000.ts", Box::new(&b"segment-bytes"[..]))
            .await
            .unwrap();
        let mut content = String::new();
        storage
            .retrieve(&ctx, "M/variant_0/segment_000.ts")
            .await
            .unwrap()
            .read_to_string(&mut content)
            .await
            .unwrap();
        let existed = storage.exists(&ctx, "M/variant_0/segment_000.ts").await.unwrap();
        storage.delete(&ctx, "M/variant_0/segment_000.ts").await.unwrap();
        storage.delete(&ctx, "M/variant_0/segment_000.ts").await.unwrap();

        // Assert
        assert_eq!(written, 13);
        assert_eq!(content, "segment-bytes");
        assert!(existed);
        assert!(!storage.exists(&ctx, "M/variant_0/segment_000.ts").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path(), None);

        let err = storage.exists(&Context::background(), "../etc/passwd").await.unwrap_err();

        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn test_urls_use_base_when_configured() {
        let storage = LocalStorage::new("/srv/media", Some("https://cdn.example/media/".into()));

        assert_eq!(storage.get_url("M/master.m3u8"), "https://cdn.example/media/M/master.m3u8");
        assert_eq!(
            storage.url_for_path(Path::new("/srv/media/M/master.m3u8")),
            "https://cdn.example/media/M/master.m3u8"
        );
        assert_eq!(storage.url_for_path(Path::new("/h/M/master.m3u8")), "file:///h/M/master.m3u8");
    }

    #[test]
    fn test_tree_size_sums_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("variant_0")).unwrap();
        std::fs::write(dir.path().join("variant_0").join("a.ts"), [0_u8; 10]).unwrap();
        std::fs::write(dir.path().join("master.m3u8"), [0_u8; 5]).unwrap();

        assert_eq!(tree_size(dir.path()), 15);
    }
}
