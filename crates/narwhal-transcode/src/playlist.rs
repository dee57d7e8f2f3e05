//! HLS master playlist assembly.

use std::path::{Path, PathBuf};

use m3u8_rs::{MasterPlaylist, Resolution, VariantStream};

use crate::domain::profile::HlsVariant;
use crate::error::TranscodeError;
use crate::tools::args::MASTER_PLAYLIST;

/// Relative URI of the `index`-th variant playlist.
#[must_use]
pub fn variant_uri(index: usize) -> String {
    format!("variant_{index}/playlist.m3u8")
}

/// Builds the master playlist for `variants`, in ladder order.
#[must_use]
pub fn master_playlist(variants: &[HlsVariant]) -> MasterPlaylist {
    MasterPlaylist {
        version: Some(3),
        variants: variants
            .iter()
            .enumerate()
            .map(|(index, variant)| VariantStream {
                uri: variant_uri(index),
                bandwidth: variant.bandwidth(),
                resolution: Some(Resolution {
                    width: u64::from(variant.width),
                    height: u64::from(variant.height),
                }),
                ..VariantStream::default()
            })
            .collect(),
        ..MasterPlaylist::default()
    }
}

/// Writes `master.m3u8` under `output_dir` once every variant playlist
/// exists. Returns the master playlist path.
///
/// # Errors
///
/// Returns `TranscodeError::Io` if a variant playlist is missing or the file
/// cannot be written.
pub async fn write_master_playlist(output_dir: &Path, variants: &[HlsVariant]) -> Result<PathBuf, TranscodeError> {
    for index in 0..variants.len() {
        let path = output_dir.join(variant_uri(index));
        if !tokio::fs::try_exists(&path).await? {
            return Err(TranscodeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("variant playlist missing: {}", path.display()),
            )));
        }
    }
    let mut bytes = Vec::new();
    master_playlist(variants).write_to(&mut bytes)?;
    let path = output_dir.join(MASTER_PLAYLIST);
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::profile::default_ladder;

    #[tokio::test]
    async fn test_master_playlist_lists_variants() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let ladder = default_ladder();
        for index in 0..ladder.len() {
            let variant_dir = dir.path().join(format!("variant_{index}"));
            tokio::fs::create_dir_all(&variant_dir).await.unwrap();
            tokio::fs::write(variant_dir.join("playlist.m3u8"), "#EXTM3U\n").await.unwrap();
        }

        // Act
        let path = write_master_playlist(dir.path(), &ladder).await.unwrap();

        // Assert
        let bytes = tokio::fs::read(&path).await.unwrap();
        let parsed = m3u8_rs::parse_master_playlist_res(&bytes).unwrap();
        assert_eq!(parsed.variants.len(), 3);
        assert_eq!(parsed.variants[0].uri, "variant_0/playlist.m3u8");
        assert_eq!(parsed.variants[0].bandwidth, 5_128_000);
        assert_eq!(
            parsed.variants[2].resolution,
            Some(Resolution { width: 854, height: 480 })
        );
    }

    #[tokio::test]
    async fn test_missing_variant_playlist_is_an_error() {
        let dir = tempfile::tempdir().unwrap();

        let err = write_master_playlist(dir.path(), &default_ladder()).await.unwrap_err();

        assert!(matches!(err, TranscodeError::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));
    }
}
