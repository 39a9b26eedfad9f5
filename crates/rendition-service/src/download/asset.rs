//! Support to read resources bundled with the application.
//!
//! Assets are addressed as `asset:///relative/path` and resolved against the configured
//! `assets_dir`. Paths escaping that directory are rejected when the id is classified.

use std::path::{Path, PathBuf};

use crate::caching::{CacheContents, CacheError};
use crate::types::ResourceId;

use super::ByteStream;
use super::filesystem::FilesystemDownloader;

/// A resource bundled with the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetSource {
    pub(super) id: ResourceId,
    pub(super) path: PathBuf,
}

impl AssetSource {
    pub fn new(id: ResourceId, path: PathBuf) -> Self {
        Self { id, path }
    }

    /// The path of this asset, relative to the assets directory.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Downloader implementation that supports asset sources.
#[derive(Debug)]
pub struct AssetDownloader {
    root: Option<PathBuf>,
}

impl AssetDownloader {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    /// Opens a byte stream over the bundled asset.
    pub async fn open_stream(
        &self,
        fs: &FilesystemDownloader,
        source: &AssetSource,
    ) -> CacheContents<ByteStream> {
        let Some(root) = &self.root else {
            return Err(CacheError::Unsupported(
                "no assets directory configured".into(),
            ));
        };
        fs.open_path(&root.join(&source.path)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::download::read_to_end;

    #[tokio::test]
    async fn test_read_asset() {
        let dir = crate::test::tempdir();
        std::fs::create_dir_all(dir.path().join("icons")).unwrap();
        std::fs::write(dir.path().join("icons/logo.png"), b"logo").unwrap();

        let source = AssetSource::new(ResourceId::new("unused"), "icons/logo.png".into());
        let downloader = AssetDownloader::new(Some(dir.path().to_owned()));
        let stream = downloader
            .open_stream(&FilesystemDownloader::new(), &source)
            .await
            .unwrap();

        assert_eq!(&read_to_end(stream).await.unwrap()[..], b"logo");
    }

    #[tokio::test]
    async fn test_no_assets_dir() {
        let source = AssetSource::new(ResourceId::new("unused"), "logo.png".into());
        let result = AssetDownloader::new(None)
            .open_stream(&FilesystemDownloader::new(), &source)
            .await;

        assert!(matches!(result, Err(CacheError::Unsupported(_))));
    }
}
