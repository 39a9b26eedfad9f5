//! Support to read resources from the local filesystem.

use std::io;
use std::path::{Path, PathBuf};

use futures::TryStreamExt;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

use crate::caching::{CacheContents, CacheError};
use crate::types::ResourceId;

use super::ByteStream;

/// A resource stored at a local file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSource {
    pub(super) id: ResourceId,
    pub(super) path: PathBuf,
}

impl FileSource {
    pub fn new(id: ResourceId, path: PathBuf) -> Self {
        Self { id, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Downloader implementation that supports file sources.
#[derive(Debug)]
pub struct FilesystemDownloader {}

impl FilesystemDownloader {
    pub fn new() -> Self {
        Self {}
    }

    /// Opens a byte stream over the file at `source`.
    pub async fn open_stream(&self, source: &FileSource) -> CacheContents<ByteStream> {
        self.open_path(&source.path).await
    }

    pub(super) async fn open_path(&self, path: &Path) -> CacheContents<ByteStream> {
        tracing::debug!("Reading file from {:?}", path);

        let file = File::open(path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CacheError::NotFound,
            io::ErrorKind::PermissionDenied => CacheError::PermissionDenied(e.to_string()),
            _ => e.into(),
        })?;

        Ok(Box::pin(ReaderStream::new(file).map_err(CacheError::from)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::download::read_to_end;

    #[tokio::test]
    async fn test_read_file() {
        let dir = crate::test::tempdir();
        let path = dir.path().join("image.bin");
        std::fs::write(&path, b"some bytes").unwrap();

        let source = FileSource::new(ResourceId::new("unused"), path);
        let stream = FilesystemDownloader::new().open_stream(&source).await.unwrap();
        let data = read_to_end(stream).await.unwrap();

        assert_eq!(&data[..], b"some bytes");
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = crate::test::tempdir();
        let source = FileSource::new(ResourceId::new("unused"), dir.path().join("missing"));
        let result = FilesystemDownloader::new().open_stream(&source).await;

        assert!(matches!(result, Err(CacheError::NotFound)));
    }
}
