//! Service which opens byte streams for resources, from multiple kinds of sources.
//!
//! A [`ResourceId`] is classified into a [`StreamSource`]:
//!
//! - `http://` and `https://` URLs are fetched over the network.
//! - `asset:///some/path` references are read from the configured assets directory.
//! - `file://` URLs and absolute paths are read from the local file system.
//!
//! Everything else is [`Unsupported`](CacheError::Unsupported).

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::Future;
use futures::stream::{BoxStream, TryStreamExt};
use sentry::SentryFutureExt;
use tokio::sync::Semaphore;
use url::Url;

use crate::caching::{CacheContents, CacheError};
use crate::config::Config;
use crate::types::ResourceId;
use crate::utils::futures::{CancelOnDrop, m, measure};
use crate::utils::http::DownloadTimeouts;

mod asset;
mod filesystem;
mod http;

pub use self::asset::AssetSource;
pub use self::filesystem::FileSource;
pub use self::http::NetworkSource;

/// Scheme prefix of bundled asset references.
const ASSET_PREFIX: &str = "asset:///";

/// A stream of chunks making up a resource.
pub type ByteStream = BoxStream<'static, CacheContents<Bytes>>;

/// Where the bytes of a resource come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSource {
    /// A file on the local file system.
    File(FileSource),
    /// A file bundled with the application.
    Asset(AssetSource),
    /// A resource fetched over HTTP(S).
    Network(NetworkSource),
}

impl StreamSource {
    /// Classifies `id` into the source its bytes are read from.
    pub fn from_resource_id(id: &ResourceId) -> CacheContents<Self> {
        let raw = id.as_str();

        if let Some(rel) = raw.strip_prefix(ASSET_PREFIX) {
            let path = Path::new(rel);
            let is_contained = !rel.is_empty()
                && path
                    .components()
                    .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
            if !is_contained {
                return Err(CacheError::Unsupported(format!("invalid asset path `{rel}`")));
            }
            return Ok(Self::Asset(AssetSource::new(id.clone(), path.to_owned())));
        }

        if Path::new(raw).is_absolute() {
            return Ok(Self::File(FileSource::new(id.clone(), PathBuf::from(raw))));
        }

        let url = Url::parse(raw)
            .map_err(|_| CacheError::Unsupported(format!("unrecognized resource `{raw}`")))?;
        match url.scheme() {
            "http" | "https" => Ok(Self::Network(NetworkSource::new(id.clone(), url))),
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| CacheError::Unsupported(format!("invalid file URL `{raw}`")))?;
                Ok(Self::File(FileSource::new(id.clone(), path)))
            }
            scheme => Err(CacheError::Unsupported(format!(
                "unsupported scheme `{scheme}`"
            ))),
        }
    }

    /// The resource this source reads.
    pub fn resource_id(&self) -> &ResourceId {
        match self {
            StreamSource::File(source) => &source.id,
            StreamSource::Asset(source) => &source.id,
            StreamSource::Network(source) => &source.id,
        }
    }

    /// A short name of the source type, used as a metrics tag.
    pub fn source_metric_key(&self) -> &'static str {
        match self {
            StreamSource::File(_) => "file",
            StreamSource::Asset(_) => "asset",
            StreamSource::Network(_) => "http",
        }
    }

    /// Whether fetched bytes are worth keeping in the persistent cache.
    ///
    /// Local files and assets are already on disk.
    pub fn is_persistable(&self) -> bool {
        matches!(self, StreamSource::Network(_))
    }
}

impl fmt::Display for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamSource::File(source) => write!(f, "file `{}`", source.path.display()),
            StreamSource::Asset(source) => write!(f, "asset `{}`", source.path.display()),
            StreamSource::Network(source) => write!(f, "`{}`", source.url),
        }
    }
}

/// A service which reads resources from a [`StreamSource`].
///
/// At most `fetch.workers` downloads run at the same time. Further downloads wait for a free
/// worker, they are never rejected.
#[derive(Debug)]
pub struct DownloadService {
    runtime: tokio::runtime::Handle,
    timeouts: DownloadTimeouts,
    workers: Arc<Semaphore>,
    fs: filesystem::FilesystemDownloader,
    assets: asset::AssetDownloader,
    http: http::HttpDownloader,
}

impl DownloadService {
    /// Creates a new downloader that runs all downloads in the given runtime.
    pub fn new(config: &Config, runtime: tokio::runtime::Handle) -> anyhow::Result<Arc<Self>> {
        let timeouts = DownloadTimeouts::from_config(&config.fetch);
        let client = crate::utils::http::create_client(&timeouts)?;

        Ok(Arc::new(Self {
            runtime,
            timeouts,
            workers: Arc::new(Semaphore::new(config.fetch.workers)),
            fs: filesystem::FilesystemDownloader::new(),
            assets: asset::AssetDownloader::new(config.assets_dir.clone()),
            http: http::HttpDownloader::new(client, timeouts),
        }))
    }

    /// Opens a byte stream for the given source.
    pub async fn open_stream(&self, source: &StreamSource) -> CacheContents<ByteStream> {
        match source {
            StreamSource::File(source) => self.fs.open_stream(source).await,
            StreamSource::Asset(source) => self.assets.open_stream(&self.fs, source).await,
            StreamSource::Network(source) => self.http.open_stream(source).await,
        }
    }

    /// Reads the given source to the end.
    async fn dispatch_download(&self, source: &StreamSource) -> CacheContents<Bytes> {
        let job = || async { read_to_end(self.open_stream(source).await?).await };
        let result = match source {
            StreamSource::Network(_) => retry(job).await,
            _ => job().await,
        };

        match &result {
            Ok(data) => tracing::debug!("{} fetched successfully ({} bytes)", source, data.len()),
            Err(err) => tracing::debug!("{} fetching failed: {}", source, err),
        }

        result
    }

    /// Downloads a source completely, waiting for a free worker first.
    ///
    /// This does not do any deduplication of requests, every call freshly downloads the source.
    pub async fn download(&self, source: &StreamSource) -> CacheContents<Bytes> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(CacheError::from_std_error)?;

        let timeout = self.timeouts.max_download;
        let job = tokio::time::timeout(timeout, self.dispatch_download(source));
        let job = async move { job.await.unwrap_or(Err(CacheError::Timeout(timeout))) };
        let result = measure("download", m::cache_result, job).await;

        if let Err(e) = &result {
            metric!(
                counter("fetch.download.failure") += 1,
                "source" => source.source_metric_key(),
                "error" => e.as_tag(),
            );
        }
        result
    }

    /// Starts downloading `source` in the background.
    pub fn start(self: &Arc<Self>, source: StreamSource) -> Download {
        let slf = self.clone();
        let job = {
            let source = source.clone();
            async move { slf.download(&source).await }
        };
        let task = CancelOnDrop::new(self.runtime.spawn(job.bind_hub(sentry::Hub::current())));

        Download { source, task }
    }
}

/// A running download of one [`StreamSource`].
///
/// Dropping the handle cancels the download. The outcome can only be observed through
/// [`outcome`](Self::outcome), which consumes the handle, so a canceled download never reports
/// one.
#[derive(Debug)]
pub struct Download {
    source: StreamSource,
    task: CancelOnDrop<CacheContents<Bytes>>,
}

impl Download {
    pub fn source(&self) -> &StreamSource {
        &self.source
    }

    pub fn resource_id(&self) -> &ResourceId {
        self.source.resource_id()
    }

    /// Waits for the download to finish.
    pub async fn outcome(self) -> CacheContents<Bytes> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(CacheError::from_std_error(e)),
        }
    }
}

/// Collects all chunks of `stream` into one buffer.
async fn read_to_end(mut stream: ByteStream) -> CacheContents<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.try_next().await? {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Try to run a future up to 3 times with 20 millisecond delays on failure.
pub async fn retry<G, F, T>(task_gen: G) -> CacheContents<T>
where
    G: Fn() -> F,
    F: Future<Output = CacheContents<T>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        let result = task_gen().await;

        // its highly unlikely we get a different result when retrying these
        let should_not_retry = matches!(
            result,
            Ok(_)
                | Err(CacheError::NotFound
                    | CacheError::PermissionDenied(_)
                    | CacheError::Unsupported(_))
        );

        if should_not_retry || tries >= 3 {
            break result;
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
