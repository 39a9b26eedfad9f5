//! Support to download from HTTP sources.

use futures::TryStreamExt;
use reqwest::{Client, StatusCode, header};
use url::Url;

use crate::caching::{CacheContents, CacheError};
use crate::types::ResourceId;
use crate::utils::http::{DownloadTimeouts, USER_AGENT};

use super::ByteStream;

/// A resource served over HTTP(S).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSource {
    pub(super) id: ResourceId,
    pub(super) url: Url,
}

impl NetworkSource {
    pub fn new(id: ResourceId, url: Url) -> Self {
        Self { id, url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

/// Downloader implementation that supports network sources.
#[derive(Debug)]
pub struct HttpDownloader {
    client: Client,
    timeouts: DownloadTimeouts,
}

impl HttpDownloader {
    pub fn new(client: Client, timeouts: DownloadTimeouts) -> Self {
        Self { client, timeouts }
    }

    /// Sends the request for `source` and streams the response body.
    pub async fn open_stream(&self, source: &NetworkSource) -> CacheContents<ByteStream> {
        tracing::debug!("Fetching resource from `{}`", source.url);

        let timeouts = self.timeouts;
        let map_error = move |e: reqwest::Error| match (e.is_timeout(), e.is_connect()) {
            (true, true) => CacheError::Timeout(timeouts.connect),
            (true, false) => CacheError::Timeout(timeouts.read),
            _ => CacheError::from(e),
        };

        let response = self
            .client
            .get(source.url.clone())
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .map_err(map_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_for_status(&source.url, status));
        }

        Ok(Box::pin(response.bytes_stream().map_err(map_error)))
    }
}

/// Maps an unsuccessful response status to a [`CacheError`].
fn error_for_status(url: &Url, status: StatusCode) -> CacheError {
    if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
        tracing::debug!("Insufficient permissions to download `{url}`: {status}");
        CacheError::PermissionDenied(status.to_string())
    } else if status.is_client_error() {
        // If it's a client error, chances are it's a 404.
        tracing::debug!("Unexpected client error status code from `{url}`: {status}");
        CacheError::NotFound
    } else {
        tracing::debug!("Unexpected status code from `{url}`: {status}");
        CacheError::DownloadError(status.to_string())
    }
}
