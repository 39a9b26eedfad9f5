use std::error::Error;
use std::time::Duration;

use thiserror::Error;

/// An error that happens when resolving a resource into a rendition.
///
/// This is the single failure type delivered to waiters. Cancellation is not an error and never
/// produces a `CacheError`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The resource was not found at its source.
    #[error("not found")]
    NotFound,
    /// The resource could not be fetched due to missing permissions.
    ///
    /// The attached string contains the source's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The resource could not be fetched due to a timeout.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The resource could not be fetched due to another problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    ///
    /// The attached string contains the source's response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The resource was fetched successfully, but could not be decoded.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The resource identifier does not name anything that can be fetched.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// An unexpected error in the service itself.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: Error + 'static>(e: E) -> Self {
        let dynerr: &dyn Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// Builds a [`DownloadError`](Self::DownloadError) from the innermost cause of `error`.
    pub(crate) fn download_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::DownloadError(error_string)
    }

    /// A short, stable name for this error, used as a metrics tag.
    pub fn as_tag(&self) -> &'static str {
        match self {
            CacheError::NotFound => "notfound",
            CacheError::PermissionDenied(_) => "permissiondenied",
            CacheError::Timeout(_) => "timeout",
            CacheError::DownloadError(_) => "downloaderror",
            CacheError::Malformed(_) => "malformed",
            CacheError::Unsupported(_) => "unsupported",
            CacheError::InternalError => "internalerror",
        }
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(error: reqwest::Error) -> Self {
        Self::download_error(&error)
    }
}

/// The outcome of resolving a resource, containing either `Ok(T)` or an error denoting the
/// reason why it could not be fetched or is otherwise unusable.
pub type CacheContents<T = ()> = Result<T, CacheError>;
