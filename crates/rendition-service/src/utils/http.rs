use std::time::Duration;

use reqwest::redirect;

use crate::config::FetchConfig;

/// The user agent sent with every network fetch.
pub const USER_AGENT: &str = concat!("rendition/", env!("CARGO_PKG_VERSION"));

/// Maximum number of redirects followed by a single network fetch.
const MAX_REDIRECTS: usize = 10;

/// Various timeouts for all the downloaders
#[derive(Copy, Clone, Debug)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The timeout for each read from an established connection.
    pub read: Duration,
    /// Global timeout for one download.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            connect: config.connect_timeout,
            read: config.read_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self::from_config(&FetchConfig::default())
    }
}

/// Creates a [`reqwest::Client`] with the provided timeouts.
///
/// The client follows up to ten redirects. The overall `max_download` bound is not set on the
/// client, it is enforced per download by the `DownloadService`.
pub fn create_client(timeouts: &DownloadTimeouts) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .user_agent(USER_AGENT)
        .connect_timeout(timeouts.connect)
        .read_timeout(timeouts.read)
        .pool_idle_timeout(Duration::from_secs(30))
        .redirect(redirect::Policy::limited(MAX_REDIRECTS))
        .build()
}
