//! Creates all internal services from a [`Config`].
//!
//! There are no process-wide singletons: every component is constructed here and handed to the
//! components that need it. Tests construct isolated instances the same way.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::caching::{CacheCoordinator, MemoryStore, PersistentStore};
use crate::config::Config;
use crate::decode::Decoder;
use crate::download::DownloadService;
use crate::fetch::{FailureRecord, FetchCoordinator};

/// All services, wired together.
#[derive(Debug)]
pub struct Services<D: Decoder> {
    config: Arc<Config>,
    downloader: Arc<DownloadService>,
    fetcher: FetchCoordinator<D>,
}

impl<D: Decoder> Services<D> {
    /// Creates all services.
    ///
    /// Background work (fetches, file-system access and decoding) runs on `runtime`. An invalid
    /// config is an error, an unusable cache directory is not: the service then runs without a
    /// persistent cache.
    pub fn new(config: Config, decoder: D, runtime: tokio::runtime::Handle) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let memory = Arc::new(MemoryStore::new(config.caches.in_memory.capacity()));
        tracing::debug!(capacity = memory.capacity(), "Created memory cache");

        let persistent = open_persistent(&config);
        let cache = CacheCoordinator::new(
            memory,
            persistent,
            Arc::new(decoder),
            runtime.clone(),
            config.caches.repopulate_memory_on_disk_hit,
        );

        let downloader = DownloadService::new(&config, runtime.clone())
            .context("failed to create download service")?;
        let failures = FailureRecord::from_config(&config.fetch);
        let fetcher = FetchCoordinator::new(cache, downloader.clone(), failures, runtime);

        Ok(Self {
            config: Arc::new(config),
            downloader,
            fetcher,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn downloader(&self) -> &Arc<DownloadService> {
        &self.downloader
    }

    pub fn fetcher(&self) -> &FetchCoordinator<D> {
        &self.fetcher
    }

    pub fn cache(&self) -> &CacheCoordinator<D> {
        self.fetcher.cache()
    }
}

fn open_persistent(config: &Config) -> Option<PersistentStore> {
    if !config.caches.persistent.enabled {
        return None;
    }

    let candidates = config.cache_dir_candidates();
    if candidates.is_empty() {
        tracing::warn!("No cache directory configured, running without persistent cache");
        return None;
    }

    match PersistentStore::open(
        &candidates,
        config.generation,
        config.caches.persistent.max_size,
    ) {
        Ok(store) => Some(store),
        Err(e) => {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                "Failed to open persistent cache, running without it"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::decode::ImageDecoder;
    use crate::test;

    #[tokio::test]
    async fn test_fallback_cache_dir() {
        test::setup();
        let dir = test::tempdir();
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let config = Config {
            cache_dir: Some(blocker.join("cache")),
            fallback_cache_dir: Some(dir.path().join("fallback")),
            ..Default::default()
        };
        let services =
            Services::new(config, ImageDecoder, tokio::runtime::Handle::current()).unwrap();

        let store = services.cache().persistent().unwrap();
        assert_eq!(store.directory(), dir.path().join("fallback"));
    }

    #[tokio::test]
    async fn test_persistent_disabled() {
        test::setup();
        let dir = test::tempdir();

        let mut config = Config {
            cache_dir: Some(dir.path().to_owned()),
            ..Default::default()
        };
        config.caches.persistent.enabled = false;
        let services =
            Services::new(config, ImageDecoder, tokio::runtime::Handle::current()).unwrap();

        assert!(services.cache().persistent().is_none());
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let mut config = Config::default();
        config.fetch.workers = 0;

        let error = Services::new(config, ImageDecoder, tokio::runtime::Handle::current())
            .unwrap_err();
        insta::assert_snapshot!(format!("{error:#}"), @"invalid configuration: fetch.workers must be at least 1");
    }
}
