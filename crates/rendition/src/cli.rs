//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future;

use rendition_service::config::Config;
use rendition_service::decode::ImageDecoder;
use rendition_service::metrics;
use rendition_service::services::Services;
use rendition_service::types::{Dimensions, ResourceId};

use crate::logging;

/// Rendition commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve resources and print the outcome of each.
    Fetch {
        /// URLs, absolute file paths or `asset:///` references.
        #[arg(required = true, value_name = "ID")]
        ids: Vec<String>,

        /// Width to decode the images for.
        #[arg(long, requires = "height")]
        width: Option<u32>,

        /// Height to decode the images for.
        #[arg(long, requires = "width")]
        height: Option<u32>,
    },

    /// Wipe the memory and persistent caches.
    Clear,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "rendition", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: no other threads have been started yet.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone()
            && let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok())
        {
            tags.insert(tag, name);
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("rendition-worker")
        .enable_all()
        .build()
        .context("failed to create the runtime")?;
    let services = Services::new(config, ImageDecoder, runtime.handle().clone())
        .context("failed to create services")?;

    match cli.command {
        Command::Fetch { ids, width, height } => {
            let size_hint = Dimensions::hint(width.unwrap_or(0), height.unwrap_or(0));
            runtime.block_on(fetch(&services, ids, size_hint))?;
        }
        Command::Clear => {
            runtime
                .block_on(services.cache().clear())
                .context("failed to clear caches")?;
            tracing::info!("Cleared all caches");
        }
    }

    Ok(())
}

/// Resolves all `ids` concurrently and prints one line per id.
async fn fetch(
    services: &Services<ImageDecoder>,
    ids: Vec<String>,
    size_hint: Option<Dimensions>,
) -> Result<()> {
    let ids: Vec<_> = ids.into_iter().map(ResourceId::from).collect();
    let fetches = ids
        .iter()
        .map(|id| services.fetcher().fetch(id, size_hint));
    let results = future::join_all(fetches).await;

    let mut failed = 0;
    for (id, result) in ids.iter().zip(results) {
        match result {
            Ok(image) => {
                println!("{id}: {} (original {})", image.dimensions(), image.original());
            }
            Err(error) => {
                failed += 1;
                println!("{id}: error: {error}");
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} resources failed", ids.len());
    }
    Ok(())
}
