use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::fetch::RetryPolicy;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: match env::var("STATSD_SERVER") {
                Ok(metrics_statsd) => Some(metrics_statsd),
                Err(_) => None,
            },
            prefix: "rendition".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Sizing of the in-memory cache of decoded payloads.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct InMemoryCacheConfig {
    /// Capacity (in bytes) of the in-memory cache.
    ///
    /// When unset, the capacity is derived from [`memory_fraction`](Self::memory_fraction).
    pub capacity: Option<u64>,

    /// Fraction of the total system memory the in-memory cache may use.
    ///
    /// Must be within `(0, 1]`. Defaults to `0.125`.
    pub memory_fraction: f64,
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            memory_fraction: 0.125,
        }
    }
}

impl InMemoryCacheConfig {
    /// Used when the total system memory can not be determined.
    const FALLBACK_SYSTEM_MEMORY: u64 = 1024 * 1024 * 1024;

    /// Resolves the byte budget of the in-memory cache.
    pub fn capacity(&self) -> u64 {
        if let Some(capacity) = self.capacity {
            return capacity;
        }

        let mut system = sysinfo::System::new();
        system.refresh_memory();
        let total = match system.total_memory() {
            0 => Self::FALLBACK_SYSTEM_MEMORY,
            total => total,
        };

        (total as f64 * self.memory_fraction) as u64
    }
}

/// Bounds of the persistent cache of downloaded bytes.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct PersistentCacheConfig {
    /// Whether downloaded bytes are persisted at all.
    pub enabled: bool,

    /// Maximum total size (in bytes) of all persisted entries.
    ///
    /// Defaults to `100 MiB (= 104_857_600)`.
    pub max_size: u64,
}

impl Default for PersistentCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 100 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfigs {
    /// Configuration of the in-memory cache.
    pub in_memory: InMemoryCacheConfig,

    /// Configuration of the persistent cache.
    pub persistent: PersistentCacheConfig,

    /// Whether a hit in the persistent cache is written back into the in-memory cache.
    pub repopulate_memory_on_disk_hit: bool,
}

impl Default for CacheConfigs {
    fn default() -> Self {
        Self {
            in_memory: InMemoryCacheConfig::default(),
            persistent: PersistentCacheConfig::default(),
            repopulate_memory_on_disk_hit: true,
        }
    }
}

/// Fetching and failure handling.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FetchConfig {
    /// Number of fetches that run at the same time. Further fetches are queued.
    pub workers: usize,

    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for reading from an established connection.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Global timeout for one fetch.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// Whether a recorded failure keeps a resource from being fetched again.
    pub retry_policy: RetryPolicy,

    /// How long a resource is refused after its first failure, under
    /// [`RetryPolicy::WithBackoff`].
    #[serde(with = "humantime_serde")]
    pub backoff_initial: Duration,

    /// Upper bound for the doubling backoff, under [`RetryPolicy::WithBackoff`].
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,

    /// Maximum number of failed resources that are remembered.
    pub failure_capacity: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            max_download_timeout: Duration::from_secs(5 * 60),
            retry_policy: RetryPolicy::WithBackoff,
            backoff_initial: Duration::from_secs(5),
            backoff_max: Duration::from_secs(60 * 60),
            failure_capacity: 10_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Preferred root directory of the persistent cache.
    pub cache_dir: Option<PathBuf>,

    /// Root directory of the persistent cache if [`cache_dir`](Self::cache_dir) is unset or
    /// unusable.
    pub fallback_cache_dir: Option<PathBuf>,

    /// Generation of the persistent cache.
    ///
    /// Changing this invalidates all previously persisted entries.
    pub generation: u32,

    /// Directory that `asset:///` resources are resolved against.
    pub assets_dir: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Cache tier configuration.
    pub caches: CacheConfigs,

    /// Fetch configuration.
    pub fetch: FetchConfig,
}

impl Config {
    /// The directories a persistent cache may be opened in, in order of preference.
    pub fn cache_dir_candidates(&self) -> Vec<PathBuf> {
        self.cache_dir
            .iter()
            .chain(self.fallback_cache_dir.iter())
            .cloned()
            .collect()
    }

    /// Checks invariants that serde can not express.
    pub fn validate(&self) -> Result<()> {
        let fraction = self.caches.in_memory.memory_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            anyhow::bail!("caches.in_memory.memory_fraction must be within (0, 1], got {fraction}");
        }
        if self.fetch.workers == 0 {
            anyhow::bail!("fetch.workers must be at least 1");
        }
        if self.caches.persistent.enabled && self.caches.persistent.max_size == 0 {
            anyhow::bail!("caches.persistent.max_size must not be 0");
        }
        Ok(())
    }
}

/// Default value for the "fallback_cache_dir" configuration.
fn default_fallback_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("rendition"))
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            fallback_cache_dir: default_fallback_cache_dir(),
            generation: 1,
            assets_dir: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfigs::default(),
            fetch: FetchConfig::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let config: Self = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
