use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::caching::{CacheContents, CacheError};
use crate::config::FetchConfig;
use crate::types::ResourceId;

/// Whether a recorded failure keeps later requests for the same resource from being fetched.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// A failed resource is never fetched again, until its failure is cleared.
    Never,
    /// Failures are recorded, but every request fetches again.
    Always,
    /// A failed resource is fetched again once a backoff has passed. The backoff doubles with
    /// every consecutive failure.
    #[default]
    WithBackoff,
}

#[derive(Clone, Debug)]
struct FailureEntry {
    /// The error of the most recent failure.
    error: CacheError,
    /// The number of consecutive failures.
    count: u32,
    last_failure: Instant,
}

/// A record of resources which recently failed to fetch or decode.
///
/// Depending on the [`RetryPolicy`], [`check`](Self::check) short-circuits requests for such
/// resources. The record is bounded, the least recently used failures are forgotten first.
#[derive(Clone, Debug)]
pub struct FailureRecord {
    policy: RetryPolicy,
    backoff_initial: Duration,
    backoff_max: Duration,
    failures: moka::sync::Cache<ResourceId, FailureEntry>,
}

impl FailureRecord {
    pub fn new(
        policy: RetryPolicy,
        backoff_initial: Duration,
        backoff_max: Duration,
        capacity: u64,
    ) -> Self {
        Self {
            policy,
            backoff_initial,
            backoff_max,
            failures: moka::sync::Cache::builder().max_capacity(capacity).build(),
        }
    }

    pub fn from_config(config: &FetchConfig) -> Self {
        Self::new(
            config.retry_policy,
            config.backoff_initial,
            config.backoff_max,
            config.failure_capacity,
        )
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Registers a failure of `id`.
    pub fn record(&self, id: &ResourceId, error: &CacheError) {
        tracing::trace!(%id, %error, "Registering fetch failure");

        self.failures
            .entry_by_ref(id)
            .and_upsert_with(|previous| FailureEntry {
                error: error.clone(),
                count: previous.map_or(0, |entry| entry.into_value().count) + 1,
                last_failure: Instant::now(),
            });
    }

    /// Returns an error if requests for `id` should not be fetched right now.
    pub fn check(&self, id: &ResourceId) -> CacheContents {
        let Some(entry) = self.failures.get(id) else {
            return Ok(());
        };

        match self.policy {
            RetryPolicy::Always => Ok(()),
            RetryPolicy::Never => Err(self.format_error(&entry, None)),
            RetryPolicy::WithBackoff => {
                let backoff = self.backoff(entry.count);
                let elapsed = entry.last_failure.elapsed();
                if elapsed < backoff {
                    Err(self.format_error(&entry, Some(backoff - elapsed)))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Forgets all failures of `id`.
    pub fn clear(&self, id: &ResourceId) {
        self.failures.invalidate(id);
    }

    /// Whether a failure is currently recorded for `id`, regardless of the policy.
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.failures.contains_key(id)
    }

    /// The backoff after `count` consecutive failures.
    fn backoff(&self, count: u32) -> Duration {
        let exponent = count.saturating_sub(1).min(31);
        self.backoff_initial
            .saturating_mul(1 << exponent)
            .min(self.backoff_max)
    }

    /// Creates the `CacheError` returned for a short-circuited request.
    fn format_error(&self, entry: &FailureEntry, remaining: Option<Duration>) -> CacheError {
        let retry = match remaining {
            Some(remaining) => format!(
                "It will not be fetched again for {}",
                humantime::format_duration(Duration::from_secs(remaining.as_secs().max(1)))
            ),
            None => "It will not be fetched again".to_owned(),
        };
        CacheError::DownloadError(format!(
            "Resource failed {} time(s) recently. {retry}. The last error was: `{}`.",
            entry.count, entry.error,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(policy: RetryPolicy, backoff_initial: Duration) -> FailureRecord {
        FailureRecord::new(policy, backoff_initial, Duration::from_secs(60), 100)
    }

    #[test]
    fn test_never_retries() {
        let failures = record(RetryPolicy::Never, Duration::ZERO);
        let id = ResourceId::new("https://example.com/broken.png");

        assert_eq!(failures.check(&id), Ok(()));
        failures.record(&id, &CacheError::NotFound);

        assert!(failures.contains(&id));
        let error = failures.check(&id).unwrap_err();
        insta::assert_snapshot!(error.to_string(), @"download failed: Resource failed 1 time(s) recently. It will not be fetched again. The last error was: `not found`.");

        failures.clear(&id);
        assert!(!failures.contains(&id));
        assert_eq!(failures.check(&id), Ok(()));
    }

    #[test]
    fn test_always_retries() {
        let failures = record(RetryPolicy::Always, Duration::from_secs(60));
        let id = ResourceId::new("https://example.com/broken.png");

        failures.record(&id, &CacheError::NotFound);
        assert!(failures.contains(&id));
        assert_eq!(failures.check(&id), Ok(()));
    }

    #[test]
    fn test_backoff() {
        let failures = record(RetryPolicy::WithBackoff, Duration::from_secs(60));
        let id = ResourceId::new("https://example.com/broken.png");

        failures.record(&id, &CacheError::Timeout(Duration::from_secs(30)));
        assert!(matches!(
            failures.check(&id),
            Err(CacheError::DownloadError(_))
        ));

        let other = ResourceId::new("https://example.com/fine.png");
        assert_eq!(failures.check(&other), Ok(()));
    }

    #[test]
    fn test_backoff_elapsed() {
        let failures = record(RetryPolicy::WithBackoff, Duration::from_millis(10));
        let id = ResourceId::new("https://example.com/flaky.png");

        failures.record(&id, &CacheError::DownloadError("reset".into()));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(failures.check(&id), Ok(()));
    }

    #[test]
    fn test_backoff_doubles() {
        let failures = FailureRecord::new(
            RetryPolicy::WithBackoff,
            Duration::from_secs(5),
            Duration::from_secs(60),
            100,
        );

        assert_eq!(failures.backoff(1), Duration::from_secs(5));
        assert_eq!(failures.backoff(2), Duration::from_secs(10));
        assert_eq!(failures.backoff(4), Duration::from_secs(40));
        assert_eq!(failures.backoff(5), Duration::from_secs(60));
        assert_eq!(failures.backoff(100), Duration::from_secs(60));
    }
}
