use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::{BackoffPolicy, RetryPolicy};
use crate::{QueueError, QueueResult};

const MIN_STALL_INTERVAL: Duration = Duration::from_millis(10);

/// Dispatch rate limit: at most `max` dispatches per rolling `duration`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterConfig {
    pub max: u32,
    pub duration: Duration,
}

impl LimiterConfig {
    pub fn new(max: u32, duration: Duration) -> Self {
        Self { max, duration }
    }

    pub fn per_millis(max: u32, duration_millis: u64) -> Self {
        Self::new(max, Duration::from_millis(duration_millis))
    }
}

/// Configuration for a queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// `memory://` or `redis://host:port[/db]`
    pub store_address: String,
    /// Optional dispatch rate limit
    pub limiter: Option<LimiterConfig>,
    /// In-flight jobs per job type unless set per handler
    pub default_concurrency: usize,
    /// Idle polling granularity of the dispatcher
    pub poll_interval: Duration,
    /// First backoff step after a store outage
    pub store_retry_base: Duration,
    /// Backoff cap for store outages
    pub store_retry_max: Duration,
    /// Key namespace for networked stores
    pub key_prefix: String,
    /// Closed set of accepted job types; `None` accepts any type
    pub job_types: Option<Vec<String>>,
    /// Retry delay after a failed attempt
    pub retry: RetryPolicy,
    /// An `Active` job without a worker heartbeat for this long is treated
    /// as a failed attempt. `None` disables the sweep.
    pub stall_interval: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            store_address: "memory://".to_string(),
            limiter: None,
            default_concurrency: 1,
            poll_interval: Duration::from_millis(50),
            store_retry_base: Duration::from_millis(100),
            store_retry_max: Duration::from_secs(5),
            key_prefix: "dog".to_string(),
            job_types: None,
            retry: RetryPolicy::default(),
            stall_interval: Some(Duration::from_secs(30)),
        }
    }
}

impl QueueConfig {
    pub fn new(store_address: impl Into<String>) -> Self {
        Self {
            store_address: store_address.into(),
            ..Self::default()
        }
    }

    pub fn with_limiter(mut self, max: u32, duration: Duration) -> Self {
        self.limiter = Some(LimiterConfig::new(max, duration));
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.default_concurrency = concurrency;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_store_retry(mut self, base: Duration, max: Duration) -> Self {
        self.store_retry_base = base;
        self.store_retry_max = max;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_job_types<I, S>(mut self, job_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.job_types = Some(job_types.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_backoff(mut self, backoff: impl BackoffPolicy + 'static) -> Self {
        self.retry = RetryPolicy::new(backoff);
        self
    }

    pub fn with_stall_interval(mut self, stall_interval: Duration) -> Self {
        self.stall_interval = Some(stall_interval);
        self
    }

    /// Never recover `Active` jobs, e.g. when handlers block their runtime
    pub fn without_stall_recovery(mut self) -> Self {
        self.stall_interval = None;
        self
    }

    /// Load configuration from `{PREFIX}_*` environment variables, falling
    /// back to defaults for anything unset
    pub fn from_env(prefix: &str) -> QueueResult<Self> {
        let mut config = Self::default();

        if let Some(address) = env_var(prefix, "STORE_ADDRESS") {
            config.store_address = address;
        }

        let limiter_max: Option<u32> = env_parse(prefix, "LIMITER_MAX")?;
        let limiter_ms: Option<u64> = env_parse(prefix, "LIMITER_DURATION_MS")?;
        config.limiter = match (limiter_max, limiter_ms) {
            (Some(max), Some(ms)) => Some(LimiterConfig::per_millis(max, ms)),
            (None, None) => None,
            _ => {
                return Err(QueueError::Config(format!(
                    "{prefix}_LIMITER_MAX and {prefix}_LIMITER_DURATION_MS must be set together"
                )))
            }
        };

        if let Some(concurrency) = env_parse(prefix, "CONCURRENCY")? {
            config.default_concurrency = concurrency;
        }
        if let Some(ms) = env_parse(prefix, "POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>(prefix, "STALL_INTERVAL_MS")? {
            config.stall_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(key_prefix) = env_var(prefix, "KEY_PREFIX") {
            config.key_prefix = key_prefix;
        }
        if let Some(types) = env_var(prefix, "JOB_TYPES") {
            config.job_types = Some(
                types
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect(),
            );
        }

        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> QueueResult<()> {
        if let Some(limiter) = self.limiter {
            if limiter.max == 0 {
                return Err(QueueError::Config("limiter max must be at least 1".to_string()));
            }
            if limiter.duration.is_zero() {
                return Err(QueueError::Config("limiter duration must be positive".to_string()));
            }
        }
        if self.default_concurrency == 0 {
            return Err(QueueError::Config("concurrency must be at least 1".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(QueueError::Config("poll interval must be positive".to_string()));
        }
        if self.store_retry_base.is_zero() || self.store_retry_max < self.store_retry_base {
            return Err(QueueError::Config(
                "store retry backoff must be positive and max >= base".to_string(),
            ));
        }
        if self.stall_interval.is_some_and(|interval| interval < MIN_STALL_INTERVAL) {
            return Err(QueueError::Config(format!(
                "stall interval must be at least {}ms",
                MIN_STALL_INTERVAL.as_millis()
            )));
        }
        Ok(())
    }
}

fn env_var(prefix: &str, key: &str) -> Option<String> {
    env::var(format!("{prefix}_{key}")).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(prefix: &str, key: &str) -> QueueResult<Option<T>> {
    match env_var(prefix, key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| QueueError::Config(format!("{prefix}_{key}: cannot parse '{raw}'"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = QueueConfig::default();
        assert_eq!(config.store_address, "memory://");
        assert!(config.limiter.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_limiter() {
        let config = QueueConfig::default().with_limiter(0, Duration::from_secs(1));
        assert!(matches!(config.validate(), Err(QueueError::Config(_))));

        let config = QueueConfig::default().with_limiter(1, Duration::ZERO);
        assert!(config.validate().is_err());
    }

    // Each test uses its own prefix; the process environment is shared.
    #[test]
    fn loads_from_env() {
        env::set_var("DOGJOBS_T1_STORE_ADDRESS", "redis://localhost:6379");
        env::set_var("DOGJOBS_T1_LIMITER_MAX", "1");
        env::set_var("DOGJOBS_T1_LIMITER_DURATION_MS", "1000");
        env::set_var("DOGJOBS_T1_JOB_TYPES", "image, video");
        env::set_var("DOGJOBS_T1_STALL_INTERVAL_MS", "0");

        let config = QueueConfig::from_env("DOGJOBS_T1").unwrap();
        assert_eq!(config.store_address, "redis://localhost:6379");
        assert_eq!(config.limiter, Some(LimiterConfig::per_millis(1, 1000)));
        assert_eq!(config.job_types, Some(vec!["image".to_string(), "video".to_string()]));
        assert_eq!(config.default_concurrency, 1);
        assert_eq!(config.stall_interval, None);
    }

    #[test]
    fn rejects_tiny_stall_interval() {
        let config = QueueConfig::default().with_stall_interval(Duration::from_millis(1));
        assert!(matches!(config.validate(), Err(QueueError::Config(_))));
        assert!(QueueConfig::default().without_stall_recovery().validate().is_ok());
    }

    #[test]
    fn malformed_env_is_a_config_error() {
        env::set_var("DOGJOBS_T2_CONCURRENCY", "lots");
        assert!(matches!(QueueConfig::from_env("DOGJOBS_T2"), Err(QueueError::Config(_))));

        env::set_var("DOGJOBS_T3_LIMITER_MAX", "2");
        assert!(matches!(QueueConfig::from_env("DOGJOBS_T3"), Err(QueueError::Config(_))));
    }
}
