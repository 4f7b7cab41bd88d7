use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use rand::Rng;

use crate::{JobError, JobRecord, Transition};

/// Computes the delay before a failed job becomes eligible again
pub trait BackoffPolicy: Send + Sync {
    /// `record` reflects the attempt that just failed (`attempts_made >= 1`)
    fn delay(&self, record: &JobRecord) -> Duration;
}

/// Fixed re-queue delay. Without an explicit delay the job's own
/// `delay_millis` is reused, which retries immediately for undelayed jobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedBackoff {
    delay: Option<Duration>,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }

    /// Reuse each job's own initial delay
    pub fn job_delay() -> Self {
        Self { delay: None }
    }
}

impl BackoffPolicy for FixedBackoff {
    fn delay(&self, record: &JobRecord) -> Duration {
        self.delay.unwrap_or_else(|| record.options.delay())
    }
}

/// `base * 2^(attempts_made - 1)`, capped at `max`, with optional jitter
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, jitter: false }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(3600))
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, record: &JobRecord) -> Duration {
        exponential_delay(self.base, self.max, record.attempts_made, self.jitter)
    }
}

/// Shared by job backoff and store-outage backoff
pub(crate) fn exponential_delay(
    base: Duration,
    max: Duration,
    attempt: u32,
    jitter: bool,
) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let delay = base.saturating_mul(1u32 << exponent).min(max);
    if jitter && !delay.is_zero() {
        // Spread within [delay/2, delay]
        let half = delay / 2;
        let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(spread)
    } else {
        delay
    }
}

/// What to do with a job whose latest attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `Delayed`, eligible again after `delay`
    Retry { delay: Duration, attempts_remaining: u32 },

    /// Terminal `Failed`
    Fail,
}

impl RetryDecision {
    /// Attempts left as reported on the `failed` event
    pub fn attempts_remaining(&self) -> u32 {
        match self {
            Self::Retry { attempts_remaining, .. } => *attempts_remaining,
            Self::Fail => 0,
        }
    }

    /// The conditional commit that realises this decision for the attempt
    /// `job` is running
    pub fn transition(&self, job: &JobRecord, error: &JobError, now: DateTime<Utc>) -> Transition {
        let transition = match self {
            Self::Retry { delay, .. } => {
                let ready_at = chrono::Duration::from_std(*delay)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay))
                    .unwrap_or(now);
                Transition::retry(error.message(), ready_at)
            }
            Self::Fail => Transition::fail(error.message()),
        };
        transition.expecting(job.attempts_made)
    }
}

/// Decides retry vs. permanent failure and the retry delay
#[derive(Clone)]
pub struct RetryPolicy {
    backoff: Arc<dyn BackoffPolicy>,
}

impl RetryPolicy {
    pub fn new(backoff: impl BackoffPolicy + 'static) -> Self {
        Self { backoff: Arc::new(backoff) }
    }

    /// `record` is the active job after the failed attempt was counted
    pub fn decide(&self, record: &JobRecord, error: &JobError) -> RetryDecision {
        let attempts_remaining = record.attempts_remaining();
        if !error.is_retryable() || attempts_remaining == 0 {
            return RetryDecision::Fail;
        }
        RetryDecision::Retry {
            delay: self.backoff.delay(record),
            attempts_remaining,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(FixedBackoff::job_delay())
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobId, JobOptions, JobState, NewJob};
    use serde_json::json;

    fn active(options: JobOptions, attempts_made: u32) -> JobRecord {
        let job = NewJob::new("image", json!({"username": "ann"}), options);
        let mut record = JobRecord::new(JobId::new(), "q", job, Utc::now()).unwrap();
        record.state = JobState::Active;
        record.attempts_made = attempts_made;
        record
    }

    #[test]
    fn retries_while_attempts_remain() {
        let policy = RetryPolicy::default();
        let record = active(JobOptions::new().with_attempts(4), 1);

        let decision = policy.decide(&record, &JobError::retryable("boom"));
        assert_eq!(decision, RetryDecision::Retry { delay: Duration::ZERO, attempts_remaining: 3 });
    }

    #[test]
    fn fails_on_last_attempt() {
        let policy = RetryPolicy::default();
        let record = active(JobOptions::new().with_attempts(4), 4);

        let decision = policy.decide(&record, &JobError::retryable("boom"));
        assert_eq!(decision, RetryDecision::Fail);
        assert_eq!(decision.attempts_remaining(), 0);
    }

    #[test]
    fn permanent_errors_skip_remaining_attempts() {
        let policy = RetryPolicy::default();
        let record = active(JobOptions::new().with_attempts(4), 1);

        assert_eq!(policy.decide(&record, &JobError::permanent("bad")), RetryDecision::Fail);
    }

    #[test]
    fn fixed_backoff_reuses_job_delay() {
        let record = active(JobOptions::new().with_delay_millis(2000).with_attempts(2), 1);
        assert_eq!(FixedBackoff::job_delay().delay(&record), Duration::from_millis(2000));
        let fixed = FixedBackoff::new(Duration::from_millis(5));
        assert_eq!(fixed.delay(&record), Duration::from_millis(5));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(350));
        let delays: Vec<_> = (1..=4)
            .map(|n| backoff.delay(&active(JobOptions::new().with_attempts(10), n)))
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(350),
                Duration::from_millis(350),
            ]
        );
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(1000), Duration::from_secs(10))
                .with_jitter();
        for _ in 0..100 {
            let delay = backoff.delay(&active(JobOptions::new().with_attempts(3), 1));
            assert!(delay >= Duration::from_millis(500) && delay <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn retry_transition_targets_delayed() {
        let now = Utc::now();
        let decision = RetryDecision::Retry {
            delay: Duration::from_millis(250),
            attempts_remaining: 2,
        };
        let job = active(JobOptions::new().with_attempts(3), 1);
        let transition = decision.transition(&job, &JobError::retryable("boom"), now);

        assert_eq!(transition.from, JobState::Active);
        assert_eq!(transition.to, JobState::Delayed);
        assert_eq!(transition.ready_at, Some(now + chrono::Duration::milliseconds(250)));
        assert_eq!(transition.last_error.as_deref(), Some("boom"));
        assert_eq!(transition.expected_attempts, Some(1));
    }
}
