use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{QueueError, QueueResult};

/// Per-job submission options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
    /// Milliseconds before the job first becomes eligible
    pub delay_millis: u64,

    /// Total number of execution attempts, at least 1
    pub max_attempts: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay_millis: 0,
            max_attempts: 1,
        }
    }
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial delay
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_millis = delay.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    /// Set the initial delay in milliseconds
    pub fn with_delay_millis(mut self, delay_millis: u64) -> Self {
        self.delay_millis = delay_millis;
        self
    }

    /// Set the maximum number of attempts
    pub fn with_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_millis)
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.max_attempts == 0 {
            return Err(QueueError::InvalidOptions(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.delay_millis > i64::MAX as u64 {
            return Err(QueueError::InvalidOptions(format!(
                "delay_millis out of range: {}",
                self.delay_millis
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_single_immediate_attempt() {
        let opts = JobOptions::default();
        assert_eq!(opts.delay_millis, 0);
        assert_eq!(opts.max_attempts, 1);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let err = JobOptions::new().with_attempts(0).validate().unwrap_err();
        assert!(matches!(err, QueueError::InvalidOptions(_)));
    }

    #[test]
    fn deserializes_partial_camel_case() {
        let opts: JobOptions = serde_json::from_str(r#"{"maxAttempts": 4}"#).unwrap();
        assert_eq!(opts, JobOptions::new().with_attempts(4));
    }
}
