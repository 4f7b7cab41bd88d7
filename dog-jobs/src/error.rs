use thiserror::Error;

use crate::types::JobState;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure errors for queue operations
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    /// The backing store could not be reached. Transient: retried with
    /// backoff and never counted as a job attempt.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A conditional commit lost the race: the job was not in `expected`.
    #[error("Conflict on job {job_id}: expected {expected}, found {actual}")]
    Conflict {
        job_id: String,
        expected: JobState,
        actual: JobState,
    },

    #[error("Handler already registered for job type: {0}")]
    DuplicateHandler(String),

    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid job options: {0}")]
    InvalidOptions(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Queue is closed")]
    QueueClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Only store outages are worth retrying at the infrastructure level
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Handler outcome on failure - determines retry behavior
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Retryable error - will schedule retry if attempts remain
    #[error("{0}")]
    Retryable(String),

    /// Permanent error - fail immediately, no retry
    #[error("{0}")]
    Permanent(String),
}

impl JobError {
    /// Create a retryable error
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) => msg,
        }
    }
}

impl From<String> for JobError {
    fn from(msg: String) -> Self {
        Self::Retryable(msg)
    }
}

impl From<&str> for JobError {
    fn from(msg: &str) -> Self {
        Self::Retryable(msg.to_string())
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_outages_are_retryable() {
        assert!(QueueError::StoreUnavailable("down".into()).is_retryable());
        assert!(!QueueError::DuplicateHandler("image".into()).is_retryable());
        assert!(!QueueError::Conflict {
            job_id: "1".into(),
            expected: JobState::Waiting,
            actual: JobState::Active,
        }
        .is_retryable());
    }

    #[test]
    fn plain_strings_become_retryable_job_errors() {
        let err: JobError = "task of jobType image failed".into();
        assert!(err.is_retryable());
        assert_eq!(err.message(), "task of jobType image failed");
        assert!(!JobError::permanent("bad payload").is_retryable());
    }
}
