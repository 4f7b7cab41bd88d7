use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::JobId;

/// Owned lifecycle event published on the queue's event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobEvent {
    /// Job was stored and is ready to run
    Waiting {
        job_id: JobId,
        job_type: String,
        at: DateTime<Utc>,
    },

    /// Job is scheduled for later (initial delay or retry)
    Delayed {
        job_id: JobId,
        ready_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    /// Job was claimed by a worker
    Active {
        job_id: JobId,
        attempts_made: u32,
        at: DateTime<Utc>,
    },

    /// Job completed successfully
    Completed {
        job_id: JobId,
        result: Value,
        at: DateTime<Utc>,
    },

    /// An attempt failed; `attempts_remaining == 0` means the failure is final
    Failed {
        job_id: JobId,
        error: String,
        attempts_remaining: u32,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Waiting { .. } => "waiting",
            Self::Delayed { .. } => "delayed",
            Self::Active { .. } => "active",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    /// Get the job ID from any event
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Waiting { job_id, .. }
            | Self::Delayed { job_id, .. }
            | Self::Active { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. } => job_id,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Waiting { at, .. }
            | Self::Delayed { at, .. }
            | Self::Active { at, .. }
            | Self::Completed { at, .. }
            | Self::Failed { at, .. } => at,
        }
    }

    /// Completed, or failed with no attempts left
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Completed { .. } => true,
            Self::Failed { attempts_remaining, .. } => *attempts_remaining == 0,
            _ => false,
        }
    }
}
