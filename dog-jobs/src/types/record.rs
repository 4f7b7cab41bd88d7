use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{JobId, JobOptions, JobState};
use crate::{QueueError, QueueResult};

/// Job submission - what a producer hands to the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    /// Job type tag used to pick the handler
    pub job_type: String,

    /// Payload, copied at enqueue time
    pub payload: Value,

    pub options: JobOptions,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: Value, options: JobOptions) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            options,
        }
    }
}

/// Job record - durable runtime state owned by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job identifier
    pub id: JobId,

    /// Queue the job belongs to
    pub queue: String,

    pub job_type: String,

    pub payload: Value,

    pub options: JobOptions,

    /// Execution attempts started so far
    pub attempts_made: u32,

    pub state: JobState,

    pub created_at: DateTime<Utc>,

    /// Earliest instant the job may be dispatched
    pub ready_at: DateTime<Utc>,

    /// When the latest attempt started
    pub processed_at: Option<DateTime<Utc>>,

    /// Last sign of life from the worker running the latest attempt
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,

    /// Set only when `state == Completed`
    pub result: Option<Value>,

    /// Error of the latest failed attempt
    pub last_error: Option<String>,
}

impl JobRecord {
    /// Create a new record in `Waiting`, or `Delayed` when a delay was requested.
    /// Fails with `InvalidOptions` when the delay lands outside the calendar.
    pub fn new(
        id: JobId,
        queue: impl Into<String>,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> QueueResult<Self> {
        let ready_at = i64::try_from(job.options.delay_millis)
            .ok()
            .and_then(ChronoDuration::try_milliseconds)
            .and_then(|delay| now.checked_add_signed(delay))
            .ok_or_else(|| {
                QueueError::InvalidOptions(format!(
                    "delay_millis out of range: {}",
                    job.options.delay_millis
                ))
            })?;
        let state = if job.options.delay_millis > 0 {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        Ok(Self {
            id,
            queue: queue.into(),
            job_type: job.job_type,
            payload: job.payload,
            options: job.options,
            attempts_made: 0,
            state,
            created_at: now,
            ready_at,
            processed_at: None,
            heartbeat_at: None,
            finished_at: None,
            result: None,
            last_error: None,
        })
    }

    /// Eligible for dispatch at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Waiting => true,
            JobState::Delayed => self.ready_at <= now,
            _ => false,
        }
    }

    /// Attempts left before the job fails permanently
    pub fn attempts_remaining(&self) -> u32 {
        self.options.max_attempts.saturating_sub(self.attempts_made)
    }

    /// Attempt with no heartbeat since `cutoff`
    pub fn is_stalled(&self, cutoff: DateTime<Utc>) -> bool {
        self.state == JobState::Active
            && self
                .heartbeat_at
                .or(self.processed_at)
                .map_or(true, |seen| seen < cutoff)
    }

    /// Conditionally apply a transition. Fails with `Conflict` unless the job
    /// is still in `transition.from` with the attempt count the caller saw,
    /// and, for a delayed claim, its ready time has passed. Backends call
    /// this inside their atomic section.
    pub fn apply(&mut self, transition: &Transition, now: DateTime<Utc>) -> QueueResult<()> {
        let stale_attempt = transition
            .expected_attempts
            .is_some_and(|seen| seen != self.attempts_made);
        let early_claim = self.state == JobState::Delayed
            && transition.to == JobState::Active
            && self.ready_at > now;
        if self.state != transition.from || stale_attempt || early_claim {
            return Err(QueueError::Conflict {
                job_id: self.id.to_string(),
                expected: transition.from,
                actual: self.state,
            });
        }

        let renewal = transition.from == JobState::Active && transition.to == JobState::Active;
        if !renewal && !transition.from.can_transition_to(transition.to) {
            return Err(QueueError::Internal(format!(
                "illegal transition {} -> {} for job {}",
                transition.from, transition.to, self.id
            )));
        }

        let attempts_made = if transition.to == JobState::Active && !renewal {
            self.attempts_made.saturating_add(1)
        } else {
            self.attempts_made
        };
        if attempts_made > self.options.max_attempts {
            return Err(QueueError::Internal(format!(
                "job {} would exceed max attempts ({} > {})",
                self.id, attempts_made, self.options.max_attempts
            )));
        }

        self.state = transition.to;
        self.attempts_made = attempts_made;

        if let Some(ready_at) = transition.ready_at {
            self.ready_at = ready_at;
        }
        if let Some(ref error) = transition.last_error {
            self.last_error = Some(error.clone());
        }

        match transition.to {
            JobState::Active if renewal => self.heartbeat_at = Some(now),
            JobState::Active => {
                self.processed_at = Some(now);
                self.heartbeat_at = Some(now);
            }
            JobState::Completed => {
                self.result = Some(transition.result.clone().unwrap_or(Value::Null));
                self.finished_at = Some(now);
            }
            JobState::Failed => self.finished_at = Some(now),
            JobState::Waiting | JobState::Delayed => {}
        }

        Ok(())
    }
}

/// A conditional state change requested from the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// State the job must currently be in for the commit to succeed
    pub from: JobState,
    pub to: JobState,
    /// `attempts_made` the caller observed; any other value is a conflict
    pub expected_attempts: Option<u32>,
    pub ready_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub last_error: Option<String>,
}

impl Transition {
    fn new(from: JobState, to: JobState) -> Self {
        Self {
            from,
            to,
            expected_attempts: None,
            ready_at: None,
            result: None,
            last_error: None,
        }
    }

    /// Claim a dispatchable job for execution, counting the attempt.
    /// Conflicts if the job changed since `record` was read.
    pub fn claim(record: &JobRecord) -> Self {
        Self::new(record.state, JobState::Active).expecting(record.attempts_made)
    }

    /// Keep a running attempt from being treated as stalled
    pub fn renew(record: &JobRecord) -> Self {
        Self::new(JobState::Active, JobState::Active).expecting(record.attempts_made)
    }

    pub fn complete(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::new(JobState::Active, JobState::Completed)
        }
    }

    /// Return a failed attempt to `Delayed` until `ready_at`
    pub fn retry(error: impl Into<String>, ready_at: DateTime<Utc>) -> Self {
        Self {
            ready_at: Some(ready_at),
            last_error: Some(error.into()),
            ..Self::new(JobState::Active, JobState::Delayed)
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            last_error: Some(error.into()),
            ..Self::new(JobState::Active, JobState::Failed)
        }
    }

    /// Only commit while the job is still on attempt `attempts_made`
    pub fn expecting(mut self, attempts_made: u32) -> Self {
        self.expected_attempts = Some(attempts_made);
        self
    }
}
