use serde::{Deserialize, Serialize};
use std::fmt;

/// Job lifecycle state. A job occupies exactly one of these at any instant.
///
/// ```text
/// Waiting ──────────────┐
///    │                  ▼
///    └──► Delayed ◄──► Active ──► Completed
///                        │
///                        └──────► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Ready to run as soon as a worker slot and the limiter allow
    Waiting,

    /// Scheduled for future eligibility (initial delay or retry)
    Delayed,

    /// Claimed by a worker and executing
    Active,

    /// Terminal: handler returned a result
    Completed,

    /// Terminal: attempts exhausted or permanent error
    Failed,
}

impl JobState {
    /// All states, in lifecycle order
    pub fn all() -> &'static [JobState] {
        &[
            Self::Waiting,
            Self::Delayed,
            Self::Active,
            Self::Completed,
            Self::Failed,
        ]
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// States a dispatcher may claim from
    pub fn is_dispatchable(self) -> bool {
        matches!(self, Self::Waiting | Self::Delayed)
    }

    /// Whether `self -> to` is a legal edge of the lifecycle
    pub fn can_transition_to(self, to: JobState) -> bool {
        matches!(
            (self, to),
            (Self::Waiting, Self::Active)
                | (Self::Waiting, Self::Delayed)
                | (Self::Delayed, Self::Active)
                | (Self::Active, Self::Completed)
                | (Self::Active, Self::Delayed)
                | (Self::Active, Self::Failed)
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "waiting" => Ok(Self::Waiting),
            "delayed" => Ok(Self::Delayed),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job state: {}", s)),
        }
    }
}

/// Number of jobs per state bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn get(&self, state: JobState) -> usize {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Delayed => self.delayed,
            JobState::Active => self.active,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
        }
    }

    pub fn add(&mut self, state: JobState, n: usize) {
        match state {
            JobState::Waiting => self.waiting += n,
            JobState::Delayed => self.delayed += n,
            JobState::Active => self.active += n,
            JobState::Completed => self.completed += n,
            JobState::Failed => self.failed += n,
        }
    }

    /// Jobs that have not reached a terminal state
    pub fn pending(&self) -> usize {
        self.waiting + self.delayed + self.active
    }

    pub fn total(&self) -> usize {
        self.pending() + self.completed + self.failed
    }
}
