pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    QueueResult, JobId, JobRecord, JobState, JobCounts, NewJob, Transition,
};

/// Store adapter: the only component that touches durable state.
///
/// Every method may fail with `QueueError::StoreUnavailable`, which callers
/// treat as transient. Job records are owned by the backend; anything the
/// engine holds in memory is a snapshot that must be revalidated through
/// `commit_transition` before acting on it.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Persist a new job in `Waiting` (or `Delayed` when it carries a delay)
    async fn enqueue(&self, queue: &str, job: NewJob) -> QueueResult<JobRecord>;

    /// Oldest dispatchable job whose type is in `job_types`: `Waiting`, or
    /// `Delayed` with an elapsed delay. Does not claim the job.
    async fn fetch_next(&self, queue: &str, job_types: &[String]) -> QueueResult<Option<JobRecord>>;

    /// Earliest future `ready_at` among delayed jobs of `job_types`
    async fn next_ready_at(
        &self,
        queue: &str,
        job_types: &[String],
    ) -> QueueResult<Option<DateTime<Utc>>>;

    /// Atomic compare-and-set on the job's state. Fails with
    /// `QueueError::Conflict` when the job is not in `transition.from`.
    async fn commit_transition(
        &self,
        queue: &str,
        id: &JobId,
        transition: Transition,
    ) -> QueueResult<JobRecord>;

    /// Get full job record
    async fn get(&self, queue: &str, id: &JobId) -> QueueResult<JobRecord>;

    /// Jobs in a state bucket, ordered by ready time
    async fn list_by_state(&self, queue: &str, state: JobState) -> QueueResult<Vec<JobRecord>>;

    /// Bucket sizes for a queue
    async fn counts(&self, queue: &str) -> QueueResult<JobCounts>;

    /// Check connectivity
    async fn ping(&self) -> QueueResult<()>;

    /// Release the store connection
    async fn close(&self) -> QueueResult<()>;

    /// Backend identifier for logs
    fn name(&self) -> &'static str;
}
