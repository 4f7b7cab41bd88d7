pub mod handler;
pub mod registry;

pub use handler::{FnHandler, JobHandler, TypedHandler};
pub use registry::HandlerRegistry;

use crate::{JobError, JobOptions};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

/// Trait for defining typed jobs that can be processed by the queue.
///
/// The job value itself is the payload: it is serialized on `add_job` and
/// deserialized again before `execute`.
#[async_trait]
pub trait Job: Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Context type passed to job execution
    type Context: Send + Sync + Clone + 'static;

    /// Result type returned by job execution
    type Result: Send + Sync + Serialize + 'static;

    /// Job type identifier for dispatch
    const JOB_TYPE: &'static str;

    /// Maximum execution attempts
    const MAX_ATTEMPTS: u32 = 1;

    /// Execute the job with the given context
    async fn execute(&self, ctx: Self::Context) -> Result<Self::Result, JobError>;

    /// Get the job type identifier for dispatch
    fn job_type(&self) -> &'static str {
        Self::JOB_TYPE
    }

    /// Options used when the job is added without explicit ones
    fn options(&self) -> JobOptions {
        JobOptions::new().with_attempts(Self::MAX_ATTEMPTS)
    }
}
