use std::future::Future;
use std::marker::PhantomData;
use async_trait::async_trait;
use serde_json::Value;

use crate::{Job, JobError, JobRecord};

/// Type-erased job handler for runtime dispatch
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt of `job`. The record is a snapshot taken right after
    /// the claim, so `attempts_made` already counts this attempt.
    async fn handle(&self, job: JobRecord) -> Result<Value, JobError>;
}

/// Adapts an async closure `|job| async { ... }` into a handler
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new<Fut>(f: F) -> Self
    where
        F: Fn(JobRecord) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
    {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobRecord) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    async fn handle(&self, job: JobRecord) -> Result<Value, JobError> {
        (self.f)(job).await
    }
}

/// Handler for a typed [`Job`]: deserializes the payload, runs `execute`
/// with a clone of the context and serializes the result
pub struct TypedHandler<J: Job> {
    ctx: J::Context,
    _phantom: PhantomData<fn() -> J>,
}

impl<J: Job> TypedHandler<J> {
    pub fn new(ctx: J::Context) -> Self {
        Self {
            ctx,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<J: Job> JobHandler for TypedHandler<J> {
    async fn handle(&self, job: JobRecord) -> Result<Value, JobError> {
        // A payload that does not decode will never decode
        let typed: J = serde_json::from_value(job.payload)
            .map_err(|e| JobError::Permanent(format!("Failed to deserialize job: {}", e)))?;

        let result = typed.execute(self.ctx.clone()).await?;

        serde_json::to_value(&result)
            .map_err(|e| JobError::Permanent(format!("Failed to serialize result: {}", e)))
    }
}
