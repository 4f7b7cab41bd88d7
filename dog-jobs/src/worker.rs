//! Worker pool: one per registered job type.
//!
//! A pool bounds how many jobs of its type run at once. The dispatcher
//! reserves a slot before claiming a job, so a claimed job always has a slot
//! to run in.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::error::panic_message;
use crate::events::QueueEvent;
use crate::queue::QueueCore;
use crate::retry::RetryDecision;
use crate::{JobError, JobEvent, JobHandler, JobRecord, Transition};

pub struct WorkerPool {
    job_type: String,
    handler: Arc<dyn JobHandler>,
    slots: Arc<Semaphore>,
    concurrency: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("job_type", &self.job_type)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn new(
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            job_type: job_type.into(),
            handler,
            slots: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Jobs of this type currently executing
    pub fn in_flight(&self) -> usize {
        self.concurrency.saturating_sub(self.slots.available_permits())
    }

    pub fn has_capacity(&self) -> bool {
        self.slots.available_permits() > 0
    }

    /// Reserve a slot without waiting
    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        self.slots.clone().try_acquire_owned().ok()
    }

    /// Wait for every in-flight job to finish, then refuse further work
    pub async fn drain(&self) {
        // Only errs when already closed, i.e. drained before
        if let Ok(all) = self.slots.acquire_many(self.concurrency as u32).await {
            self.slots.close();
            drop(all);
        }
    }

    /// Run one claimed job on its own task
    pub(crate) fn spawn(
        &self,
        core: Arc<QueueCore>,
        job: JobRecord,
        permit: OwnedSemaphorePermit,
    ) {
        let handler = self.handler.clone();
        tokio::spawn(async move {
            run_attempt(&core, handler, job).await;
            drop(permit);
            core.wake();
        });
    }
}

#[instrument(
    skip_all,
    fields(
        queue = %core.name(),
        job_id = %job.id,
        job_type = %job.job_type,
        attempts_made = job.attempts_made
    )
)]
async fn run_attempt(core: &QueueCore, handler: Arc<dyn JobHandler>, job: JobRecord) {
    debug!("running handler");

    let handling = AssertUnwindSafe(handler.handle(job.clone())).catch_unwind();
    let outcome = match core.config().stall_interval {
        Some(stall_interval) => with_heartbeat(core, &job, handling, stall_interval / 2).await,
        None => handling.await,
    };
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(payload) => Err(JobError::retryable(format!(
            "handler panicked: {}",
            panic_message(payload.as_ref())
        ))),
    };

    match outcome {
        Ok(result) => complete(core, &job, result).await,
        Err(err) => {
            fail(core, &job, err).await;
        }
    }
}

/// Drive `handling` to completion, renewing the attempt every `every` so
/// the stall sweep leaves it alone
async fn with_heartbeat<F: Future>(
    core: &QueueCore,
    job: &JobRecord,
    handling: F,
    every: Duration,
) -> F::Output {
    tokio::pin!(handling);
    let every = every.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut renewing = true;

    loop {
        tokio::select! {
            output = &mut handling => return output,
            _ = ticker.tick(), if renewing => {
                let renewal = core
                    .backend()
                    .commit_transition(core.name(), &job.id, Transition::renew(job))
                    .await;
                if let Err(e) = renewal {
                    // A conflict means the attempt was recovered elsewhere
                    renewing = !e.is_conflict();
                    warn!(error = %e, "heartbeat not recorded");
                }
            }
        }
    }
}

async fn complete(core: &QueueCore, job: &JobRecord, result: Value) {
    let transition = Transition::complete(result).expecting(job.attempts_made);
    let committed = match core.commit(&job.id, transition).await {
        Ok(record) => record,
        Err(e) if e.is_conflict() => {
            warn!(error = %e, "attempt superseded, completion dropped");
            return;
        }
        Err(e) => {
            error!(error = %e, "could not commit completion");
            return;
        }
    };

    let result = committed.result.clone().unwrap_or(Value::Null);
    core.metrics().increment_jobs_completed(&committed.job_type);
    info!("job completed");

    core.events().emit(&QueueEvent::Completed { job: &committed, result: &result });
    core.events().publish(JobEvent::Completed {
        job_id: committed.id.clone(),
        result,
        at: Utc::now(),
    });
}

/// Record a failed attempt of `job` and notify listeners. Returns whether
/// the commit went through.
pub(crate) async fn fail(core: &QueueCore, job: &JobRecord, err: JobError) -> bool {
    let decision = core.retry_policy().decide(job, &err);
    let transition = decision.transition(job, &err, Utc::now());

    let committed = match core.commit(&job.id, transition).await {
        Ok(record) => record,
        Err(e) if e.is_conflict() => {
            warn!(job_id = %job.id, error = %e, "attempt superseded, failure dropped");
            return false;
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "could not commit failure");
            return false;
        }
    };

    let attempts_remaining = decision.attempts_remaining();
    match decision {
        RetryDecision::Retry { delay, .. } => {
            core.metrics().increment_jobs_retried(&committed.job_type);
            warn!(
                job_id = %committed.id,
                error = %err,
                attempts_remaining,
                retry_in_ms = delay.as_millis() as u64,
                "job failed, will retry"
            );
        }
        RetryDecision::Fail => {
            core.metrics().increment_jobs_failed(&committed.job_type);
            error!(job_id = %committed.id, error = %err, "job failed permanently");
        }
    }

    core.events().emit(&QueueEvent::Failed {
        job: &committed,
        error: &err,
        attempts_remaining,
    });
    core.events().publish(JobEvent::Failed {
        job_id: committed.id.clone(),
        error: err.message().to_string(),
        attempts_remaining,
        at: Utc::now(),
    });
    if let RetryDecision::Retry { .. } = decision {
        core.events().publish(JobEvent::Delayed {
            job_id: committed.id.clone(),
            ready_at: committed.ready_at,
            at: Utc::now(),
        });
    }
    true
}
