//! Dispatcher loop.
//!
//! Repeatedly picks the oldest ready job whose type has a free worker slot,
//! asks the rate limiter for admission and claims the job through the
//! store's conditional commit. A lost claim is not an error: another
//! dispatcher got there first.
//!
//! Dispatch order is approximately FIFO by ready time, not strict: delays,
//! retries and limiter denials interleave.
//!
//! Next to the dispatcher runs the stall sweeper, which treats `Active` jobs
//! whose worker stopped heartbeating (crashed process, lost commit) as
//! failed attempts.

use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::limiter::Admission;
use crate::queue::QueueCore;
use crate::retry::exponential_delay;
use crate::worker;
use crate::{JobError, JobEvent, JobState, QueueResult, Transition};

const MIN_WAIT: Duration = Duration::from_millis(1);

/// Handle for the background dispatcher and stall sweeper
pub(crate) struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    sweeper: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Stop claiming new jobs. Returns once both loops have exited; jobs
    /// already handed to worker pools keep running.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "dispatcher task ended abnormally");
        }
        if let Some(sweeper) = self.sweeper {
            if let Err(e) = sweeper.await {
                error!(error = %e, "stall sweeper ended abnormally");
            }
        }
    }
}

pub(crate) fn spawn(core: Arc<QueueCore>) -> DispatcherHandle {
    let (shutdown, rx) = watch::channel(false);
    let sweeper = core
        .config()
        .stall_interval
        .map(|stall_interval| tokio::spawn(sweep(core.clone(), stall_interval, rx.clone())));
    let task = tokio::spawn(run(core, rx));
    DispatcherHandle { shutdown, task, sweeper }
}

enum Step {
    /// Something happened; look again immediately
    Progress,
    /// Nothing to do for up to this long (or until woken)
    Idle(Duration),
}

async fn run(core: Arc<QueueCore>, mut shutdown: watch::Receiver<bool>) {
    info!(queue = %core.name(), backend = core.backend_name(), "dispatcher started");
    let mut store_failures: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let wait = match dispatch_once(&core).await {
            Ok(Step::Progress) => {
                store_failures = 0;
                continue;
            }
            Ok(Step::Idle(wait)) => {
                store_failures = 0;
                wait.max(MIN_WAIT)
            }
            Err(e) if e.is_retryable() => {
                store_failures = store_failures.saturating_add(1);
                let config = core.config();
                let backoff = exponential_delay(
                    config.store_retry_base,
                    config.store_retry_max,
                    store_failures,
                    true,
                );
                warn!(
                    queue = %core.name(),
                    error = %e,
                    retry_in_ms = backoff.as_millis() as u64,
                    "store unavailable"
                );
                backoff
            }
            Err(e) => {
                error!(queue = %core.name(), error = %e, "dispatch failed");
                core.config().poll_interval
            }
        };

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = core.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    info!(queue = %core.name(), "dispatcher stopped");
}

async fn dispatch_once(core: &Arc<QueueCore>) -> QueueResult<Step> {
    let poll_interval = core.config().poll_interval;

    if core.is_paused() {
        return Ok(Step::Idle(poll_interval));
    }

    // Types without a handler (deferred registration) or without a free slot
    // are left in the store
    let ready_types = core.types_with_capacity();
    if ready_types.is_empty() {
        return Ok(Step::Idle(poll_interval));
    }

    let backend = core.backend();
    let Some(job) = backend.fetch_next(core.name(), &ready_types).await? else {
        let wait = match backend.next_ready_at(core.name(), &ready_types).await? {
            Some(ready_at) => (ready_at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            None => poll_interval,
        };
        return Ok(Step::Idle(wait.min(poll_interval)));
    };

    if let Some(limiter) = core.limiter() {
        if let Admission::Denied { retry_after } = limiter.try_acquire() {
            core.metrics().increment_rate_limited();
            debug!(
                queue = %core.name(),
                job_id = %job.id,
                retry_after_ms = retry_after.as_millis() as u64,
                "rate limited"
            );
            return Ok(Step::Idle(retry_after));
        }
    }

    let refund = || {
        if let Some(limiter) = core.limiter() {
            limiter.refund();
        }
    };

    let Some(pool) = core.pool(&job.job_type) else {
        refund();
        return Ok(Step::Progress);
    };
    let Some(permit) = pool.try_reserve() else {
        refund();
        return Ok(Step::Progress);
    };

    match backend.commit_transition(core.name(), &job.id, Transition::claim(&job)).await {
        Ok(active) => {
            core.metrics().increment_jobs_dispatched(&active.job_type);
            debug!(
                queue = %core.name(),
                job_id = %active.id,
                job_type = %active.job_type,
                attempts_made = active.attempts_made,
                "dispatched"
            );
            core.events().publish(JobEvent::Active {
                job_id: active.id.clone(),
                attempts_made: active.attempts_made,
                at: Utc::now(),
            });
            pool.spawn(core.clone(), active, permit);
            Ok(Step::Progress)
        }
        Err(e) if e.is_conflict() => {
            refund();
            core.metrics().increment_conflicts();
            debug!(queue = %core.name(), job_id = %job.id, "claim lost to another dispatcher");
            Ok(Step::Progress)
        }
        Err(e) => {
            refund();
            Err(e)
        }
    }
}

async fn sweep(
    core: Arc<QueueCore>,
    stall_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        queue = %core.name(),
        stall_interval_ms = stall_interval.as_millis() as u64,
        "stall sweeper started"
    );
    let mut ticker = tokio::time::interval(stall_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match recover_stalled(&core, stall_interval).await {
                    Ok(0) => debug!(queue = %core.name(), "no stalled jobs"),
                    Ok(recovered) => {
                        info!(queue = %core.name(), recovered, "recovered stalled jobs")
                    }
                    Err(e) => warn!(queue = %core.name(), error = %e, "stall sweep failed"),
                }
            }
        }
    }
}

/// Fail every attempt that has not heartbeated within `stall_interval`.
/// The retry policy decides between `Delayed` and `Failed`; listeners see
/// an ordinary `failed` event. Returns how many attempts were recovered.
pub(crate) async fn recover_stalled(
    core: &QueueCore,
    stall_interval: Duration,
) -> QueueResult<usize> {
    let Some(cutoff) = chrono::Duration::from_std(stall_interval)
        .ok()
        .and_then(|interval| Utc::now().checked_sub_signed(interval))
    else {
        return Ok(0);
    };

    let stalled: Vec<_> = core
        .backend()
        .list_by_state(core.name(), JobState::Active)
        .await?
        .into_iter()
        .filter(|job| job.is_stalled(cutoff))
        .collect();

    let mut recovered = 0;
    for job in stalled {
        warn!(
            queue = %core.name(),
            job_id = %job.id,
            attempts_made = job.attempts_made,
            "job stalled"
        );
        if worker::fail(core, &job, JobError::retryable("job stalled")).await {
            core.metrics().increment_stalled();
            recovered += 1;
        }
    }
    if recovered > 0 {
        core.wake();
    }
    Ok(recovered)
}
