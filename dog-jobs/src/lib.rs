//! # dog-jobs: Rate-Limited Background Jobs
//!
//! A named queue of typed jobs with at-least-once delivery:
//!
//! - **Delayed scheduling**: jobs become eligible after `delay_millis`
//! - **Bounded retries**: a failing job is retried until `max_attempts`
//!   attempts have been made, then fails permanently
//! - **Rate limiting**: at most `max` dispatches per rolling window, shared by
//!   every worker of the queue
//! - **Conditional commits**: every state change is a compare-and-set in the
//!   store, so two workers can never both claim a job
//! - **Events**: synchronous `completed` / `failed` listeners plus an owned
//!   event stream
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use dog_jobs::prelude::*;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn run() -> QueueResult<()> {
//! let config = QueueConfig::new("memory://").with_limiter(1, Duration::from_millis(1000));
//! let queue = create_queue("updateSubscriptions", config).await?;
//!
//! queue.process("image", |job| async move {
//!     println!("resizing images for {}", job.payload["username"]);
//!     Ok(json!({ "resized": true }))
//! })?;
//!
//! queue.on_failed(|job, err, attempts_remaining| {
//!     println!("{} failed: {} ({} attempts left)", job.id, err, attempts_remaining);
//! });
//!
//! queue
//!     .add("image", json!({ "username": "ann" }), JobOptions::new().with_attempts(4))
//!     .await?;
//!
//! queue.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod limiter;
pub mod metrics;
pub mod queue;
pub mod retry;
mod scheduler;
pub mod types;
pub mod worker;

pub use backend::QueueBackend;
pub use backend::memory::MemoryBackend;
pub use config::{LimiterConfig, QueueConfig};
pub use error::{JobError, QueueError, QueueResult};
pub use events::{EventBus, EventKind, EventListener, EventStream, ListenerId, QueueEvent};
pub use job::{FnHandler, HandlerRegistry, Job, JobHandler, TypedHandler};
pub use limiter::{Admission, RateLimiter};
pub use metrics::{JobTypeMetrics, LiveMetrics, MetricsSnapshot};
pub use queue::{create_queue, Queue};
pub use retry::{BackoffPolicy, ExponentialBackoff, FixedBackoff, RetryDecision, RetryPolicy};
pub use types::{JobCounts, JobEvent, JobId, JobOptions, JobRecord, JobState, NewJob, Transition};
pub use worker::WorkerPool;

#[cfg(feature = "redis")]
pub use backend::redis::RedisBackend;

/// Common imports for producers and workers
pub mod prelude {
    pub use crate::{
        create_queue, Job, JobError, JobEvent, JobId, JobOptions, JobRecord, JobState, Queue,
        QueueConfig, QueueError, QueueResult,
    };

    pub use crate::{EventKind, ExponentialBackoff, FixedBackoff, ListenerId};

    // Essential traits
    pub use async_trait::async_trait;
}
