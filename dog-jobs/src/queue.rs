use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};

use crate::backend::memory::MemoryBackend;
use crate::events::{EventBus, EventListener, EventStream, ListenerId};
use crate::limiter::RateLimiter;
use crate::metrics::{LiveMetrics, MetricsSnapshot};
use crate::retry::{exponential_delay, RetryPolicy};
use crate::scheduler::{self, DispatcherHandle};
use crate::worker::WorkerPool;
use crate::{
    EventKind, FnHandler, HandlerRegistry, Job, JobCounts, JobError, JobEvent, JobHandler, JobId,
    JobOptions, JobRecord, JobState, NewJob, QueueBackend, QueueConfig, QueueError, QueueResult,
    Transition, TypedHandler,
};

/// Connect to the configured store and build a queue on it.
///
/// The address scheme picks the backend: `memory://` or `redis://` (the
/// latter requires the `redis` feature). Fails when the configuration is
/// invalid or the store does not answer a ping.
pub async fn create_queue(name: impl Into<String>, config: QueueConfig) -> QueueResult<Queue> {
    config.validate()?;
    let backend = connect(&config).await?;
    backend.ping().await?;
    Queue::with_backend(name, config, backend)
}

async fn connect(config: &QueueConfig) -> QueueResult<Arc<dyn QueueBackend>> {
    let address = config.store_address.as_str();

    if address.starts_with("memory://") {
        return Ok(Arc::new(MemoryBackend::new()));
    }

    if address.starts_with("redis://") || address.starts_with("rediss://") {
        #[cfg(feature = "redis")]
        {
            let backend =
                crate::backend::redis::RedisBackend::connect(address, &config.key_prefix).await?;
            return Ok(Arc::new(backend));
        }
        #[cfg(not(feature = "redis"))]
        {
            return Err(QueueError::Config(format!(
                "{address}: redis support requires the `redis` feature"
            )));
        }
    }

    Err(QueueError::Config(format!("unsupported store address: {address}")))
}

/// State shared by the facade, the dispatcher and running workers
pub(crate) struct QueueCore {
    name: String,
    config: QueueConfig,
    backend: Arc<dyn QueueBackend>,
    limiter: Option<RateLimiter>,
    registry: RwLock<HandlerRegistry>,
    events: EventBus,
    metrics: LiveMetrics,
    wake: Notify,
    paused: AtomicBool,
    closed: AtomicBool,
    dispatcher: Mutex<Option<DispatcherHandle>>,
}

impl QueueCore {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(crate) fn backend(&self) -> &dyn QueueBackend {
        self.backend.as_ref()
    }

    pub(crate) fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub(crate) fn limiter(&self) -> Option<&RateLimiter> {
        self.limiter.as_ref()
    }

    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn metrics(&self) -> &LiveMetrics {
        &self.metrics
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn notified(&self) -> Notified<'_> {
        self.wake.notified()
    }

    pub(crate) fn pool(&self, job_type: &str) -> Option<Arc<WorkerPool>> {
        self.registry.read().get(job_type)
    }

    /// Registered job types with at least one free worker slot
    pub(crate) fn types_with_capacity(&self) -> Vec<String> {
        self.registry.read().types_with_capacity()
    }

    /// Conditional commit that rides out store outages with backoff.
    /// Any other error, `Conflict` included, is returned as is.
    pub(crate) async fn commit(
        &self,
        id: &JobId,
        transition: Transition,
    ) -> QueueResult<JobRecord> {
        let mut failures: u32 = 0;
        loop {
            match self.backend.commit_transition(&self.name, id, transition.clone()).await {
                Err(e) if e.is_retryable() => {
                    failures = failures.saturating_add(1);
                    let backoff = exponential_delay(
                        self.config.store_retry_base,
                        self.config.store_retry_max,
                        failures,
                        true,
                    );
                    warn!(
                        queue = %self.name,
                        job_id = %id,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "store unavailable, retrying commit"
                    );
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }
}

/// A named, rate-limited job queue.
///
/// Cloning is cheap; clones drive the same queue.
#[derive(Clone)]
pub struct Queue {
    core: Arc<QueueCore>,
}

impl Queue {
    /// Create a queue on an existing backend. Queues built on clones of one
    /// backend share its jobs but each keeps its own limiter and handlers.
    pub fn with_backend(
        name: impl Into<String>,
        config: QueueConfig,
        backend: Arc<dyn QueueBackend>,
    ) -> QueueResult<Self> {
        config.validate()?;
        let name = name.into();
        let limiter = config.limiter.map(RateLimiter::new);

        info!(
            queue = %name,
            backend = backend.name(),
            limiter_max = config.limiter.map(|l| l.max),
            limiter_ms = config.limiter.map(|l| l.duration.as_millis() as u64),
            "queue created"
        );

        Ok(Self {
            core: Arc::new(QueueCore {
                name,
                config,
                backend,
                limiter,
                registry: RwLock::new(HandlerRegistry::new()),
                events: EventBus::new(),
                metrics: LiveMetrics::new(),
                wake: Notify::new(),
                paused: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                dispatcher: Mutex::new(None),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.core.config
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.core.is_paused()
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.is_closed() {
            Err(QueueError::QueueClosed)
        } else {
            Ok(())
        }
    }

    fn check_job_type(&self, job_type: &str) -> QueueResult<()> {
        match &self.core.config.job_types {
            Some(known) if !known.iter().any(|t| t == job_type) => {
                Err(QueueError::UnknownJobType(job_type.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Enqueue a job. A job whose type has no handler yet waits until one is
    /// registered.
    #[instrument(skip(self, payload, options), fields(queue = %self.core.name))]
    pub async fn add(
        &self,
        job_type: &str,
        payload: Value,
        options: JobOptions,
    ) -> QueueResult<JobId> {
        self.ensure_open()?;
        self.check_job_type(job_type)?;
        options.validate()?;

        let record = self
            .core
            .backend
            .enqueue(&self.core.name, NewJob::new(job_type, payload, options))
            .await?;

        self.core.metrics.increment_jobs_enqueued(job_type);
        info!(job_id = %record.id, state = %record.state, "job added");

        let event = match record.state {
            JobState::Delayed => JobEvent::Delayed {
                job_id: record.id.clone(),
                ready_at: record.ready_at,
                at: record.created_at,
            },
            _ => JobEvent::Waiting {
                job_id: record.id.clone(),
                job_type: record.job_type.clone(),
                at: record.created_at,
            },
        };
        self.core.events.publish(event);
        self.core.wake();

        Ok(record.id)
    }

    /// Enqueue a typed job with its own default options
    pub async fn add_job<J: Job>(&self, job: &J) -> QueueResult<JobId> {
        self.add_job_with(job, job.options()).await
    }

    pub async fn add_job_with<J: Job>(&self, job: &J, options: JobOptions) -> QueueResult<JobId> {
        let payload = serde_json::to_value(job)?;
        self.add(J::JOB_TYPE, payload, options).await
    }

    /// Register the handler for `job_type` with the default concurrency
    pub fn process<F, Fut>(&self, job_type: impl Into<String>, handler: F) -> QueueResult<()>
    where
        F: Fn(JobRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
    {
        let concurrency = self.core.config.default_concurrency;
        self.process_with_concurrency(job_type, concurrency, handler)
    }

    /// Register the handler for `job_type` with up to `concurrency` jobs of
    /// that type in flight
    pub fn process_with_concurrency<F, Fut>(
        &self,
        job_type: impl Into<String>,
        concurrency: usize,
        handler: F,
    ) -> QueueResult<()>
    where
        F: Fn(JobRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
    {
        self.register_handler(job_type.into(), concurrency, Arc::new(FnHandler::new(handler)))
    }

    /// Register a typed job; `ctx` is cloned into every execution
    pub fn process_job<J: Job>(&self, ctx: J::Context) -> QueueResult<()> {
        let concurrency = self.core.config.default_concurrency;
        let handler = Arc::new(TypedHandler::<J>::new(ctx));
        self.register_handler(J::JOB_TYPE.to_string(), concurrency, handler)
    }

    #[instrument(skip(self, handler), fields(queue = %self.core.name))]
    pub fn register_handler(
        &self,
        job_type: String,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> QueueResult<()> {
        self.ensure_open()?;
        self.check_job_type(&job_type)?;
        if concurrency == 0 {
            return Err(QueueError::Config("concurrency must be at least 1".to_string()));
        }

        self.core.registry.write().register(job_type, handler, concurrency)?;
        info!("handler registered");

        self.ensure_dispatcher();
        self.core.wake();
        Ok(())
    }

    fn ensure_dispatcher(&self) {
        let mut dispatcher = self.core.dispatcher.lock();
        if dispatcher.is_none() && !self.is_closed() {
            *dispatcher = Some(scheduler::spawn(self.core.clone()));
        }
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.core.registry.read().registered_types()
    }

    /// Register a listener for `completed` or `failed`
    pub fn on(&self, kind: EventKind, listener: EventListener) -> ListenerId {
        self.core.events.on(kind, listener)
    }

    pub fn on_completed<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&JobRecord, &Value) + Send + Sync + 'static,
    {
        self.core.events.on_completed(listener)
    }

    /// `listener(job, error, attempts_remaining)`
    pub fn on_failed<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&JobRecord, &JobError, u32) + Send + Sync + 'static,
    {
        self.core.events.on_failed(listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.core.events.off(id)
    }

    /// Owned stream of every lifecycle event from now on
    pub fn events(&self) -> EventStream {
        self.core.events.subscribe()
    }

    pub async fn get_job(&self, id: &JobId) -> QueueResult<JobRecord> {
        self.core.backend.get(&self.core.name, id).await
    }

    pub async fn list_by_state(&self, state: JobState) -> QueueResult<Vec<JobRecord>> {
        self.core.backend.list_by_state(&self.core.name, state).await
    }

    pub async fn job_counts(&self) -> QueueResult<JobCounts> {
        self.core.backend.counts(&self.core.name).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }

    /// Jobs currently executing across all pools
    pub fn in_flight(&self) -> usize {
        self.core.registry.read().in_flight()
    }

    /// Stop dispatching new jobs; running jobs finish normally
    pub fn pause(&self) {
        if !self.core.paused.swap(true, Ordering::SeqCst) {
            info!(queue = %self.core.name, "queue paused");
        }
    }

    pub fn resume(&self) {
        if self.core.paused.swap(false, Ordering::SeqCst) {
            info!(queue = %self.core.name, "queue resumed");
            self.core.wake();
        }
    }

    /// Graceful shutdown: stop dispatching, wait for in-flight jobs, then
    /// release the store. Closing twice is a no-op.
    pub async fn close(&self) -> QueueResult<()> {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(queue = %self.core.name, in_flight = self.in_flight(), "closing queue");

        let dispatcher = self.core.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.stop().await;
        }

        let pools = self.core.registry.read().pools();
        for pool in pools {
            pool.drain().await;
        }

        self.core.backend.close().await?;
        info!(queue = %self.core.name, "queue closed");
        Ok(())
    }
}
