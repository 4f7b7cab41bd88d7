//! Event bus for job outcomes.
//!
//! Listeners run synchronously, in registration order, on the task that
//! committed the transition. A panicking listener is logged and skipped; the
//! committed transition is never affected.
//!
//! Every lifecycle change is also published as an owned [`JobEvent`] on a
//! broadcast channel for observers that prefer to consume a stream.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamExt;
use tracing::{error, warn};

use crate::error::panic_message;
use crate::{JobError, JobEvent, JobRecord};

const STREAM_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static LISTENER_ID: AtomicU64 = AtomicU64::new(1);

fn next_listener_id() -> ListenerId {
    ListenerId(LISTENER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Event names a listener can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Completed,
    Failed,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Data delivered to listeners, borrowed from the committed record
#[derive(Debug)]
pub enum QueueEvent<'a> {
    Completed {
        job: &'a JobRecord,
        result: &'a Value,
    },

    /// `attempts_remaining == 0` means the job is now permanently failed
    Failed {
        job: &'a JobRecord,
        error: &'a JobError,
        attempts_remaining: u32,
    },
}

impl QueueEvent<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Completed { .. } => EventKind::Completed,
            Self::Failed { .. } => EventKind::Failed,
        }
    }

    pub fn job(&self) -> &JobRecord {
        match self {
            Self::Completed { job, .. } | Self::Failed { job, .. } => job,
        }
    }
}

/// Listener signature (sync)
pub type EventListener = Arc<dyn Fn(&QueueEvent<'_>) + Send + Sync>;

/// Owned lifecycle events, lagging receivers skip ahead
pub type EventStream = BoxStream<'static, JobEvent>;

#[derive(Clone)]
struct ListenerEntry {
    id: ListenerId,
    kind: EventKind,
    listener: EventListener,
}

pub struct EventBus {
    listeners: RwLock<Vec<ListenerEntry>>,
    stream: broadcast::Sender<JobEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (stream, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            listeners: RwLock::new(Vec::new()),
            stream,
        }
    }

    pub fn on(&self, kind: EventKind, listener: EventListener) -> ListenerId {
        let id = next_listener_id();
        self.listeners.write().push(ListenerEntry { id, kind, listener });
        id
    }

    pub fn on_completed<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&JobRecord, &Value) + Send + Sync + 'static,
    {
        self.on(
            EventKind::Completed,
            Arc::new(move |event| {
                if let QueueEvent::Completed { job, result } = event {
                    listener(job, result);
                }
            }),
        )
    }

    pub fn on_failed<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&JobRecord, &JobError, u32) + Send + Sync + 'static,
    {
        self.on(
            EventKind::Failed,
            Arc::new(move |event| {
                if let QueueEvent::Failed { job, error, attempts_remaining } = event {
                    listener(job, error, *attempts_remaining);
                }
            }),
        )
    }

    /// Remove a listener; returns false when the id was unknown
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|e| e.id != id);
        before != listeners.len()
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().iter().filter(|e| e.kind == kind).count()
    }

    /// Invoke matching listeners in registration order
    pub fn emit(&self, event: &QueueEvent<'_>) {
        // Snapshot so listeners may register or remove listeners themselves
        let matching: Vec<ListenerEntry> = self
            .listeners
            .read()
            .iter()
            .filter(|e| e.kind == event.kind())
            .cloned()
            .collect();

        for entry in matching {
            let outcome = catch_unwind(AssertUnwindSafe(|| (entry.listener)(event)));
            if let Err(payload) = outcome {
                error!(
                    job_id = %event.job().id,
                    event = event.kind().name(),
                    panic = %panic_message(payload.as_ref()),
                    "listener panicked"
                );
            }
        }
    }

    /// Publish on the owned event stream; no receivers is not an error
    pub fn publish(&self, event: JobEvent) {
        let _ = self.stream.send(event);
    }

    pub fn subscribe(&self) -> EventStream {
        let stream = BroadcastStream::new(self.stream.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "event stream lagged");
                None
            }
        });
        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobId, JobOptions, NewJob};
    use chrono::Utc;
    use parking_lot::Mutex;
    use serde_json::json;
    use tracing_test::traced_test;

    fn record() -> JobRecord {
        let options = JobOptions::new().with_attempts(4);
        let job = NewJob::new("image", json!({"username": "ann"}), options);
        JobRecord::new(JobId::new(), "updateSubscriptions", job, Utc::now()).unwrap()
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let seen = seen.clone();
            bus.on_completed(move |_, _| seen.lock().push(n));
        }
        let failed = seen.clone();
        bus.on_failed(move |_, _, _| failed.lock().push(99));

        let job = record();
        bus.emit(&QueueEvent::Completed { job: &job, result: &Value::Null });

        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn failed_listeners_see_attempts_remaining() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));
        let captured = seen.clone();
        bus.on_failed(move |job, err, remaining| {
            *captured.lock() = Some((job.job_type.clone(), err.message().to_string(), remaining));
        });

        let job = record();
        let err = JobError::retryable("boom");
        bus.emit(&QueueEvent::Failed { job: &job, error: &err, attempts_remaining: 3 });

        assert_eq!(*seen.lock(), Some(("image".to_string(), "boom".to_string(), 3)));
    }

    #[test]
    fn off_removes_listener() {
        let bus = EventBus::new();
        let id = bus.on_completed(|_, _| {});
        assert_eq!(bus.listener_count(EventKind::Completed), 1);

        assert!(bus.off(id));
        assert!(!bus.off(id));
        assert_eq!(bus.listener_count(EventKind::Completed), 0);
    }

    #[traced_test]
    #[test]
    fn listener_panics_are_logged_and_contained() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicU64::new(0));

        bus.on_completed(|_, _| panic!("listener exploded"));
        let after = calls.clone();
        bus.on_completed(move |_, _| {
            after.fetch_add(1, Ordering::SeqCst);
        });

        let job = record();
        bus.emit(&QueueEvent::Completed { job: &job, result: &Value::Null });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(logs_contain("listener panicked"));
        assert!(logs_contain("listener exploded"));
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();

        let job_id = JobId::new();
        bus.publish(JobEvent::Completed {
            job_id: job_id.clone(),
            result: json!(1),
            at: Utc::now(),
        });

        let event = events.next().await.unwrap();
        assert_eq!(event.job_id(), &job_id);
        assert_eq!(event.event_name(), "completed");
    }
}
