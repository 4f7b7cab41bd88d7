use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::{
    QueueResult, QueueError, JobId, JobRecord, JobState, JobCounts, NewJob, Transition,
    backend::QueueBackend,
};

// Bucket entries sort by ready time, then by insertion sequence (FIFO tie-break)
type BucketKey = (DateTime<Utc>, u64);
type Bucket = BTreeMap<BucketKey, JobId>;

struct StoredJob {
    record: JobRecord,
    seq: u64,
}

impl StoredJob {
    fn key(&self) -> BucketKey {
        (self.record.ready_at, self.seq)
    }
}

#[derive(Default)]
struct MemoryState {
    /// Job records indexed by job id
    jobs: HashMap<JobId, StoredJob>,

    /// queue name -> state -> ordered job ids
    buckets: HashMap<String, HashMap<JobState, Bucket>>,
}

impl MemoryState {
    fn bucket(&self, queue: &str, state: JobState) -> Option<&Bucket> {
        self.buckets.get(queue).and_then(|states| states.get(&state))
    }

    fn bucket_mut(&mut self, queue: &str, state: JobState) -> &mut Bucket {
        self.buckets
            .entry(queue.to_string())
            .or_default()
            .entry(state)
            .or_default()
    }

    fn has_type(&self, id: &JobId, job_types: &[String]) -> bool {
        self.jobs
            .get(id)
            .map(|stored| job_types.iter().any(|t| *t == stored.record.job_type))
            .unwrap_or(false)
    }

    fn record(&self, queue: &str, id: &JobId) -> QueueResult<&StoredJob> {
        match self.jobs.get(id) {
            Some(stored) if stored.record.queue == queue => Ok(stored),
            _ => Err(QueueError::JobNotFound(id.to_string())),
        }
    }
}

/// In-memory backend for testing and development.
///
/// Clones share the same state, so several queues (or workers) built on
/// clones of one backend contend on the same records exactly as they would on
/// a networked store.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<RwLock<MemoryState>>,
    seq: Arc<AtomicU64>,
    available: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            seq: Arc::new(AtomicU64::new(0)),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate a store outage (test helper)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> QueueResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::StoreUnavailable("memory store offline".to_string()))
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn enqueue(&self, queue: &str, job: NewJob) -> QueueResult<JobRecord> {
        self.check_available()?;

        let record = JobRecord::new(JobId::new(), queue, job, Utc::now())?;
        let stored = StoredJob {
            record: record.clone(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
        };

        let mut state = self.state.write();
        let key = stored.key();
        state.bucket_mut(queue, record.state).insert(key, record.id.clone());
        state.jobs.insert(record.id.clone(), stored);

        Ok(record)
    }

    async fn fetch_next(
        &self,
        queue: &str,
        job_types: &[String],
    ) -> QueueResult<Option<JobRecord>> {
        self.check_available()?;

        if job_types.is_empty() {
            return Ok(None);
        }

        let now = Utc::now();
        let state = self.state.read();

        let waiting = state.bucket(queue, JobState::Waiting).and_then(|bucket| {
            bucket
                .iter()
                .find(|(_, id)| state.has_type(id, job_types))
        });

        let delayed = state.bucket(queue, JobState::Delayed).and_then(|bucket| {
            bucket
                .iter()
                .take_while(|((ready_at, _), _)| *ready_at <= now)
                .find(|(_, id)| state.has_type(id, job_types))
        });

        // Approximately FIFO: whichever became ready first
        let next = match (waiting, delayed) {
            (Some(w), Some(d)) => Some(if d.0 < w.0 { d.1 } else { w.1 }),
            (Some(w), None) => Some(w.1),
            (None, Some(d)) => Some(d.1),
            (None, None) => None,
        };

        Ok(next
            .and_then(|id| state.jobs.get(id))
            .map(|stored| stored.record.clone()))
    }

    async fn next_ready_at(
        &self,
        queue: &str,
        job_types: &[String],
    ) -> QueueResult<Option<DateTime<Utc>>> {
        self.check_available()?;

        let state = self.state.read();
        Ok(state.bucket(queue, JobState::Delayed).and_then(|bucket| {
            bucket
                .iter()
                .find(|(_, id)| state.has_type(id, job_types))
                .map(|((ready_at, _), _)| *ready_at)
        }))
    }

    async fn commit_transition(
        &self,
        queue: &str,
        id: &JobId,
        transition: Transition,
    ) -> QueueResult<JobRecord> {
        self.check_available()?;

        let now = Utc::now();
        let mut state = self.state.write();

        let (old_key, old_state, updated, new_key) = {
            let stored = state.record(queue, id)?;
            let mut updated = stored.record.clone();
            updated.apply(&transition, now)?;
            let new_key = (updated.ready_at, stored.seq);
            (stored.key(), stored.record.state, updated, new_key)
        };

        state.bucket_mut(queue, old_state).remove(&old_key);
        state.bucket_mut(queue, updated.state).insert(new_key, id.clone());
        if let Some(stored) = state.jobs.get_mut(id) {
            stored.record = updated.clone();
        }

        Ok(updated)
    }

    async fn get(&self, queue: &str, id: &JobId) -> QueueResult<JobRecord> {
        self.check_available()?;

        let state = self.state.read();
        state.record(queue, id).map(|stored| stored.record.clone())
    }

    async fn list_by_state(&self, queue: &str, job_state: JobState) -> QueueResult<Vec<JobRecord>> {
        self.check_available()?;

        let state = self.state.read();
        Ok(state
            .bucket(queue, job_state)
            .map(|bucket| {
                bucket
                    .values()
                    .filter_map(|id| state.jobs.get(id))
                    .map(|stored| stored.record.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn counts(&self, queue: &str) -> QueueResult<JobCounts> {
        self.check_available()?;

        let state = self.state.read();
        let mut counts = JobCounts::default();
        for job_state in JobState::all() {
            if let Some(bucket) = state.bucket(queue, *job_state) {
                counts.add(*job_state, bucket.len());
            }
        }
        Ok(counts)
    }

    async fn ping(&self) -> QueueResult<()> {
        self.check_available()
    }

    async fn close(&self) -> QueueResult<()> {
        // Nothing to release; clones may still be in use by other queues
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
