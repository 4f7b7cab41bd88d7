use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;
use serde::Serialize;

/// Live counters for one queue
#[derive(Default)]
pub struct LiveMetrics {
    jobs_enqueued: AtomicU64,
    jobs_dispatched: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    rate_limited: AtomicU64,
    conflicts: AtomicU64,
    stalled: AtomicU64,

    // Per-job-type metrics
    job_types: Mutex<HashMap<String, JobTypeMetrics>>,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_jobs_enqueued(&self, job_type: &str) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
        self.job_types.lock().entry(job_type.to_string()).or_default().enqueued += 1;
    }

    pub fn increment_jobs_dispatched(&self, job_type: &str) {
        self.jobs_dispatched.fetch_add(1, Ordering::Relaxed);
        self.job_types.lock().entry(job_type.to_string()).or_default().dispatched += 1;
    }

    pub fn increment_jobs_completed(&self, job_type: &str) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.job_types.lock().entry(job_type.to_string()).or_default().completed += 1;
    }

    /// Permanent failures only
    pub fn increment_jobs_failed(&self, job_type: &str) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        self.job_types.lock().entry(job_type.to_string()).or_default().failed += 1;
    }

    pub fn increment_jobs_retried(&self, job_type: &str) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
        self.job_types.lock().entry(job_type.to_string()).or_default().retried += 1;
    }

    pub fn increment_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_conflicts(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Attempts recovered after their worker stopped heartbeating
    pub fn increment_stalled(&self) {
        self.stalled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn jobs_dispatched(&self) -> u64 {
        self.jobs_dispatched.load(Ordering::Relaxed)
    }

    /// Get metrics for a specific job type
    pub fn job_type_metrics(&self, job_type: &str) -> Option<JobTypeMetrics> {
        self.job_types.lock().get(job_type).cloned()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            jobs_dispatched: self.jobs_dispatched.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            stalled: self.stalled.load(Ordering::Relaxed),
            job_types: self.job_types.lock().clone(),
        }
    }
}

/// Metrics for a specific job type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobTypeMetrics {
    pub enqueued: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
}

/// Point-in-time copy of a queue's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_enqueued: u64,
    pub jobs_dispatched: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub rate_limited: u64,
    pub conflicts: u64,
    pub stalled: u64,
    pub job_types: HashMap<String, JobTypeMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_type_and_total() {
        let metrics = LiveMetrics::new();
        metrics.increment_jobs_enqueued("image");
        metrics.increment_jobs_enqueued("video");
        metrics.increment_jobs_dispatched("image");
        metrics.increment_jobs_retried("image");
        metrics.increment_conflicts();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_enqueued, 2);
        assert_eq!(snapshot.jobs_dispatched, 1);
        assert_eq!(snapshot.conflicts, 1);
        assert_eq!(
            metrics.job_type_metrics("image"),
            Some(JobTypeMetrics { enqueued: 1, dispatched: 1, retried: 1, ..Default::default() })
        );
        assert!(metrics.job_type_metrics("audio").is_none());
    }
}
