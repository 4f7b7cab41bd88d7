use std::collections::HashMap;
use std::sync::Arc;

use crate::worker::WorkerPool;
use crate::{JobHandler, QueueError, QueueResult};

/// Registry of worker pools keyed by job type. Exactly one handler per type.
pub struct HandlerRegistry {
    pools: HashMap<String, Arc<WorkerPool>>,
}

impl HandlerRegistry {
    /// Create a new handler registry
    pub fn new() -> Self {
        Self {
            pools: HashMap::new(),
        }
    }

    /// Register the handler for a job type behind a pool of `concurrency`
    /// slots; a second registration fails with `DuplicateHandler` and leaves
    /// the first in place
    pub fn register(
        &mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
    ) -> QueueResult<Arc<WorkerPool>> {
        let job_type = job_type.into();
        if self.pools.contains_key(&job_type) {
            return Err(QueueError::DuplicateHandler(job_type));
        }
        let pool = Arc::new(WorkerPool::new(job_type.clone(), handler, concurrency));
        self.pools.insert(job_type, pool.clone());
        Ok(pool)
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<WorkerPool>> {
        self.pools.get(job_type).cloned()
    }

    /// Get all registered job types, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.pools.keys().cloned().collect();
        types.sort();
        types
    }

    /// Registered job types with at least one free worker slot
    pub fn types_with_capacity(&self) -> Vec<String> {
        self.pools
            .values()
            .filter(|pool| pool.has_capacity())
            .map(|pool| pool.job_type().to_string())
            .collect()
    }

    pub fn pools(&self) -> Vec<Arc<WorkerPool>> {
        self.pools.values().cloned().collect()
    }

    /// Jobs currently executing across all pools
    pub fn in_flight(&self) -> usize {
        self.pools.values().map(|pool| pool.in_flight()).sum()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
