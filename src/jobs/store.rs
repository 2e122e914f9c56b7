//! Job persistence.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Job, JobFilter};
use crate::error::JobError;

/// Persistence for job records.
///
/// The manager serialises all writes to a given job, so implementations only
/// need to be safe for concurrent access, not transactional.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts or replaces a job.
    async fn save(&self, job: &Job) -> Result<(), JobError>;

    /// Loads a job by id.
    async fn load(&self, job_id: &str) -> Result<Option<Job>, JobError>;

    /// Lists jobs matching `filter`, newest first, truncated to `filter.limit`.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError>;

    /// Deletes a job. Returns whether it existed.
    async fn delete(&self, job_id: &str) -> Result<bool, JobError>;
}

/// Default in-process store. Jobs are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl InMemoryJobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn save(&self, job: &Job) -> Result<(), JobError> {
        self.jobs.write().insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<Option<Job>, JobError> {
        Ok(self.jobs.read().get(job_id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn delete(&self, job_id: &str) -> Result<bool, JobError> {
        Ok(self.jobs.write().remove(job_id).is_some())
    }
}
