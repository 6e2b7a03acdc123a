//! Job storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use super::types::{DeadLetterEntry, Job, JobId, JobStatus};

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Persist a job's new status. Completed jobs leave the queue.
    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claim the oldest job that is due at `now`, marking it running.
    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    /// Move a job out of the queue into the dead-letter list.
    fn dead_letter(&self, job: Job, reason: String, now: DateTime<Utc>) -> Result<(), JobStoreError>;

    fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub dead_lettered: usize,
}

/// In-memory job store for tests/dev.
///
/// Only pending and running jobs are kept; completed ones are counted and
/// dropped.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
    completed: AtomicUsize,
}

fn poisoned<T>(_: T) -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if !jobs.contains_key(&job.id) {
            return Err(JobStoreError::NotFound(job.id));
        }
        if job.status == JobStatus::Completed {
            jobs.remove(&job.id);
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            jobs.insert(job.id, job.clone());
        }
        Ok(())
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;

        // FIFO by due time, then creation.
        let next = jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .min_by_key(|j| (j.scheduled_at, j.created_at, j.id.0))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_running(now);
                job.clone()
            })
        }))
    }

    fn dead_letter(&self, mut job: Job, reason: String, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let mut dls = self.dead_letters.write().map_err(poisoned)?;

        job.status = JobStatus::DeadLettered {
            error: reason.clone(),
        };
        job.updated_at = now;

        jobs.remove(&job.id);
        dls.insert(
            job.id,
            DeadLetterEntry {
                job,
                dead_lettered_at: now,
                reason,
            },
        );
        Ok(())
    }

    fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let dls = self.dead_letters.read().map_err(poisoned)?;
        let mut result: Vec<_> = dls.values().cloned().collect();
        result.sort_by_key(|e| e.dead_lettered_at);
        Ok(result)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let dls = self.dead_letters.read().map_err(poisoned)?;

        let mut stats = JobStats {
            completed: self.completed.load(Ordering::Relaxed),
            dead_lettered: dls.len(),
            ..Default::default()
        };
        for job in jobs.values() {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed | JobStatus::DeadLettered { .. } => {}
            }
        }
        Ok(stats)
    }
}

impl JobStore for Arc<InMemoryJobStore> {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(now)
    }

    fn dead_letter(&self, job: Job, reason: String, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        (**self).dead_letter(job, reason, now)
    }

    fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        (**self).list_dead_letters()
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}
