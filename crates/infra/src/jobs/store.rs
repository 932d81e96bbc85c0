//! Job storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use super::types::{DeadLetterEntry, Job, JobId, JobStatus};

pub trait JobStore: Send + Sync {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claim the most urgent job that is ready at `now` and mark it running.
    ///
    /// Ordering: highest priority first, then oldest first. `queue = None`
    /// claims from every queue.
    fn claim_next(&self, queue: Option<&str>, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    /// Jobs in `queue` (or every queue), oldest first.
    fn list(&self, queue: Option<&str>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError>;

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// Move a dead-lettered job back to pending with a fresh attempt count.
    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    fn stats(&self, queue: Option<&str>) -> Result<JobStats, JobStoreError>;
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
    pub failed: usize,
    pub dead_lettered: usize,
    pub cancelled: usize,
}

#[derive(Debug, Default)]
struct Queues {
    jobs: HashMap<JobId, Job>,
    dead_letters: HashMap<JobId, DeadLetterEntry>,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Queues>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Queues>, JobStoreError> {
        self.inner
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Queues>, JobStoreError> {
        self.inner
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

fn in_queue(job: &Job, queue: Option<&str>) -> bool {
    queue.is_none_or(|q| job.queue == q)
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut inner = self.write()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        inner.jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut inner = self.write()?;
        match inner.jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    fn claim_next(&self, queue: Option<&str>, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.write()?;

        let next = inner
            .jobs
            .values()
            .filter(|j| in_queue(j, queue) && j.is_ready_at(now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.0.cmp(&b.id.0))
            })
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            inner.jobs.get_mut(&id).map(|job| {
                job.mark_running();
                job.clone()
            })
        }))
    }

    fn list(&self, queue: Option<&str>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read()?;
        let mut result: Vec<_> = inner.jobs.values().filter(|j| in_queue(j, queue)).cloned().collect();
        result.sort_by_key(|j| j.created_at);
        result.truncate(limit);
        Ok(result)
    }

    fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), JobStoreError> {
        let mut inner = self.write()?;

        job.status = JobStatus::DeadLettered {
            error: reason.clone(),
            attempts: job.attempt,
        };
        job.updated_at = Utc::now();

        inner.jobs.remove(&job.id);
        inner.dead_letters.insert(job.id, DeadLetterEntry::new(job, reason));
        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let inner = self.read()?;
        let mut result: Vec<_> = inner.dead_letters.values().cloned().collect();
        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut inner = self.write()?;
        let entry = inner
            .dead_letters
            .remove(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;

        let mut job = entry.job;
        job.status = JobStatus::Pending;
        job.attempt = 0;
        job.available_at = None;
        job.updated_at = Utc::now();
        job.history.clear();

        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn stats(&self, queue: Option<&str>) -> Result<JobStats, JobStoreError> {
        let inner = self.read()?;
        let mut stats = JobStats::default();

        for job in inner.jobs.values().filter(|j| in_queue(j, queue)) {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats.dead_lettered += inner
            .dead_letters
            .values()
            .filter(|e| in_queue(&e.job, queue))
            .count();

        Ok(stats)
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn claim_next(&self, queue: Option<&str>, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(queue, now)
    }

    fn list(&self, queue: Option<&str>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(queue, limit)
    }

    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError> {
        (**self).dead_letter(job, reason)
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        (**self).list_dead_letters(limit)
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        (**self).retry_dead_letter(job_id)
    }

    fn stats(&self, queue: Option<&str>) -> Result<JobStats, JobStoreError> {
        (**self).stats(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobKind;
    use std::time::Duration;

    fn job(kind: &str) -> Job {
        Job::new(JobKind::custom(kind), serde_json::json!({}))
    }

    #[test]
    fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();
        let job_id = store.enqueue(job("test")).unwrap();

        let claimed = store.claim_next(None, Utc::now()).unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert!(matches!(claimed.status, JobStatus::Running));
        assert_eq!(claimed.attempt, 1);

        assert!(store.claim_next(None, Utc::now()).unwrap().is_none());
    }

    #[test]
    fn claims_by_priority_then_age() {
        let store = InMemoryJobStore::new();
        let older = store.enqueue(job("older")).unwrap();
        let newer = store.enqueue(job("newer")).unwrap();
        let urgent = store.enqueue(job("urgent").with_priority(10)).unwrap();

        let now = Utc::now();
        let order: Vec<JobId> = (0..3)
            .map(|_| store.claim_next(None, now).unwrap().unwrap().id)
            .collect();
        assert_eq!(order, vec![urgent, older, newer]);
    }

    #[test]
    fn claim_is_scoped_to_queue() {
        let store = InMemoryJobStore::new();
        store.enqueue(job("test").on_queue("reports")).unwrap();

        assert!(store.claim_next(Some("default"), Utc::now()).unwrap().is_none());
        assert!(store.claim_next(Some("reports"), Utc::now()).unwrap().is_some());
    }

    #[test]
    fn delayed_job_is_not_claimed_early() {
        let store = InMemoryJobStore::new();
        let delayed = job("test").delayed(Duration::from_secs(60));
        let created = delayed.created_at;
        store.enqueue(delayed).unwrap();

        assert!(store.claim_next(None, created).unwrap().is_none());
        assert!(
            store
                .claim_next(None, created + chrono::Duration::seconds(61))
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn dead_letter_flow() {
        let store = InMemoryJobStore::new();
        let job_id = store.enqueue(job("test")).unwrap();

        let mut claimed = store.claim_next(None, Utc::now()).unwrap().unwrap();
        claimed.mark_failed("boom".to_string(), Utc::now());
        store.dead_letter(claimed, "max retries exceeded".to_string()).unwrap();

        assert!(store.get(job_id).unwrap().is_none());
        let dls = store.list_dead_letters(10).unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].job.id, job_id);

        let retried = store.retry_dead_letter(job_id).unwrap();
        assert!(matches!(retried.status, JobStatus::Pending));
        assert_eq!(retried.attempt, 0);
        assert!(store.list_dead_letters(10).unwrap().is_empty());
    }

    #[test]
    fn stats_tracking() {
        let store = InMemoryJobStore::new();
        for _ in 0..5 {
            store.enqueue(job("test")).unwrap();
        }
        assert_eq!(store.stats(None).unwrap().pending, 5);

        store.claim_next(None, Utc::now()).unwrap();
        store.claim_next(None, Utc::now()).unwrap();

        let stats = store.stats(Some("default")).unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.running, 2);
        assert_eq!(store.stats(Some("other")).unwrap(), JobStats::default());
    }
}
