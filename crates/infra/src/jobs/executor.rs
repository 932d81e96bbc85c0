//! Job executor with retry and backoff logic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobKind, JobResult, JobStatus};

pub type JobHandler = Box<dyn Fn(&Job) -> JobResult + Send + Sync>;

#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    pub poll_interval: Duration,
    /// Name of the executor thread and of its log field.
    pub name: String,
    /// Only claim jobs from this queue; `None` drains every queue.
    pub queue: Option<String>,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "job-executor".to_string(),
            queue: None,
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Handle to a running executor thread.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Stop polling and wait for the in-flight job to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        lock_stats(&self.stats).clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    fn record(&mut self, outcome: &Result<(), String>, job: &Job) {
        self.jobs_processed += 1;
        match outcome {
            Ok(()) => self.jobs_succeeded += 1,
            Err(_) => {
                self.jobs_failed += 1;
                if matches!(job.status, JobStatus::DeadLettered { .. }) {
                    self.jobs_dead_lettered += 1;
                }
            }
        }
    }
}

fn lock_stats(stats: &Mutex<ExecutorStats>) -> MutexGuard<'_, ExecutorStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Polls a [`JobStore`], routes claimed jobs to registered handlers and
/// applies each job's retry policy to failures.
///
/// Handler patterns: an exact handler name, a `prefix.*` category, or `*`.
pub struct JobExecutor<S: JobStore> {
    store: S,
    handlers: HashMap<String, JobHandler>,
}

impl<S: JobStore + 'static> JobExecutor<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn register_handler<F>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&Job) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(pattern.into(), Box::new(handler));
    }

    fn handler_for(&self, kind: &JobKind) -> Option<&JobHandler> {
        let name = kind.handler_name();
        if let Some(h) = self.handlers.get(name) {
            return Some(h);
        }

        self.handlers
            .iter()
            .filter_map(|(pattern, h)| pattern.strip_suffix(".*").map(|prefix| (prefix, h)))
            .filter(|(prefix, _)| name.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('.')))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, h)| h)
            .or_else(|| self.handlers.get("*"))
    }

    pub fn spawn(self, config: JobExecutorConfig) -> std::io::Result<JobExecutorHandle>
    where
        S: Send,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let loop_stats = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || executor_loop(self, config, shutdown_rx, loop_stats))?;

        Ok(JobExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    /// Claim and run jobs from `queue` until none is ready; returns how many ran.
    pub fn run_pending(&self, queue: Option<&str>) -> Result<usize, JobStoreError> {
        let mut ran = 0;
        while let Some(mut job) = self.store.claim_next(queue, Utc::now())? {
            // The failure is already recorded on the job (retry or dead letter).
            if let Err(error) = self.execute_one(&mut job) {
                debug!(job_id = %job.id, error = %error, status = ?job.status, "pending job failed");
            }
            ran += 1;
        }
        Ok(ran)
    }

    /// Run a job that was already claimed (status `Running`) and persist the outcome.
    pub fn execute_one(&self, job: &mut Job) -> Result<(), String> {
        let started = Utc::now();

        let Some(handler) = self.handler_for(&job.kind) else {
            let error = format!("no handler for job kind: {:?}", job.kind);
            warn!(job_id = %job.id, error = %error, "no handler for job");
            job.mark_failed(error.clone(), started);
            self.persist_outcome(job, &error)?;
            return Err(error);
        };

        let error = match handler(job) {
            JobResult::Success => {
                job.mark_completed(started);
                self.store.update(job).map_err(|e| e.to_string())?;
                debug!(job_id = %job.id, "job completed");
                return Ok(());
            }
            JobResult::Failure(error) => {
                job.mark_failed(error.clone(), started);
                error
            }
            JobResult::RetryNow => {
                let error = "retry requested".to_string();
                job.mark_failed_with_delay(error.clone(), started, Some(Duration::ZERO));
                error
            }
            JobResult::RetryAfter(delay) => {
                let error = "retry after delay".to_string();
                job.mark_failed_with_delay(error.clone(), started, Some(delay));
                error
            }
        };

        self.persist_outcome(job, &error)?;
        Err(error)
    }

    fn persist_outcome(&self, job: &Job, error: &str) -> Result<(), String> {
        self.store.update(job).map_err(|e| e.to_string())?;
        if matches!(job.status, JobStatus::DeadLettered { .. }) {
            warn!(job_id = %job.id, kind = job.kind.handler_name(), error, "job dead-lettered");
            self.store
                .dead_letter(job.clone(), error.to_string())
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

fn executor_loop<S: JobStore + 'static>(
    executor: JobExecutor<S>,
    config: JobExecutorConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    info!(executor = %config.name, queue = ?config.queue, "job executor started");
    let start_time = Instant::now();

    while shutdown_rx.try_recv().is_err() {
        lock_stats(&stats).uptime_secs = start_time.elapsed().as_secs();

        match executor.store.claim_next(config.queue.as_deref(), Utc::now()) {
            Ok(Some(mut job)) => {
                debug!(executor = %config.name, job_id = %job.id, kind = ?job.kind, "claimed job");

                let outcome = executor.execute_one(&mut job);
                lock_stats(&stats).record(&outcome, &job);

                if let Err(e) = outcome {
                    debug!(
                        executor = %config.name,
                        job_id = %job.id,
                        error = %e,
                        status = ?job.status,
                        "job execution failed"
                    );
                }
            }
            Ok(None) => thread::sleep(config.poll_interval),
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to claim job");
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(executor = %config.name, "job executor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::RetryPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn claim(store: &InMemoryJobStore) -> Job {
        store.claim_next(None, Utc::now()).unwrap().unwrap()
    }

    #[test]
    fn execute_successful_job() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());
        executor.register_handler("test", |_job| JobResult::Success);

        store.enqueue(Job::new(JobKind::custom("test"), serde_json::json!({}))).unwrap();

        let mut claimed = claim(&store);
        assert!(executor.execute_one(&mut claimed).is_ok());
        assert!(matches!(claimed.status, JobStatus::Completed));
        assert_eq!(claimed.attempt, 1);
    }

    #[test]
    fn failing_job_is_retried_then_dead_lettered() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());
        executor.register_handler("test", |_job| JobResult::Failure("test error".to_string()));

        let job = Job::new(JobKind::custom("test"), serde_json::json!({}))
            .with_retry_policy(RetryPolicy::fixed(2, Duration::ZERO));
        let job_id = store.enqueue(job).unwrap();

        let mut claimed = claim(&store);
        assert!(executor.execute_one(&mut claimed).is_err());
        assert!(matches!(claimed.status, JobStatus::Failed { .. }));

        let mut claimed = claim(&store);
        assert!(executor.execute_one(&mut claimed).is_err());
        assert!(matches!(claimed.status, JobStatus::DeadLettered { attempts: 2, .. }));

        assert!(store.get(job_id).unwrap().is_none());
        assert_eq!(store.list_dead_letters(10).unwrap().len(), 1);
    }

    #[test]
    fn handler_routing_prefers_exact_then_category_then_wildcard() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());
        executor.register_handler("reports.daily", |_job| JobResult::Success);
        executor.register_handler("reports.*", |_job| JobResult::Failure("category".into()));
        executor.register_handler("*", |_job| JobResult::Failure("wildcard".into()));

        let route = |kind: &str| {
            store
                .enqueue(Job::new(JobKind::custom(kind), serde_json::json!({})).with_retry_policy(RetryPolicy::no_retry()))
                .unwrap();
            let mut job = claim(&store);
            executor.execute_one(&mut job)
        };

        assert_eq!(route("reports.daily"), Ok(()));
        assert_eq!(route("reports.weekly"), Err("category".to_string()));
        assert_eq!(route("reportsx"), Err("wildcard".to_string()));
    }

    #[test]
    fn missing_handler_fails_the_job() {
        let store = InMemoryJobStore::arc();
        let executor = JobExecutor::new(store.clone());
        store
            .enqueue(Job::new(JobKind::materialize("unregistered"), serde_json::json!({})))
            .unwrap();

        let mut job = claim(&store);
        let err = executor.execute_one(&mut job).unwrap_err();
        assert!(err.contains("no handler"));
        assert!(matches!(job.status, JobStatus::Failed { .. }));
    }

    #[test]
    fn run_pending_drains_ready_jobs() {
        let store = InMemoryJobStore::arc();
        let runs = Arc::new(AtomicUsize::new(0));
        let mut executor = JobExecutor::new(store.clone());
        let counter = runs.clone();
        executor.register_handler("test", move |_job| {
            counter.fetch_add(1, Ordering::SeqCst);
            JobResult::Success
        });

        for _ in 0..3 {
            store.enqueue(Job::new(JobKind::custom("test"), serde_json::json!({}))).unwrap();
        }
        store
            .enqueue(Job::new(JobKind::custom("test"), serde_json::json!({})).delayed(Duration::from_secs(3600)))
            .unwrap();

        assert_eq!(executor.run_pending(None).unwrap(), 3);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(store.stats(None).unwrap().pending, 1);
    }

    #[test]
    fn run_pending_counts_failed_jobs_and_records_the_failure() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());
        executor.register_handler("flaky", |_job| JobResult::Failure("boom".to_string()));

        let id = store
            .enqueue(
                Job::new(JobKind::custom("flaky"), serde_json::json!({}))
                    .with_retry_policy(RetryPolicy::fixed(3, Duration::from_secs(60))),
            )
            .unwrap();

        assert_eq!(executor.run_pending(None).unwrap(), 1);
        let job = store.get(id).unwrap().unwrap();
        assert!(matches!(job.status, JobStatus::Failed { ref error, attempt: 1 } if error == "boom"));
        assert_eq!(executor.run_pending(None).unwrap(), 0);
    }

    #[test]
    fn spawned_executor_processes_jobs() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());
        executor.register_handler("test", |_job| JobResult::Success);
        store.enqueue(Job::new(JobKind::custom("test"), serde_json::json!({}))).unwrap();

        let handle = executor
            .spawn(JobExecutorConfig::default().with_poll_interval(Duration::from_millis(5)))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().jobs_processed == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(handle.stats().jobs_succeeded, 1);
        handle.shutdown();
    }
}
