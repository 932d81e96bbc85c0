//! Job records, routing kinds and retry policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue used when a job is enqueued without naming one.
pub const DEFAULT_QUEUE: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// What a job does; the executor routes on [`JobKind::handler_name`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Recompute and store one projection for one entity.
    Materialize { projection: String },
    Custom { kind: String },
}

impl JobKind {
    pub fn materialize(projection: impl Into<String>) -> Self {
        Self::Materialize {
            projection: projection.into(),
        }
    }

    pub fn custom(kind: impl Into<String>) -> Self {
        Self::Custom { kind: kind.into() }
    }

    pub fn handler_name(&self) -> &str {
        match self {
            JobKind::Materialize { projection } => projection,
            JobKind::Custom { kind } => kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    /// Failed; eligible again once `available_at` passes.
    Failed { error: String, attempt: u32 },
    /// Out of retries.
    DeadLettered { error: String, attempts: u32 },
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::DeadLettered { .. } | JobStatus::Cancelled
        )
    }

    /// Whether a worker may claim a job in this status.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    #[default]
    Exponential,
    Linear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first. 1 disables retries.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Fraction (0.0-1.0) of the delay that is perturbed per attempt.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.base_delay.as_millis() as f64;
        let raw = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => base * 2_f64.powi(attempt.saturating_sub(1).min(30) as i32),
            BackoffStrategy::Linear => base * f64::from(attempt),
        };
        let capped = raw.min(self.max_delay.as_millis() as f64);

        // Deterministic perturbation in [-jitter, +jitter) keyed on the attempt.
        let spread = capped * self.jitter.clamp(0.0, 1.0);
        let offset = if spread > 0.0 {
            let unit = f64::from((attempt * 37) % 100) / 100.0;
            spread * (unit * 2.0 - 1.0)
        } else {
            0.0
        };

        Duration::from_millis((capped + offset).max(0.0) as u64)
    }

    pub fn allows_another_attempt(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// A queued unit of background work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub queue: String,
    /// Higher runs first among ready jobs in the same queue.
    pub priority: i32,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub retry_policy: RetryPolicy,
    /// Attempts started so far.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Not claimable before this instant.
    pub available_at: Option<DateTime<Utc>>,
    pub history: Vec<JobAttemptRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(kind: JobKind, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            kind,
            queue: DEFAULT_QUEUE.to_string(),
            priority: 0,
            payload,
            status: JobStatus::Pending,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            created_at: now,
            updated_at: now,
            available_at: None,
            history: Vec::new(),
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }

    /// Hold the job back for `delay` after its creation.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.available_at = Some(self.created_at + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.available_at.is_none_or(|at| now >= at)
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.updated_at = now;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            error: None,
        });
    }

    /// Record a failed attempt; schedules a retry or dead-letters the job.
    pub fn mark_failed(&mut self, error: String, started_at: DateTime<Utc>) {
        self.mark_failed_with_delay(error, started_at, None)
    }

    /// Like [`mark_failed`](Self::mark_failed), overriding the policy's backoff.
    pub fn mark_failed_with_delay(&mut self, error: String, started_at: DateTime<Utc>, delay: Option<Duration>) {
        let now = Utc::now();
        self.updated_at = now;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            error: Some(error.clone()),
        });

        if self.retry_policy.allows_another_attempt(self.attempt) {
            let delay = delay.unwrap_or_else(|| self.retry_policy.delay_after(self.attempt));
            self.available_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            self.status = JobStatus::Failed {
                error,
                attempt: self.attempt,
            };
        } else {
            self.status = JobStatus::DeadLettered {
                error,
                attempts: self.attempt,
            };
        }
    }

    pub fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.updated_at = Utc::now();
    }
}

/// Outcome reported by a job handler.
#[derive(Debug)]
pub enum JobResult {
    Success,
    /// Failed; retried per the job's policy.
    Failure(String),
    /// Transient failure; retry without backoff.
    RetryNow,
    RetryAfter(Duration),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: String) -> Self {
        Self {
            job,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            strategy,
            jitter: 0.0,
        }
    }

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let policy = no_jitter(BackoffStrategy::Exponential);
        let delays: Vec<u128> = (1..=5).map(|a| policy.delay_after(a).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn linear_and_fixed_backoff() {
        let linear = no_jitter(BackoffStrategy::Linear);
        assert_eq!(linear.delay_after(3), Duration::from_millis(300));

        let fixed = RetryPolicy::fixed(3, Duration::from_millis(250));
        assert_eq!(fixed.delay_after(1), fixed.delay_after(3));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..no_jitter(BackoffStrategy::Fixed)
        };
        for attempt in 1..20 {
            let ms = policy.delay_after(attempt).as_millis();
            assert!((50..=150).contains(&ms), "attempt {attempt}: {ms}ms");
        }
    }

    #[test]
    fn kind_serializes_with_type_tag() {
        let json = serde_json::to_value(JobKind::materialize("counter_balance")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "type": "materialize", "projection": "counter_balance" })
        );
    }

    #[test]
    fn failed_job_is_retried_then_dead_lettered() {
        let mut job = Job::new(JobKind::custom("test"), serde_json::json!({}))
            .with_retry_policy(RetryPolicy::fixed(2, Duration::from_millis(10)));

        job.mark_running();
        job.mark_failed("first".to_string(), Utc::now());
        assert!(matches!(job.status, JobStatus::Failed { attempt: 1, .. }));
        assert!(job.available_at.is_some());
        assert!(!job.is_ready_at(job.updated_at));

        job.mark_running();
        job.mark_failed("second".to_string(), Utc::now());
        assert!(matches!(job.status, JobStatus::DeadLettered { attempts: 2, .. }));
        assert_eq!(job.history.len(), 2);
        assert!(!job.is_ready_at(Utc::now() + chrono::Duration::hours(1)));
    }

    #[test]
    fn delayed_job_becomes_ready_after_delay() {
        let job = Job::new(JobKind::custom("test"), serde_json::json!({})).delayed(Duration::from_secs(30));
        assert!(!job.is_ready_at(job.created_at));
        assert!(job.is_ready_at(job.created_at + chrono::Duration::seconds(30)));
    }
}
