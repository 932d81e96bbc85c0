//! Projection dispatch: synchronous (inside the append transaction) and
//! scheduled (background job after commit).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use eventline_core::{EntityId, ValidationErrors};
use eventline_events::{Event, Materializer, ProjectionError};

use crate::event_store::{StoreTransaction, TransactionSink};
use crate::jobs::{DEFAULT_QUEUE, Job, JobId, JobKind, JobStore, JobStoreError, RetryPolicy};

/// "Materialize projection P for entity E as of T".
///
/// `as_of = None` is the unresolved marker: the executor substitutes its own
/// execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializeRequest {
    pub entity_id: EntityId,
    pub projection: String,
    pub as_of: Option<DateTime<Utc>>,
}

/// Scheduling options of one async projection registration.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleOptions {
    pub queue: String,
    pub delay: Option<Duration>,
    pub priority: i32,
    pub retry_policy: RetryPolicy,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            delay: None,
            priority: 0,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl ScheduleOptions {
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
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
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to encode materialize request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to enqueue materialize job: {0}")]
    Enqueue(#[from] JobStoreError),
}

pub trait ProjectionDispatcher: Send + Sync {
    /// Materialize `projection` over `events` at `as_of` inside `tx`. Failures
    /// propagate and must abort the surrounding transaction.
    fn run_now<E: Event>(
        &self,
        tx: &mut (dyn StoreTransaction + '_),
        projection: &dyn Materializer<E>,
        entity_id: EntityId,
        as_of: DateTime<Utc>,
        events: &[&E],
    ) -> Result<ValidationErrors, ProjectionError> {
        let mut sink = TransactionSink::new(tx);
        projection.materialize_into(events, entity_id, as_of, &mut sink)
    }

    /// Fire-and-forget; the outcome of the work itself is not observable here.
    fn schedule(&self, options: &ScheduleOptions, request: MaterializeRequest) -> Result<(), DispatchError>;
}

/// Dispatcher that schedules onto the background job queue.
#[derive(Debug, Clone)]
pub struct JobQueueDispatcher<J> {
    jobs: J,
}

impl<J: JobStore> JobQueueDispatcher<J> {
    pub fn new(jobs: J) -> Self {
        Self { jobs }
    }

    pub fn jobs(&self) -> &J {
        &self.jobs
    }

    pub fn enqueue(&self, options: &ScheduleOptions, request: &MaterializeRequest) -> Result<JobId, DispatchError> {
        let payload = serde_json::to_value(request)?;
        let mut job = Job::new(JobKind::materialize(request.projection.clone()), payload)
            .on_queue(options.queue.clone())
            .with_priority(options.priority)
            .with_retry_policy(options.retry_policy.clone());
        if let Some(delay) = options.delay {
            job = job.delayed(delay);
        }

        let id = self.jobs.enqueue(job)?;
        debug!(
            job_id = %id,
            entity_id = %request.entity_id,
            projection = %request.projection,
            queue = %options.queue,
            as_of = ?request.as_of,
            "scheduled materialization"
        );
        Ok(id)
    }
}

impl<J: JobStore> ProjectionDispatcher for JobQueueDispatcher<J> {
    fn schedule(&self, options: &ScheduleOptions, request: MaterializeRequest) -> Result<(), DispatchError> {
        self.enqueue(options, &request).map(|_| ())
    }
}

impl<D: ProjectionDispatcher> ProjectionDispatcher for Arc<D> {
    fn run_now<E: Event>(
        &self,
        tx: &mut (dyn StoreTransaction + '_),
        projection: &dyn Materializer<E>,
        entity_id: EntityId,
        as_of: DateTime<Utc>,
        events: &[&E],
    ) -> Result<ValidationErrors, ProjectionError> {
        (**self).run_now(tx, projection, entity_id, as_of, events)
    }

    fn schedule(&self, options: &ScheduleOptions, request: MaterializeRequest) -> Result<(), DispatchError> {
        (**self).schedule(options, request)
    }
}
