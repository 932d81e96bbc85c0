//! Background job system with queues, priorities, retry/backoff and a
//! dead-letter queue.
//!
//! - `Job`: routed by [`JobKind`], placed on a named queue, claimed by
//!   priority then age
//! - `JobStore`: persistence for jobs (in-memory here)
//! - `JobExecutor`: runs claimed jobs through registered handlers

pub mod executor;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, DEFAULT_QUEUE, DeadLetterEntry, Job, JobId, JobKind, JobResult, JobStatus,
    RetryPolicy,
};
