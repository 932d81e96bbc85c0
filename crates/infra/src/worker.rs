//! Background execution of scheduled materializations.

use std::sync::Arc;

use tracing::{debug, warn};

use eventline_core::ValidationErrors;
use eventline_events::Event;

use crate::dispatch::{MaterializeRequest, ProjectionDispatcher};
use crate::event_store::EventStore;
use crate::jobs::{Job, JobExecutor, JobResult, JobStore};
use crate::stream::{EventStreams, ProjectionTier, StreamError};

/// Executes `Materialize` jobs for the async projections of one stream definition.
///
/// Each job reloads the entity's stream as of the requested instant (or the
/// worker's clock when the request left it unresolved), folds it and upserts
/// the result. Materialization is idempotent, so at-least-once delivery is safe.
///
/// With [`PostgresEventStore`](crate::event_store::PostgresEventStore) the
/// executor thread must have entered a tokio runtime.
pub struct MaterializationWorker<E, S, D> {
    streams: Arc<EventStreams<E, S, D>>,
}

impl<E, S, D> MaterializationWorker<E, S, D>
where
    E: Event,
    S: EventStore + 'static,
    D: ProjectionDispatcher + 'static,
{
    pub fn new(streams: Arc<EventStreams<E, S, D>>) -> Self {
        Self { streams }
    }

    /// Route every async projection of the definition to this worker.
    pub fn register<J: JobStore + 'static>(self: Arc<Self>, executor: &mut JobExecutor<J>) {
        for (projection, _) in self.streams.definition().async_projections() {
            let worker = self.clone();
            executor.register_handler(projection.name(), move |job| worker.handle(job));
        }
    }

    pub fn materialize(&self, request: &MaterializeRequest) -> Result<ValidationErrors, StreamError> {
        let as_of = request.as_of.unwrap_or_else(|| self.streams.clock().now());
        let stream = self.streams.for_entity_as_of(request.entity_id, as_of)?;
        stream.rematerialize(ProjectionTier::Async, &request.projection)
    }

    pub fn handle(&self, job: &Job) -> JobResult {
        let request: MaterializeRequest = match serde_json::from_value(job.payload.clone()) {
            Ok(request) => request,
            Err(e) => return JobResult::Failure(format!("invalid materialize payload: {e}")),
        };

        match self.materialize(&request) {
            Ok(errors) => {
                if !errors.is_empty() {
                    debug!(
                        job_id = %job.id,
                        entity_id = %request.entity_id,
                        projection = %request.projection,
                        %errors,
                        "stored materialization is invalid"
                    );
                }
                JobResult::Success
            }
            Err(e) => {
                warn!(
                    job_id = %job.id,
                    entity_id = %request.entity_id,
                    projection = %request.projection,
                    attempt = job.attempt,
                    error = %e,
                    "materialization failed"
                );
                JobResult::Failure(e.to_string())
            }
        }
    }
}
