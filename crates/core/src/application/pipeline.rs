// Job Dispatch Pipeline - validation gate in front of a typed handler

use crate::application::worker::{HandlerResult, JobError, JobHandler};
use crate::domain::{Job, Validation, ValidationError};
use async_trait::async_trait;
use std::marker::PhantomData;
use tracing::{debug, warn};

/// Turns an untyped payload into a typed value, or lists what is wrong with it
pub trait JobSchema: Send + Sync + 'static {
    type Output: Send + 'static;

    fn validate(payload: &serde_json::Value) -> Validation<Self::Output>;
}

/// Business logic that only ever sees validated payloads
#[async_trait]
pub trait PayloadHandler<T>: Send + Sync {
    async fn process(&self, payload: T) -> HandlerResult;
}

/// Validates each job against `S` and hands the typed payload to `H`
///
/// An invalid payload fails the job with a `fails validation: ...` reason and
/// `H` is never called.
pub struct DispatchPipeline<S, H> {
    handler: H,
    _schema: PhantomData<fn() -> S>,
}

impl<S, H> DispatchPipeline<S, H>
where
    S: JobSchema,
    H: PayloadHandler<S::Output>,
{
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _schema: PhantomData,
        }
    }
}

#[async_trait]
impl<S, H> JobHandler for DispatchPipeline<S, H>
where
    S: JobSchema,
    H: PayloadHandler<S::Output> + 'static,
{
    async fn handle(&self, job: Job) -> HandlerResult {
        let payload = match S::validate(job.payload.as_value()) {
            Validation::Valid(payload) => payload,
            Validation::Invalid(violations) => {
                let err = ValidationError::new(violations);
                warn!(job_id = %job.id, job_name = %job.name, error = %err, "Payload rejected");
                return Err(JobError::Validation(err));
            }
        };

        debug!(job_id = %job.id, job_name = %job.name, "Payload validated");
        self.handler.process(payload).await
    }
}
