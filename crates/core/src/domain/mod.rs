// Domain Layer - Jobs, flows, queues and the email payload

pub mod email;
pub mod error;
pub mod flow;
pub mod job;
pub mod queue;
pub mod validation;

// Re-exports
pub use email::EmailMessage;
pub use error::DomainError;
pub use flow::{ChildJob, FlowJob, FlowNode};
pub use job::{
    Backoff, BackoffKind, Job, JobCounts, JobId, JobName, JobOptions, JobPayload, JobState,
    NewJob, Priority,
};
pub use queue::{validate_queue_name, QueueName};
pub use validation::{FieldViolation, Validation, ValidationError};
