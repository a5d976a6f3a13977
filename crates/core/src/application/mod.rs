// Application Layer - Use Cases and orchestration

pub mod email;
pub mod flow;
pub mod maintenance;
pub mod pipeline;
pub mod queue;
pub mod recovery;
pub mod worker;

// Re-exports
pub use email::{EmailListener, EmailSchema, EmailService, EMAIL_QUEUE, EMAIL_WORKER_CONCURRENCY};
pub use flow::FlowComposer;
pub use maintenance::CleanupScheduler;
pub use pipeline::{DispatchPipeline, JobSchema, PayloadHandler};
pub use queue::{Queue, QueueRegistry};
pub use recovery::RecoveryService;
pub use worker::{
    handler_fn, shutdown_channel, HandlerResult, JobError, JobHandler, ShutdownSender,
    ShutdownToken, WorkerHandle, WorkerOptions, WorkerRuntime, WorkerState, MAX_CONCURRENCY,
};
