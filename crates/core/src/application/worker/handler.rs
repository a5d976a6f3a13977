// Job handler contract

use crate::domain::{Job, ValidationError};
use crate::port::TransportError;
use async_trait::async_trait;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Outcome of one handler invocation; `Ok` carries the job's return value
pub type HandlerResult = std::result::Result<serde_json::Value, JobError>;

/// Why a job attempt failed
///
/// The Display text is what the broker stores as the failure reason.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Handler(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl JobError {
    pub fn handler(message: impl Display) -> Self {
        Self::Handler(message.to_string())
    }

    /// Short label used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Handler(_) => "handler",
            Self::Panicked(_) => "panic",
        }
    }
}

impl From<TransportError> for JobError {
    fn from(err: TransportError) -> Self {
        Self::Handler(err.to_string())
    }
}

/// Processes one claimed job
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, job: Job) -> HandlerResult {
        (self)(job).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(f)
}
