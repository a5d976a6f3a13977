// Email use case and its queue listener

use crate::application::pipeline::{DispatchPipeline, JobSchema, PayloadHandler};
use crate::application::worker::{HandlerResult, WorkerHandle, WorkerRuntime};
use crate::domain::{EmailMessage, Validation};
use crate::error::Result;
use crate::port::{EmailTransport, TransportError};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Queue the email worker listens on
pub const EMAIL_QUEUE: &str = "email-queue";

/// Email jobs handled at once per process
pub const EMAIL_WORKER_CONCURRENCY: usize = 3;

/// Job name used by producers
pub const SEND_EMAIL_JOB: &str = "send-email";

/// `{ to, subject, text }` payload schema
pub struct EmailSchema;

impl JobSchema for EmailSchema {
    type Output = EmailMessage;

    fn validate(payload: &serde_json::Value) -> Validation<EmailMessage> {
        EmailMessage::parse(payload)
    }
}

/// Sends one already-validated email
pub struct EmailService {
    transport: Arc<dyn EmailTransport>,
}

impl EmailService {
    pub fn new(transport: Arc<dyn EmailTransport>) -> Self {
        Self { transport }
    }

    /// Deliver `message` through the transport
    ///
    /// Transport failures are returned unchanged so the job carries the
    /// transport's message as its failure reason.
    pub async fn execute(&self, message: &EmailMessage) -> std::result::Result<(), TransportError> {
        info!(to = %message.to, subject = %message.subject, "Sending email");
        self.transport
            .send_mail(&message.to, &message.subject, &message.text)
            .await
    }
}

#[async_trait]
impl PayloadHandler<EmailMessage> for EmailService {
    async fn process(&self, payload: EmailMessage) -> HandlerResult {
        self.execute(&payload).await?;
        Ok(json!({ "delivered_to": payload.to }))
    }
}

/// Binds the email use case to its queue
pub struct EmailListener {
    service: EmailService,
    queue: String,
    concurrency: usize,
}

impl EmailListener {
    pub fn new(service: EmailService) -> Self {
        Self {
            service,
            queue: EMAIL_QUEUE.to_string(),
            concurrency: EMAIL_WORKER_CONCURRENCY,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Start the email worker on `runtime`
    pub fn register(self, runtime: &WorkerRuntime) -> Result<WorkerHandle> {
        let pipeline = DispatchPipeline::<EmailSchema, _>::new(self.service);
        let handle = runtime.register_worker(&self.queue, Arc::new(pipeline), self.concurrency)?;
        info!(queue = %self.queue, concurrency = self.concurrency, "Email listener registered");
        Ok(handle)
    }
}
