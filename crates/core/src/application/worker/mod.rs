// Worker - bounded-concurrency job execution loop

pub mod constants;
mod handler;
mod panic_guard;
mod shutdown;

use constants::*;
pub use handler::{handler_fn, HandlerResult, JobError, JobHandler};
pub use panic_guard::panic_message;
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};

use crate::domain::{validate_queue_name, DomainError, Job, JobId};
use crate::error::Result;
use crate::port::{Broker, FailureOutcome};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Largest accepted concurrency: every permit must fit one `acquire_many`
pub const MAX_CONCURRENCY: usize = if Semaphore::MAX_PERMITS < u32::MAX as usize {
    Semaphore::MAX_PERMITS
} else {
    u32::MAX as usize
};

/// Polling knobs shared by every worker of a runtime
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub poll_interval: Duration,
    pub error_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: IDLE_POLL_INTERVAL,
            error_backoff: ERROR_RECOVERY_SLEEP_DURATION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Listening, nothing in flight
    Idle,
    /// At least one job in flight
    Active,
}

#[derive(Default)]
struct WorkerStats {
    in_flight: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Observer for one registered worker
#[derive(Clone)]
pub struct WorkerHandle {
    id: String,
    queue: String,
    concurrency: usize,
    stats: Arc<WorkerStats>,
}

impl WorkerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn state(&self) -> WorkerState {
        if self.in_flight() > 0 {
            WorkerState::Active
        } else {
            WorkerState::Idle
        }
    }

    /// Jobs currently being handled (never above `concurrency`)
    pub fn in_flight(&self) -> usize {
        self.stats.in_flight.load(Ordering::SeqCst)
    }

    /// Jobs whose handler returned Ok
    pub fn completed(&self) -> u64 {
        self.stats.completed.load(Ordering::SeqCst)
    }

    /// Attempts that ended in a handler error or panic
    pub fn failed(&self) -> u64 {
        self.stats.failed.load(Ordering::SeqCst)
    }
}

/// Owns every worker of the process and their shutdown signal
pub struct WorkerRuntime {
    broker: Arc<dyn Broker>,
    options: WorkerOptions,
    shutdown: ShutdownSender,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    handles: Mutex<Vec<WorkerHandle>>,
    next_worker: AtomicU64,
}

impl WorkerRuntime {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_options(broker, WorkerOptions::default())
    }

    pub fn with_options(broker: Arc<dyn Broker>, options: WorkerOptions) -> Self {
        let (shutdown, _) = shutdown_channel();
        Self {
            broker,
            options,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            next_worker: AtomicU64::new(0),
        }
    }

    /// Start consuming `queue_name` with at most `concurrency` jobs in flight
    ///
    /// The worker listens until `shutdown` is called. Must be called from
    /// within a tokio runtime.
    ///
    /// # Errors
    /// - DomainError::InvalidQueueName for a malformed name
    /// - DomainError::InvalidConcurrency if `concurrency` is zero
    pub fn register_worker(
        &self,
        queue_name: &str,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
    ) -> Result<WorkerHandle> {
        validate_queue_name(queue_name)?;
        if concurrency == 0 || concurrency > MAX_CONCURRENCY {
            return Err(DomainError::InvalidConcurrency(concurrency).into());
        }

        let id = format!(
            "{}#{}",
            queue_name,
            self.next_worker.fetch_add(1, Ordering::SeqCst) + 1
        );
        let handle = WorkerHandle {
            id: id.clone(),
            queue: queue_name.to_string(),
            concurrency,
            stats: Arc::new(WorkerStats::default()),
        };

        let worker = Worker {
            id,
            queue: queue_name.to_string(),
            concurrency,
            handler,
            broker: Arc::clone(&self.broker),
            slots: Arc::new(Semaphore::new(concurrency)),
            stats: Arc::clone(&handle.stats),
            options: self.options.clone(),
        };
        let task = tokio::spawn(worker.run(self.shutdown.token()));

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle.clone());
        Ok(handle)
    }

    /// Handles of every worker registered so far
    pub fn workers(&self) -> Vec<WorkerHandle> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// Stop claiming and wait up to `grace` for in-flight jobs to finish
    ///
    /// Returns `true` if every worker drained in time. Jobs still running
    /// after the grace period stay ACTIVE and are picked up by stalled-job
    /// recovery on the next start.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        info!("Shutting down workers");
        self.shutdown.shutdown();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let drained = tokio::time::timeout(grace, async {
            for task in tasks {
                if let Err(e) = task.await {
                    error!(error = %e, "Worker task ended abnormally");
                }
            }
        })
        .await
        .is_ok();

        if drained {
            info!("All workers stopped");
        } else {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "Shutdown grace period elapsed with jobs in flight"
            );
        }
        drained
    }
}

/// Consumes one queue
struct Worker {
    id: String,
    queue: String,
    concurrency: usize,
    handler: Arc<dyn JobHandler>,
    broker: Arc<dyn Broker>,
    slots: Arc<Semaphore>,
    stats: Arc<WorkerStats>,
    options: WorkerOptions,
}

impl Worker {
    /// Run worker loop with graceful shutdown support
    async fn run(self, mut shutdown: ShutdownToken) {
        info!(
            worker_id = %self.id,
            queue = %self.queue,
            concurrency = self.concurrency,
            "Worker started"
        );

        loop {
            // A free slot comes first so no job is claimed without capacity
            let permit = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            match self.broker.claim_next(&self.queue).await {
                Ok(Some(job)) => self.dispatch(job, permit),
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = sleep(self.options.poll_interval) => {},
                        _ = shutdown.wait() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(worker_id = %self.id, error = %e, "Failed to claim job");
                    tokio::select! {
                        _ = sleep(self.options.error_backoff) => {},
                        _ = shutdown.wait() => {
                            info!(worker_id = %self.id, "Worker interrupted during error recovery");
                            break;
                        }
                    }
                }
            }
        }

        // Every slot back means every in-flight job has been reported
        info!(
            worker_id = %self.id,
            in_flight = self.stats.in_flight.load(Ordering::SeqCst),
            "Worker draining"
        );
        let permits = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        let _ = self.slots.acquire_many(permits).await;
        info!(worker_id = %self.id, queue = %self.queue, "Worker stopped");
    }

    /// Run the handler in its own task and report the outcome to the broker
    fn dispatch(&self, job: Job, permit: OwnedSemaphorePermit) {
        let broker = Arc::clone(&self.broker);
        let handler = Arc::clone(&self.handler);
        let stats = Arc::clone(&self.stats);
        let worker_id = self.id.clone();
        let retry_backoff = self.options.error_backoff;

        stats.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let job_id = job.id.clone();
            debug!(worker_id = %worker_id, job_id = %job_id, job_name = %job.name, "Processing job");

            // Panics stay inside this inner task
            let outcome = match tokio::spawn(async move { handler.handle(job).await }).await {
                Ok(result) => result,
                Err(join_err) => Err(JobError::Panicked(panic_message(join_err))),
            };

            match &outcome {
                Ok(_) => stats.completed.fetch_add(1, Ordering::SeqCst),
                Err(_) => stats.failed.fetch_add(1, Ordering::SeqCst),
            };
            report(broker.as_ref(), &job_id, outcome, retry_backoff).await;

            stats.in_flight.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        });
    }
}

async fn report(broker: &dyn Broker, job_id: &JobId, outcome: HandlerResult, backoff: Duration) {
    match outcome {
        Ok(value) => {
            let recorded = with_retries(job_id, backoff, move || {
                broker.complete(job_id, value.clone())
            })
            .await;
            match recorded {
                Ok(()) => info!(job_id = %job_id, "Job completed"),
                Err(e) => error!(job_id = %job_id, error = %e, "Failed to record job completion"),
            }
        }
        Err(job_err) => {
            let reason = job_err.to_string();
            let reason_ref = reason.as_str();
            let recorded =
                with_retries(job_id, backoff, move || broker.fail(job_id, reason_ref)).await;
            match recorded {
                Ok(FailureOutcome::Retrying { attempt, delay_ms }) => warn!(
                    job_id = %job_id,
                    kind = job_err.kind(),
                    attempt,
                    delay_ms,
                    error = %reason,
                    "Job failed, will retry"
                ),
                Ok(FailureOutcome::Failed) => error!(
                    job_id = %job_id,
                    kind = job_err.kind(),
                    error = %reason,
                    "Job failed"
                ),
                Err(e) => error!(job_id = %job_id, error = %e, "Failed to record job failure"),
            }
        }
    }
}

/// Retry a broker write on transient errors, up to REPORT_ATTEMPTS tries
///
/// A job whose outcome still cannot be recorded stays ACTIVE until
/// stalled-job recovery picks it up.
async fn with_retries<T, F, Fut>(job_id: &JobId, backoff: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < REPORT_ATTEMPTS => {
                warn!(job_id = %job_id, attempt, error = %e, "Broker busy, retrying report");
                sleep(backoff).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobOptions, JobState};
    use crate::error::AppError;
    use crate::port::broker::mocks::InMemoryBroker;
    use serde_json::json;
    use tokio::sync::Notify;

    fn fast_options() -> WorkerOptions {
        WorkerOptions {
            poll_interval: Duration::from_millis(5),
            error_backoff: Duration::from_millis(5),
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn enqueue(broker: &InMemoryBroker, queue: &str, name: &str) -> JobId {
        broker
            .add_job(crate::domain::NewJob::new(name, queue, json!({})))
            .await
            .unwrap()
    }

    fn state_of(broker: &InMemoryBroker, id: &JobId) -> JobState {
        broker.jobs().into_iter().find(|j| &j.id == id).unwrap().state
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected() {
        let broker = Arc::new(InMemoryBroker::new());
        let runtime = WorkerRuntime::new(broker);
        let handler = handler_fn(|_job| async { Ok(json!(null)) });

        let result = runtime.register_worker("q", handler, 0);
        assert!(matches!(
            result,
            Err(AppError::Domain(DomainError::InvalidConcurrency(0)))
        ));
    }

    #[tokio::test]
    async fn test_oversized_concurrency_rejected() {
        let broker = Arc::new(InMemoryBroker::new());
        let runtime = WorkerRuntime::new(broker);

        for concurrency in [MAX_CONCURRENCY + 1, usize::MAX] {
            let handler = handler_fn(|_job| async { Ok(json!(null)) });
            let result = runtime.register_worker("q", handler, concurrency);
            assert!(matches!(
                result,
                Err(AppError::Domain(DomainError::InvalidConcurrency(c))) if c == concurrency
            ));
        }
        assert!(runtime.workers().is_empty());
    }

    #[tokio::test]
    async fn test_successful_job_is_completed() {
        let broker = Arc::new(InMemoryBroker::new());
        let runtime = WorkerRuntime::with_options(broker.clone(), fast_options());
        let id = enqueue(&broker, "q", "work").await;

        let handler = handler_fn(|job| async move { Ok(json!({ "done": job.name })) });
        let worker = runtime.register_worker("q", handler, 1).unwrap();

        wait_for(|| state_of(&broker, &id) == JobState::Completed).await;
        let job = broker.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.return_value, Some(json!({"done": "work"})));
        assert_eq!(worker.completed(), 1);

        assert!(runtime.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_handler_error_fails_job_with_message() {
        let broker = Arc::new(InMemoryBroker::new());
        let runtime = WorkerRuntime::with_options(broker.clone(), fast_options());
        let id = enqueue(&broker, "q", "work").await;

        let handler = handler_fn(|_job| async { Err(JobError::handler("SMTP fail")) });
        runtime.register_worker("q", handler, 1).unwrap();

        wait_for(|| state_of(&broker, &id) == JobState::Failed).await;
        let job = broker.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.failed_reason.as_deref(), Some("SMTP fail"));
        assert_eq!(job.attempts_made, 1);

        runtime.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_panic_fails_job_and_worker_keeps_running() {
        let broker = Arc::new(InMemoryBroker::new());
        let runtime = WorkerRuntime::with_options(broker.clone(), fast_options());
        let bad = enqueue(&broker, "q", "explode").await;

        let handler = handler_fn(|job| async move {
            if job.name == "explode" {
                panic!("handler blew up");
            }
            Ok(json!(null))
        });
        let worker = runtime.register_worker("q", handler, 1).unwrap();

        wait_for(|| state_of(&broker, &bad) == JobState::Failed).await;
        let job = broker.get_job(&bad).await.unwrap().unwrap();
        assert!(job.failed_reason.unwrap().contains("handler blew up"));

        let good = enqueue(&broker, "q", "fine").await;
        wait_for(|| state_of(&broker, &good) == JobState::Completed).await;
        assert_eq!(worker.failed(), 1);
        assert_eq!(worker.completed(), 1);

        runtime.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_retry_until_attempts_exhausted() {
        let broker = Arc::new(InMemoryBroker::new());
        let runtime = WorkerRuntime::with_options(broker.clone(), fast_options());
        let id = broker
            .add_job(
                crate::domain::NewJob::new("flaky", "q", json!({}))
                    .with_options(JobOptions::default().with_attempts(3)),
            )
            .await
            .unwrap();

        let handler = handler_fn(|_job| async { Err(JobError::handler("nope")) });
        let worker = runtime.register_worker("q", handler, 1).unwrap();

        wait_for(|| state_of(&broker, &id) == JobState::Failed).await;
        assert_eq!(worker.failed(), 3);
        let job = broker.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 3);

        runtime.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_concurrency() {
        let broker = Arc::new(InMemoryBroker::new());
        let runtime = WorkerRuntime::with_options(broker.clone(), fast_options());
        for i in 0..6 {
            enqueue(&broker, "q", &format!("job-{}", i)).await;
        }

        let gate = Arc::new(Notify::new());
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        let handler = {
            let (gate, peak, current) = (gate.clone(), peak.clone(), current.clone());
            handler_fn(move |_job| {
                let (gate, peak, current) = (gate.clone(), peak.clone(), current.clone());
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    gate.notified().await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            })
        };
        let worker = runtime.register_worker("q", handler, 2).unwrap();

        wait_for(|| current.load(Ordering::SeqCst) == 2).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(worker.in_flight(), 2);
        assert_eq!(worker.state(), WorkerState::Active);
        assert_eq!(
            broker
                .jobs()
                .iter()
                .filter(|j| j.state == JobState::Active)
                .count(),
            2
        );

        while worker.completed() < 6 {
            gate.notify_waiters();
            sleep(Duration::from_millis(5)).await;
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        wait_for(|| worker.state() == WorkerState::Idle).await;

        runtime.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_job() {
        let broker = Arc::new(InMemoryBroker::new());
        let runtime = WorkerRuntime::with_options(broker.clone(), fast_options());
        let id = enqueue(&broker, "q", "slow").await;

        let handler = handler_fn(|_job| async {
            sleep(Duration::from_millis(100)).await;
            Ok(json!(null))
        });
        let worker = runtime.register_worker("q", handler, 1).unwrap();

        wait_for(|| worker.in_flight() == 1).await;
        assert!(runtime.shutdown(Duration::from_secs(2)).await);
        assert_eq!(state_of(&broker, &id), JobState::Completed);
        assert!(runtime.is_shutdown());
    }

    #[tokio::test]
    async fn test_worker_only_claims_its_queue() {
        let broker = Arc::new(InMemoryBroker::new());
        let runtime = WorkerRuntime::with_options(broker.clone(), fast_options());
        let other = enqueue(&broker, "other", "job").await;
        let mine = enqueue(&broker, "mine", "job").await;

        let handler = handler_fn(|_job| async { Ok(json!(null)) });
        runtime.register_worker("mine", handler, 1).unwrap();

        wait_for(|| state_of(&broker, &mine) == JobState::Completed).await;
        assert_eq!(state_of(&broker, &other), JobState::Waiting);

        runtime.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_failure_report_retried_after_broker_error() {
        let broker = Arc::new(InMemoryBroker::new());
        let runtime = WorkerRuntime::with_options(broker.clone(), fast_options());
        let id = enqueue(&broker, "q", "work").await;
        broker.fail_next_reports(2);

        let handler = handler_fn(|_job| async { Err(JobError::handler("SMTP fail")) });
        runtime.register_worker("q", handler, 1).unwrap();

        wait_for(|| state_of(&broker, &id) == JobState::Failed).await;
        let job = broker.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.failed_reason.as_deref(), Some("SMTP fail"));
        assert_eq!(job.attempts_made, 1);
        assert_eq!(broker.report_calls(), 3);

        runtime.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_completion_report_retried_after_broker_error() {
        let broker = Arc::new(InMemoryBroker::new());
        let runtime = WorkerRuntime::with_options(broker.clone(), fast_options());
        let id = enqueue(&broker, "q", "work").await;
        broker.fail_next_reports(1);

        let handler = handler_fn(|_job| async { Ok(json!("sent")) });
        runtime.register_worker("q", handler, 1).unwrap();

        wait_for(|| state_of(&broker, &id) == JobState::Completed).await;
        assert_eq!(broker.report_calls(), 2);

        runtime.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_unrecorded_outcome_leaves_job_active_and_frees_slot() {
        let broker = Arc::new(InMemoryBroker::new());
        let runtime = WorkerRuntime::with_options(broker.clone(), fast_options());
        let stuck = enqueue(&broker, "q", "stuck").await;
        broker.fail_next_reports(u64::from(REPORT_ATTEMPTS));

        let handler = handler_fn(|_job| async { Ok(json!(null)) });
        runtime.register_worker("q", handler, 1).unwrap();

        wait_for(|| broker.report_calls() == u64::from(REPORT_ATTEMPTS)).await;
        let next = enqueue(&broker, "q", "next").await;
        wait_for(|| state_of(&broker, &next) == JobState::Completed).await;
        assert_eq!(state_of(&broker, &stuck), JobState::Active);

        runtime.shutdown(Duration::from_secs(1)).await;
    }
}
