// Queue Registry - one memoized handle per queue name

use crate::domain::{
    validate_queue_name, Job, JobCounts, JobId, JobOptions, JobState, NewJob, QueueName,
};
use crate::error::{AppError, Result};
use crate::port::Broker;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// Handle to one named queue on the shared broker
pub struct Queue {
    name: QueueName,
    broker: Arc<dyn Broker>,
}

impl Queue {
    fn new(name: QueueName, broker: Arc<dyn Broker>) -> Self {
        Self { name, broker }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit a job to this queue
    ///
    /// The job is claimable by workers once this returns `Ok`.
    pub async fn add(
        &self,
        job_name: impl Into<String>,
        payload: serde_json::Value,
        options: Option<JobOptions>,
    ) -> Result<JobId> {
        let job = NewJob::new(job_name, self.name.clone(), payload)
            .with_options(options.unwrap_or_default());
        job.validate()?;

        let job_name = job.name.clone();
        let id = self.broker.add_job(job).await?;
        debug!(queue = %self.name, job_id = %id, job_name = %job_name, "Job added");
        Ok(id)
    }

    /// Find a job of this queue by ID
    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        let job = self.broker.get_job(id).await?;
        Ok(job.filter(|j| j.queue == self.name))
    }

    pub async fn count(&self, state: JobState) -> Result<i64> {
        self.broker.count_by_state(&self.name, state).await
    }

    pub async fn job_counts(&self) -> Result<JobCounts> {
        self.broker.job_counts(&self.name).await
    }

    /// Remove COMPLETED or FAILED jobs that finished more than `grace` ago
    pub async fn clean(&self, grace: Duration, state: JobState) -> Result<u64> {
        if !state.is_finished() {
            return Err(AppError::InvalidState(format!(
                "only finished jobs can be cleaned, got {}",
                state
            )));
        }
        let removed = self
            .broker
            .clean(&self.name, state, i64::try_from(grace.as_millis()).unwrap_or(i64::MAX))
            .await?;
        if removed > 0 {
            info!(queue = %self.name, state = %state, removed, "Queue cleaned");
        }
        Ok(removed)
    }
}

/// Creates queue handles lazily and caches them for the process lifetime
pub struct QueueRegistry {
    broker: Arc<dyn Broker>,
    queues: Mutex<HashMap<QueueName, Arc<Queue>>>,
}

impl QueueRegistry {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Shared broker connection
    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    /// Return the cached handle for `name`, creating it on first use
    ///
    /// Concurrent first calls for one name all get the same handle.
    pub fn get_or_create_queue(&self, name: &str) -> Result<Arc<Queue>> {
        validate_queue_name(name)?;

        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = queues.entry(name.to_string()).or_insert_with(|| {
            info!(queue = %name, "Queue handle created");
            Arc::new(Queue::new(name.to_string(), Arc::clone(&self.broker)))
        });
        Ok(Arc::clone(queue))
    }

    /// Submit a job to `queue_name`, creating the handle if needed
    pub async fn enqueue(
        &self,
        queue_name: &str,
        job_name: impl Into<String>,
        payload: serde_json::Value,
        options: Option<JobOptions>,
    ) -> Result<JobId> {
        let queue = self.get_or_create_queue(queue_name)?;
        queue.add(job_name, payload, options).await
    }

    /// Names of every queue handle created so far
    pub fn queue_names(&self) -> Vec<QueueName> {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = queues.keys().cloned().collect();
        names.sort();
        names
    }
}
