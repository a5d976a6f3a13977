// Broker Port (Interface) - the durable queue underneath the orchestration layer
//
// Retry, backoff and dead-lettering are the broker's job. Callers only report
// outcomes through `complete` / `fail`.

use crate::domain::{FlowJob, FlowNode, Job, JobCounts, JobId, JobState, NewJob};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Broker connection settings, shared read-only by every component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl BrokerConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 10,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// What the broker decided after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Job goes back to the queue after `delay_ms`
    Retrying { attempt: u32, delay_ms: u64 },
    /// Attempts exhausted, job is FAILED
    Failed,
}

/// Durable queue interface
#[async_trait]
pub trait Broker: Send + Sync {
    /// Check the connection (used at startup)
    async fn ping(&self) -> Result<()>;

    /// Persist a single job
    async fn add_job(&self, job: NewJob) -> Result<JobId>;

    /// Persist a whole dependency graph atomically
    ///
    /// Either every node is stored or none is.
    async fn add_flow(&self, flow: FlowNode) -> Result<FlowJob>;

    /// Atomically move the next claimable job of `queue` to ACTIVE
    async fn claim_next(&self, queue: &str) -> Result<Option<Job>>;

    /// Mark an ACTIVE job COMPLETED and release its parent if it was the last child
    async fn complete(&self, id: &JobId, return_value: serde_json::Value) -> Result<()>;

    /// Record a failed attempt and apply the retry policy
    async fn fail(&self, id: &JobId, reason: &str) -> Result<FailureOutcome>;

    /// Find job by ID
    async fn get_job(&self, id: &JobId) -> Result<Option<Job>>;

    /// Return values of completed children, keyed by child ID
    async fn children_values(&self, parent_id: &JobId) -> Result<HashMap<JobId, serde_json::Value>>;

    /// Count jobs by state
    async fn count_by_state(&self, queue: &str, state: JobState) -> Result<i64>;

    /// Count jobs in every state
    async fn job_counts(&self, queue: &str) -> Result<JobCounts>;

    /// Move ACTIVE jobs claimed more than `older_than_ms` ago back to WAITING
    async fn recover_stalled(&self, older_than_ms: i64) -> Result<u64>;

    /// Delete finished jobs of `state` that finished more than `grace_ms` ago
    async fn clean(&self, queue: &str, state: JobState, grace_ms: i64) -> Result<u64>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    /// In-memory broker with immediate retries and no delays
    #[derive(Default)]
    pub struct InMemoryBroker {
        jobs: Mutex<Vec<Job>>,
        next_id: AtomicU64,
        reject_submissions: AtomicBool,
        claim_calls: AtomicU64,
        failing_reports: AtomicU64,
        report_calls: AtomicU64,
    }

    impl InMemoryBroker {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every subsequent add_job/add_flow fail
        pub fn reject_submissions(&self, reject: bool) {
            self.reject_submissions.store(reject, Ordering::SeqCst);
        }

        pub fn jobs(&self) -> Vec<Job> {
            self.jobs.lock().unwrap().clone()
        }

        pub fn claim_calls(&self) -> u64 {
            self.claim_calls.load(Ordering::SeqCst)
        }

        /// Make the next `n` complete/fail calls return a database error
        pub fn fail_next_reports(&self, n: u64) {
            self.failing_reports.store(n, Ordering::SeqCst);
        }

        /// Number of complete/fail calls, including rejected ones
        pub fn report_calls(&self) -> u64 {
            self.report_calls.load(Ordering::SeqCst)
        }

        fn check_report(&self) -> Result<()> {
            self.report_calls.fetch_add(1, Ordering::SeqCst);
            let rejected = self
                .failing_reports
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if rejected {
                return Err(AppError::Database("database is locked".to_string()));
            }
            Ok(())
        }

        fn check_accepting(&self) -> Result<()> {
            if self.reject_submissions.load(Ordering::SeqCst) {
                return Err(AppError::Connection("broker unavailable".to_string()));
            }
            Ok(())
        }

        fn stage_flow(
            &self,
            node: FlowNode,
            parent: Option<&JobId>,
            staged: &mut Vec<Job>,
        ) -> FlowJob {
            let id = format!("mem-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            let mut job = Job::from_new(id.clone(), 0, node.job);
            job.parent_id = parent.cloned();
            job.pending_children = node.children.len() as u32;
            if !node.children.is_empty() {
                job.state = JobState::WaitingChildren;
            }
            let summary = FlowJob {
                id: id.clone(),
                name: job.name.clone(),
                queue: job.queue.clone(),
                children: Vec::new(),
            };
            staged.push(job);

            let children = node
                .children
                .into_iter()
                .map(|child| self.stage_flow(child, Some(&id), staged))
                .collect();
            FlowJob { children, ..summary }
        }

        fn with_job<T>(&self, id: &JobId, f: impl FnOnce(&mut Job) -> T) -> Result<T> {
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs
                .iter_mut()
                .find(|j| &j.id == id)
                .ok_or_else(|| AppError::NotFound(format!("Job {} not found", id)))?;
            Ok(f(job))
        }

        fn release_parent(jobs: &mut [Job], parent_id: &JobId) {
            if let Some(parent) = jobs.iter_mut().find(|j| &j.id == parent_id) {
                parent.pending_children = parent.pending_children.saturating_sub(1);
                if parent.pending_children == 0 && parent.state == JobState::WaitingChildren {
                    parent.state = JobState::Waiting;
                }
            }
        }
    }

    #[async_trait]
    impl Broker for InMemoryBroker {
        async fn ping(&self) -> Result<()> {
            self.check_accepting()
        }

        async fn add_job(&self, job: NewJob) -> Result<JobId> {
            self.check_accepting()?;
            let id = format!("mem-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            let mut job = Job::from_new(id.clone(), 0, job);
            // No clock here: delayed jobs are claimable right away
            job.state = JobState::Waiting;
            self.jobs.lock().unwrap().push(job);
            Ok(id)
        }

        async fn add_flow(&self, flow: FlowNode) -> Result<FlowJob> {
            self.check_accepting()?;
            let mut staged = Vec::new();
            let flow_job = self.stage_flow(flow, None, &mut staged);
            self.jobs.lock().unwrap().extend(staged);
            Ok(flow_job)
        }

        async fn claim_next(&self, queue: &str) -> Result<Option<Job>> {
            self.claim_calls.fetch_add(1, Ordering::SeqCst);
            let mut jobs = self.jobs.lock().unwrap();
            let next = jobs
                .iter_mut()
                .filter(|j| {
                    j.queue == queue && matches!(j.state, JobState::Waiting | JobState::Delayed)
                })
                .rev()
                .max_by_key(|j| j.priority());
            Ok(next.map(|job| {
                job.state = JobState::Active;
                job.clone()
            }))
        }

        async fn complete(&self, id: &JobId, return_value: serde_json::Value) -> Result<()> {
            self.check_report()?;
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs
                .iter_mut()
                .find(|j| &j.id == id)
                .ok_or_else(|| AppError::NotFound(format!("Job {} not found", id)))?;
            job.state = JobState::Completed;
            job.return_value = Some(return_value);
            let parent = job.parent_id.clone();
            if let Some(parent_id) = parent {
                Self::release_parent(&mut jobs, &parent_id);
            }
            Ok(())
        }

        async fn fail(&self, id: &JobId, reason: &str) -> Result<FailureOutcome> {
            self.check_report()?;
            self.with_job(id, |job| {
                job.attempts_made += 1;
                job.failed_reason = Some(reason.to_string());
                if job.attempts_made < job.max_attempts() {
                    job.state = JobState::Waiting;
                    FailureOutcome::Retrying {
                        attempt: job.attempts_made,
                        delay_ms: 0,
                    }
                } else {
                    job.state = JobState::Failed;
                    FailureOutcome::Failed
                }
            })
        }

        async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
            Ok(self.jobs.lock().unwrap().iter().find(|j| &j.id == id).cloned())
        }

        async fn children_values(
            &self,
            parent_id: &JobId,
        ) -> Result<HashMap<JobId, serde_json::Value>> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .iter()
                .filter(|j| j.parent_id.as_ref() == Some(parent_id))
                .filter_map(|j| j.return_value.clone().map(|v| (j.id.clone(), v)))
                .collect())
        }

        async fn count_by_state(&self, queue: &str, state: JobState) -> Result<i64> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .iter()
                .filter(|j| j.queue == queue && j.state == state)
                .count() as i64)
        }

        async fn job_counts(&self, queue: &str) -> Result<JobCounts> {
            let mut counts = JobCounts::default();
            for state in JobState::ALL {
                counts.set(state, self.count_by_state(queue, state).await?);
            }
            Ok(counts)
        }

        async fn recover_stalled(&self, _older_than_ms: i64) -> Result<u64> {
            let mut jobs = self.jobs.lock().unwrap();
            let mut recovered = 0;
            for job in jobs.iter_mut().filter(|j| j.state == JobState::Active) {
                job.state = JobState::Waiting;
                recovered += 1;
            }
            Ok(recovered)
        }

        async fn clean(&self, queue: &str, state: JobState, _grace_ms: i64) -> Result<u64> {
            let mut jobs = self.jobs.lock().unwrap();
            let before = jobs.len();
            jobs.retain(|j| !(j.queue == queue && j.state == state));
            Ok((before - jobs.len()) as u64)
        }
    }
}
