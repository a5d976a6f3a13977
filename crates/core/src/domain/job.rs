// Job Domain Model

use crate::domain::error::{DomainError, Result};
use crate::domain::queue::validate_queue_name;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Job ID (UUID v4, assigned by the broker)
pub type JobId = String;

/// Job name (what the job does, e.g. "send-email")
pub type JobName = String;

/// Priority (higher number = claimed first)
pub type Priority = i32;

/// Job lifecycle as seen by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Waiting,
    Delayed,
    WaitingChildren,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Waiting,
        JobState::Delayed,
        JobState::WaitingChildren,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "WAITING",
            JobState::Delayed => "DELAYED",
            JobState::WaitingChildren => "WAITING_CHILDREN",
            JobState::Active => "ACTIVE",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        }
    }

    /// Terminal states: the broker will not hand the job out again
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        JobState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DomainError::UnknownState(s.to_string()))
    }
}

/// Job Payload (opaque JSON owned by the producer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPayload(serde_json::Value);

impl JobPayload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

impl From<serde_json::Value> for JobPayload {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Delay between retries of a failed job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    pub delay_ms: u64,
}

impl Backoff {
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay_ms,
        }
    }

    pub fn exponential(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms,
        }
    }

    /// Delay before retry number `retry` (1-based)
    ///
    /// Exponential: `delay_ms * 2^(retry - 1)`, saturating.
    pub fn delay_for(&self, retry: u32) -> u64 {
        match self.kind {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => {
                let factor = 2u64.saturating_pow(retry.saturating_sub(1));
                self.delay_ms.saturating_mul(factor)
            }
        }
    }
}

/// Per-job options, interpreted by the broker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total attempts including the first one (default 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,

    /// Initial delay before the job becomes claimable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,

    /// Fail the parent when this job exhausts its attempts
    #[serde(default)]
    pub fail_parent_on_failure: bool,
}

impl JobOptions {
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn fail_parent_on_failure(mut self) -> Self {
        self.fail_parent_on_failure = true;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.attempts.unwrap_or(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.attempts == Some(0) {
            return Err(DomainError::InvalidOptions(
                "attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A job as submitted by a producer, before the broker assigns an ID
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub name: JobName,
    pub queue: String,
    pub payload: JobPayload,
    #[serde(default)]
    pub options: JobOptions,
}

impl NewJob {
    pub fn new(
        name: impl Into<String>,
        queue: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            payload: JobPayload::new(payload),
            options: JobOptions::default(),
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Reject jobs the broker must never see
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::InvalidJobName(
                "job name cannot be empty".to_string(),
            ));
        }
        validate_queue_name(&self.queue)?;
        self.options.validate()
    }
}

/// Job record as persisted by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: JobName,
    pub queue: String,
    pub payload: JobPayload,
    pub options: JobOptions,
    pub state: JobState,

    /// Failed attempts so far
    pub attempts_made: u32,

    pub parent_id: Option<JobId>,
    /// Children not yet completed
    pub pending_children: u32,

    pub failed_reason: Option<String>,
    pub return_value: Option<serde_json::Value>,

    pub created_at: i64,   // epoch ms
    pub available_at: i64, // epoch ms, claimable from
    pub processed_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl Job {
    /// Build the initial record for a submitted job
    ///
    /// ID and timestamp are injected so brokers stay deterministic under test.
    pub fn from_new(id: impl Into<String>, now_millis: i64, new_job: NewJob) -> Self {
        let delay = new_job.options.delay_ms.unwrap_or(0);
        let state = if delay > 0 {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        Self {
            id: id.into(),
            name: new_job.name,
            queue: new_job.queue,
            payload: new_job.payload,
            options: new_job.options,
            state,
            attempts_made: 0,
            parent_id: None,
            pending_children: 0,
            failed_reason: None,
            return_value: None,
            created_at: now_millis,
            available_at: now_millis.saturating_add(i64::try_from(delay).unwrap_or(i64::MAX)),
            processed_at: None,
            finished_at: None,
        }
    }

    pub fn priority(&self) -> Priority {
        self.options.priority.unwrap_or(0)
    }

    pub fn max_attempts(&self) -> u32 {
        self.options.max_attempts()
    }
}

/// Number of jobs per state in one queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: i64,
    pub delayed: i64,
    pub waiting_children: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

impl JobCounts {
    pub fn get(&self, state: JobState) -> i64 {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Delayed => self.delayed,
            JobState::WaitingChildren => self.waiting_children,
            JobState::Active => self.active,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
        }
    }

    pub fn set(&mut self, state: JobState, count: i64) {
        let slot = match state {
            JobState::Waiting => &mut self.waiting,
            JobState::Delayed => &mut self.delayed,
            JobState::WaitingChildren => &mut self.waiting_children,
            JobState::Active => &mut self.active,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
        };
        *slot = count;
    }

    pub fn total(&self) -> i64 {
        JobState::ALL.iter().map(|s| self.get(*s)).sum()
    }
}
