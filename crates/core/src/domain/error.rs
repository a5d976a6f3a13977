// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid queue name '{name}': {reason}")]
    InvalidQueueName { name: String, reason: String },

    #[error("Invalid job name: {0}")]
    InvalidJobName(String),

    #[error("Invalid job options: {0}")]
    InvalidOptions(String),

    #[error("Invalid concurrency: {0} (must be between 1 and u32::MAX)")]
    InvalidConcurrency(usize),

    #[error("Unknown job state: {0}")]
    UnknownState(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
