// Central Error Type for the Application

use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    /// Broker unreachable or misconfigured. Fatal at startup.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Parent/child graph rejected by the broker. Nothing was persisted.
    #[error("Flow submission error: {0}")]
    FlowSubmission(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Broker errors worth retrying (lock contention, lost connection)
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Connection(_) | AppError::Database(_))
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

// Note: sqlx::Error conversion is handled in infra-sqlite crate
// by converting to AppError::Database(String)
