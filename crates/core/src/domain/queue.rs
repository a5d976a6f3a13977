// Queue Domain Model

use crate::domain::error::{DomainError, Result};

/// Queue identifier
pub type QueueName = String;

/// Longest accepted queue name
pub const MAX_QUEUE_NAME_LEN: usize = 64;

/// Validate a queue name before a handle is created for it
///
/// Names are non-empty, at most 64 characters, ASCII alphanumerics plus `-_.:`.
pub fn validate_queue_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| DomainError::InvalidQueueName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("queue name cannot be empty"));
    }
    if name.len() > MAX_QUEUE_NAME_LEN {
        return Err(invalid("queue name too long (max 64 characters)"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(invalid(
            "queue name must be alphanumeric (plus '-', '_', '.', ':')",
        ));
    }
    Ok(())
}
