// Payload validation result types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One violated field of a job payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Outcome of validating an untyped payload into `T`
#[derive(Debug, Clone, PartialEq)]
pub enum Validation<T> {
    Valid(T),
    Invalid(Vec<FieldViolation>),
}

impl<T> Validation<T> {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid(_))
    }

    pub fn into_result(self) -> Result<T, ValidationError> {
        match self {
            Validation::Valid(value) => Ok(value),
            Validation::Invalid(violations) => Err(ValidationError::new(violations)),
        }
    }
}

/// Payload rejected by its schema
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("fails validation: {}", format_violations(.violations))]
pub struct ValidationError {
    pub violations: Vec<FieldViolation>,
}

impl ValidationError {
    pub fn new(violations: Vec<FieldViolation>) -> Self {
        Self { violations }
    }

    pub fn fields(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.field.as_str()).collect()
    }
}

fn format_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_lists_every_field() {
        let err = Validation::<()>::Invalid(vec![
            FieldViolation::new("to", "Invalid email"),
            FieldViolation::new("text", "Required"),
        ])
        .into_result()
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "fails validation: to: Invalid email; text: Required"
        );
        assert_eq!(err.fields(), vec!["to", "text"]);
    }
}
