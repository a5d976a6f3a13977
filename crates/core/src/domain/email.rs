// Email payload carried by jobs on the email queue

use crate::domain::validation::{FieldViolation, Validation};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

pub const SUBJECT_MIN_LEN: usize = 3;
pub const TEXT_MIN_LEN: usize = 5;

pub const INVALID_EMAIL: &str = "Invalid email";
pub const SUBJECT_TOO_SHORT: &str = "The subject must be at least 3 characters long";
pub const TEXT_TOO_SHORT: &str = "The body of the email must be at least 5 characters long";
pub const REQUIRED: &str = "Required";

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_'+\-.]*[A-Za-z0-9_+\-]@([A-Za-z0-9][A-Za-z0-9\-]*\.)+[A-Za-z]{2,}$")
        .expect("email pattern is valid")
});

/// Validated `{ to, subject, text }` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub text: String,
}

impl EmailMessage {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            text: text.into(),
        }
    }

    /// Validate an untyped job payload
    ///
    /// Every field is checked, so one call reports all violations at once.
    pub fn parse(payload: &Value) -> Validation<Self> {
        let Some(object) = payload.as_object() else {
            return Validation::Invalid(vec![FieldViolation::new(
                "payload",
                format!("Expected object, received {}", json_type(payload)),
            )]);
        };

        let mut violations = Vec::new();

        let to = string_field(object.get("to"), "to", &mut violations);
        if let Some(to) = to {
            if !is_valid_email(to) {
                violations.push(FieldViolation::new("to", INVALID_EMAIL));
            }
        }

        let subject = string_field(object.get("subject"), "subject", &mut violations);
        if let Some(subject) = subject {
            if subject.chars().count() < SUBJECT_MIN_LEN {
                violations.push(FieldViolation::new("subject", SUBJECT_TOO_SHORT));
            }
        }

        let text = string_field(object.get("text"), "text", &mut violations);
        if let Some(text) = text {
            if text.chars().count() < TEXT_MIN_LEN {
                violations.push(FieldViolation::new("text", TEXT_TOO_SHORT));
            }
        }

        match (to, subject, text) {
            (Some(to), Some(subject), Some(text)) if violations.is_empty() => {
                Validation::Valid(Self::new(to, subject, text))
            }
            _ => Validation::Invalid(violations),
        }
    }
}

fn string_field<'a>(
    value: Option<&'a Value>,
    field: &str,
    violations: &mut Vec<FieldViolation>,
) -> Option<&'a str> {
    match value {
        None | Some(Value::Null) => {
            violations.push(FieldViolation::new(field, REQUIRED));
            None
        }
        Some(Value::String(s)) => Some(s.as_str()),
        Some(other) => {
            violations.push(FieldViolation::new(
                field,
                format!("Expected string, received {}", json_type(other)),
            ));
            None
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn is_valid_email(address: &str) -> bool {
    !address.starts_with('.') && !address.contains("..") && EMAIL_RE.is_match(address)
}
