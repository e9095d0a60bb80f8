//! Error taxonomy for the submission workflow.
//!
//! Every failure a contributor can hit falls into one of three buckets:
//!
//! | Variant | Meaning | Client action |
//! |---------|---------|---------------|
//! | [`UploadError::Validation`] | The note or cover is wrong, reported per field | Fix the file and resubmit |
//! | [`UploadError::Transport`] | A network, API or filesystem call failed | Resubmit as is |
//! | [`UploadError::Configuration`] | A secret or setting is missing on the server | Nothing; fatal to the request |
//!
//! Orchestration and CLI code keep using `anyhow`; this type is what crosses
//! the HTTP boundary and the publisher trait.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single validation problem attached to the field that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("validation failed ({} problem(s))", .0.len())]
    Validation(Vec<FieldError>),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl UploadError {
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        UploadError::Validation(vec![FieldError::new(field, message)])
    }

    pub fn transport(message: impl Into<String>) -> Self {
        UploadError::Transport(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        UploadError::Configuration(message.into())
    }

    /// Machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::Validation(_) => "validation",
            UploadError::Transport(_) => "transport",
            UploadError::Configuration(_) => "configuration",
        }
    }

    /// Whether resubmitting the same files can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Transport(_))
    }

    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            UploadError::Validation(errors) => errors,
            _ => &[],
        }
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UploadError::Transport(format!("request timed out: {}", err))
        } else {
            UploadError::Transport(err.to_string())
        }
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::Transport(format!("I/O error: {}", err))
    }
}
