//! Error types for the execution engine

use codeduel_common::types::{ErrorKind, Language};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    /// No harness or signature registered for a problem/language pair, or bad runtime config
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Submission rejected before execution (bad function name, oversized source, ...)
    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    /// Pooled container did not reach Ready within the startup timeout
    #[error("Container unavailable for {language}: {reason}")]
    ContainerUnavailable { language: Language, reason: String },

    /// The sandbox itself is broken: exec failed, container gone, daemon error
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Batch transport or output format corrupted
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Template error: {0}")]
    Template(#[from] handlebars::RenderError),
}

impl EngineError {
    /// Category reported to callers
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Configuration(_) | EngineError::Template(_) => ErrorKind::Configuration,
            EngineError::UnsupportedLanguage(_) => ErrorKind::UnsupportedLanguage,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::InvalidSubmission(_) => ErrorKind::InvalidSubmission,
            EngineError::ContainerUnavailable { .. }
            | EngineError::Sandbox(_)
            | EngineError::Protocol(_)
            | EngineError::Json(_)
            | EngineError::Io(_) => ErrorKind::Infrastructure,
        }
    }

    /// Failure attributable to a broken sandbox; answered with teardown, recreate and one retry
    pub fn is_sandbox_failure(&self) -> bool {
        matches!(self, EngineError::Sandbox(_))
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Sandbox(_) | EngineError::Protocol(_) | EngineError::ContainerUnavailable { .. }
        )
    }

    /// Check if error is a client error (the submitter's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::UnsupportedLanguage(_)
                | EngineError::NotFound(_)
                | EngineError::InvalidSubmission(_)
        )
    }
}

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        EngineError::Sandbox(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(EngineError::Sandbox("gone".into()).is_sandbox_failure());
        assert!(!EngineError::Protocol("bad frame".into()).is_sandbox_failure());
        assert!(EngineError::Protocol("bad frame".into()).is_retryable());
        assert!(!EngineError::Configuration("x".into()).is_retryable());
        assert!(EngineError::NotFound("p".into()).is_client_error());
    }

    #[test]
    fn test_kinds() {
        assert_eq!(
            EngineError::UnsupportedLanguage("ruby".into()).kind(),
            ErrorKind::UnsupportedLanguage
        );
        assert_eq!(
            EngineError::ContainerUnavailable {
                language: Language::Java,
                reason: "startup timeout".into()
            }
            .kind(),
            ErrorKind::Infrastructure
        );
    }
}
