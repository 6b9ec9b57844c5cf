//! Error taxonomy shared by both control planes.
//!
//! Per-target failures are captured into results as data; only run-level
//! errors (credentials, malformed desired state) abort a run.
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Credential rejected by the registry. Terminal for the whole run.
    #[error("authentication rejected: {0}")]
    Auth(String),
    /// Caller identity lacks a grant. Terminal for one target only.
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("validation failed: {0}")]
    Validation(String),
    /// Incompatible existing resource or a concurrent operation in flight.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient failure: {0}")]
    Transient(String),
    /// Mutating fan-out attempted without a clean preflight.
    #[error("precondition not met: {0}")]
    Precondition(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Permission,
    Validation,
    Conflict,
    Transient,
    Precondition,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Permission => "permission",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Transient => "transient",
            ErrorKind::Precondition => "precondition",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::Auth(_) => ErrorKind::Auth,
            ReconcileError::Permission(_) => ErrorKind::Permission,
            ReconcileError::Validation(_) => ErrorKind::Validation,
            ReconcileError::Conflict(_) => ErrorKind::Conflict,
            ReconcileError::Transient(_) => ErrorKind::Transient,
            ReconcileError::Precondition(_) => ErrorKind::Precondition,
            ReconcileError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ReconcileError::Auth(message)
            | ReconcileError::Permission(message)
            | ReconcileError::Validation(message)
            | ReconcileError::Conflict(message)
            | ReconcileError::Transient(message)
            | ReconcileError::Precondition(message)
            | ReconcileError::Fatal(message) => message,
        }
    }

    /// Only transient failures are eligible for backoff retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::Transient(_))
    }

    /// Prefix the message with where the failure happened, keeping the kind.
    pub fn context(self, label: &str) -> Self {
        let wrap = |message: String| format!("{label}: {message}");
        match self {
            ReconcileError::Auth(m) => ReconcileError::Auth(wrap(m)),
            ReconcileError::Permission(m) => ReconcileError::Permission(wrap(m)),
            ReconcileError::Validation(m) => ReconcileError::Validation(wrap(m)),
            ReconcileError::Conflict(m) => ReconcileError::Conflict(wrap(m)),
            ReconcileError::Transient(m) => ReconcileError::Transient(wrap(m)),
            ReconcileError::Precondition(m) => ReconcileError::Precondition(wrap(m)),
            ReconcileError::Fatal(m) => ReconcileError::Fatal(wrap(m)),
        }
    }
}

/// Serialized form of an error inside a report.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ReconcileError> for ErrorRecord {
    fn from(err: &ReconcileError) -> Self {
        ErrorRecord {
            kind: err.kind(),
            message: err.message().to_string(),
        }
    }
}

pub type ReconcileResult<T> = std::result::Result<T, ReconcileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_retry() {
        assert!(ReconcileError::Transient("throttled".into()).is_retryable());
        assert!(!ReconcileError::Conflict("in flight".into()).is_retryable());
        assert!(!ReconcileError::Auth("expired".into()).is_retryable());
    }

    #[test]
    fn context_keeps_kind() {
        let err = ReconcileError::Permission("no grant".into()).context("111111111111/us-east-1");
        assert_eq!(err.kind(), ErrorKind::Permission);
        assert_eq!(err.message(), "111111111111/us-east-1: no grant");
    }

    #[test]
    fn error_record_serializes_kind_snake_case() {
        let record = ErrorRecord::from(&ReconcileError::Precondition("no preflight".into()));
        let value = serde_json::to_value(record).expect("serialize record");
        assert_eq!(value["kind"], "precondition");
    }
}
