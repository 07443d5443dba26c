//! Error types for the parley core.

use std::fmt;
use thiserror::Error;

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failed backend attempt.
///
/// Every kind is backend-specific: the fallback chain reacts to all of them
/// by degrading the candidate and moving on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// The attempt exceeded its invoke timeout.
    Timeout,
    /// The hosted API answered with an error or could not be reached.
    Remote,
    /// The local device failed (allocation, kernel, model fault).
    Device,
    /// The backend cannot serve at all right now (no model, probe failed).
    Unavailable,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendErrorKind::Timeout => "timeout",
            BackendErrorKind::Remote => "remote",
            BackendErrorKind::Device => "device",
            BackendErrorKind::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// A failure reported by a single backend attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Timeout, message)
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Remote, message)
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Device, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Unavailable, message)
    }
}

/// Errors surfaced by the lifecycle manager, the request pipeline and the
/// fallback chain.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller input violates a documented constraint. Never retried.
    #[error("{0}")]
    Validation(String),

    /// The model is still loading and the readiness policy is fail-fast.
    #[error("model not ready: {0}")]
    NotReady(String),

    /// The model did not become ready in time, or initialization failed.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// A single backend attempt failed. Contained by the fallback chain.
    #[error("backend failure: {0}")]
    Backend(#[from] BackendError),

    /// Every candidate in the fallback chain failed or was skipped.
    #[error("all backends failed after {attempts} attempt(s); last error: {last}")]
    AllBackendsFailed { attempts: usize, last: BackendError },

    /// The whole request overran its deadline.
    #[error("request timed out after {0:.1}s")]
    Timeout(f64),

    /// The model could not be loaded; the process must not serve traffic.
    #[error("fatal initialization error: {0}")]
    FatalInit(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("audio error: {0}")]
    Audio(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short machine-readable tag, used for telemetry counters.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotReady(_) => "not_ready",
            Error::ServiceUnavailable(_) => "service_unavailable",
            Error::Backend(_) => "backend",
            Error::AllBackendsFailed { .. } => "all_backends_failed",
            Error::Timeout(_) => "timeout",
            Error::FatalInit(_) => "fatal_init",
            Error::Config(_) => "config",
            Error::Audio(_) => "audio",
            Error::Io(_) => "io",
        }
    }

    /// The underlying cause of an exhausted fallback chain, if any.
    pub fn last_backend_error(&self) -> Option<&BackendError> {
        match self {
            Error::AllBackendsFailed { last, .. } => Some(last),
            Error::Backend(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_backends_failed_carries_last_cause() {
        let err = Error::AllBackendsFailed {
            attempts: 2,
            last: BackendError::timeout("local exceeded 30s"),
        };
        assert_eq!(err.kind_name(), "all_backends_failed");
        let last = err.last_backend_error().unwrap();
        assert_eq!(last.kind, BackendErrorKind::Timeout);
        assert!(err.to_string().contains("local exceeded 30s"));
    }

    #[test]
    fn validation_message_is_passed_through() {
        let err = Error::Validation("Empty text provided for translation".to_string());
        assert_eq!(err.to_string(), "Empty text provided for translation");
    }
}
