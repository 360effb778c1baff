//! Outcomes of bounded operations and the service error taxonomy.

use std::fmt;
use std::time::Duration;

use socialstream_core::CodecError;

use crate::storage::StoreError;

// ---------------------------------------------------------------------------
// DeadlineExceeded
// ---------------------------------------------------------------------------

/// A bounded operation did not complete within its deadline.
///
/// Kept distinct from domain errors so callers can map it to "try again
/// later" (HTTP 503, message requeue) rather than a client or store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation {operation} exceeded its {}ms deadline", .deadline.as_millis())]
pub struct DeadlineExceeded {
    /// Name of the operation, as passed to the executor.
    pub operation: &'static str,
    pub deadline: Duration,
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of racing an operation against its deadline.
///
/// Exactly one variant is produced per operation. `Failure` carries the
/// operation's own error unchanged.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<T, E> {
    Success(T),
    Failure(E),
    TimedOut(DeadlineExceeded),
}

impl<T, E> Outcome<T, E> {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }

    /// Label used for logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Failure(_) => "failure",
            Self::TimedOut(_) => "timed_out",
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U, E> {
        match self {
            Self::Success(value) => Outcome::Success(f(value)),
            Self::Failure(error) => Outcome::Failure(error),
            Self::TimedOut(elapsed) => Outcome::TimedOut(elapsed),
        }
    }

    /// Collapses the outcome into a `Result` over [`ServiceError`].
    ///
    /// # Errors
    ///
    /// `Failure(e)` becomes `e.into()`; `TimedOut` becomes
    /// [`ServiceError::DeadlineExceeded`].
    pub fn into_result(self) -> Result<T, ServiceError>
    where
        E: Into<ServiceError>,
    {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(error) => Err(error.into()),
            Self::TimedOut(elapsed) => Err(ServiceError::DeadlineExceeded(elapsed)),
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceError
// ---------------------------------------------------------------------------

/// Errors returned by domain services.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("invalid credentials")]
    Unauthorized,
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    Conflict(String),
    #[error(transparent)]
    DeadlineExceeded(#[from] DeadlineExceeded),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Returns `true` if the same request may succeed when retried later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DeadlineExceeded(_) | Self::Internal(_))
    }

    /// Short machine-readable kind used in response bodies and logs.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict(what) => Self::Conflict(what),
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Backend(e) => Self::Internal(e),
        }
    }
}

impl From<CodecError> for ServiceError {
    fn from(error: CodecError) -> Self {
        Self::Internal(error.into())
    }
}

/// Coarse classification of [`ServiceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Unauthorized,
    NotFound,
    Conflict,
    DeadlineExceeded,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
