//! Backend driver error types.

use std::time::Duration;

use thiserror::Error;

/// Result type for backend driver operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors raised by container, pod and VM drivers.
#[derive(Debug, Error)]
pub enum BackendError {
    /// A runtime CLI invocation exited non-zero.
    #[error("{command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The unit (or one of its dependents) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The runtime, API server or hypervisor could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Non-success response from the Kubernetes API.
    #[error("api returned {status}: {message}")]
    Http { status: u16, message: String },

    /// Unexpected output from the runtime.
    #[error("failed to parse backend output: {0}")]
    Parse(String),

    /// Rejected before reaching the runtime.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Readiness or stop did not finish in time.
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Whether the runtime refused because the resource is already there.
    pub fn is_already_exists(&self) -> bool {
        match self {
            BackendError::CommandFailed { message, .. } => {
                let m = message.to_ascii_lowercase();
                m.contains("already exists") || m.contains("already in use")
            }
            BackendError::Http { status, .. } => *status == 409,
            _ => false,
        }
    }

    /// Whether the error means the resource is gone.
    pub fn is_not_found(&self) -> bool {
        match self {
            BackendError::NotFound(_) => true,
            BackendError::CommandFailed { message, .. } => {
                let m = message.to_ascii_lowercase();
                m.contains("no such") || m.contains("not found") || m.contains("does not exist")
            }
            BackendError::Http { status, .. } => *status == 404,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            BackendError::Unavailable(err.to_string())
        } else if let Some(status) = err.status() {
            BackendError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            BackendError::Unavailable(err.to_string())
        }
    }
}
