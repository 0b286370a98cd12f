//! Engine error taxonomy.

use std::time::Duration;

use log::error;
use thiserror::Error;

use labvisor_protocol::{PortRole, SessionState};

use crate::backend::BackendError;
use crate::terminal::TerminalError;
use crate::verifier::VerifyError;

/// Result type for registry operations.
pub type LabResult<T> = Result<T, LabError>;

/// Errors surfaced to callers of the session registry.
///
/// Messages are written for end users: they never carry backend handles.
#[derive(Debug, Error)]
pub enum LabError {
    /// No port (or other allocatable resource) is free.
    #[error("lab failed to start: no free {pool} ports")]
    AllocationExhausted { pool: PortRole },

    /// The container runtime, Kubernetes API or hypervisor is unreachable.
    #[error("lab backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The unit was created but never became ready.
    #[error("lab did not become ready within {}s", .after.as_secs())]
    ProvisionTimeout { after: Duration },

    /// A terminal channel could not be opened.
    #[error("terminal attach failed: {0}")]
    AttachFailed(String),

    /// Operation on an unknown session.
    #[error("session not found: {0}")]
    NotFound(String),

    /// The session ID is already in use by another active session.
    #[error("session already running: {0}")]
    AlreadyActive(String),

    /// Unknown preset or unacceptable override.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The user already holds the maximum number of active sessions.
    #[error("session limit reached ({0} active)")]
    LimitReached(usize),

    /// A lifecycle edge that the state graph forbids.
    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    /// Backend failure that is neither an outage nor a timeout.
    #[error("lab backend error: {0}")]
    Backend(String),
}

/// Caller-facing text for backend failures. The runtime's own output names
/// containers, hosts and daemon internals, so it only goes to the log.
pub(crate) const BACKEND_UNREACHABLE: &str = "the lab runtime could not be reached";
pub(crate) const BACKEND_FAILED: &str = "the lab runtime rejected the operation";
pub(crate) const TERMINAL_FAILED: &str = "could not open a shell in the lab environment";

impl From<BackendError> for LabError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Timeout(after) => LabError::ProvisionTimeout { after },
            BackendError::Unavailable(_) | BackendError::Io(_) => {
                error!("Backend unreachable: {}", err);
                LabError::BackendUnavailable(BACKEND_UNREACHABLE.to_string())
            }
            other => {
                error!("Backend failure: {}", other);
                LabError::Backend(BACKEND_FAILED.to_string())
            }
        }
    }
}

impl From<TerminalError> for LabError {
    fn from(err: TerminalError) -> Self {
        match err {
            TerminalError::NoShell | TerminalError::Closed => LabError::AttachFailed(err.to_string()),
            other => {
                error!("Terminal attach failed: {}", other);
                LabError::AttachFailed(TERMINAL_FAILED.to_string())
            }
        }
    }
}

impl From<VerifyError> for LabError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::InvalidPattern { .. } => LabError::InvalidRequest(err.to_string()),
            VerifyError::Script(msg) => {
                error!("Verification script failed to run: {}", msg);
                LabError::Backend("the verification script could not be run".to_string())
            }
        }
    }
}
