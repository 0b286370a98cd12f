//! Terminal bridge.
//!
//! A [`TerminalBridge`] opens an interactive shell inside a running unit and
//! exposes it as an async byte stream. Two transports sit behind it:
//!
//! - a local PTY running the driver's attach command (`docker exec -it`,
//!   `kubectl exec -it`, `ssh -tt`), which supports resize;
//! - the Kubernetes exec streaming API, which does not.
//!
//! Which one is used follows from the driver's [`AttachTarget`]; callers only
//! see `resize` reporting whether it took effect.
//!
//! [`AttachTarget`]: crate::backend::AttachTarget

mod bridge;
mod pty;
mod stream;

use async_trait::async_trait;
use thiserror::Error;

pub use bridge::{InputTap, TerminalBridge};

pub type TerminalResult<T> = Result<T, TerminalError>;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("no usable shell found in the lab environment")]
    NoShell,

    #[error("failed to spawn terminal: {0}")]
    Spawn(String),

    #[error("failed to connect terminal: {0}")]
    Connect(String),

    #[error("terminal is closed")]
    Closed,

    #[error("terminal I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One open transport. Output is delivered separately through the channel
/// receiver handed out when the transport is opened.
#[async_trait]
pub(crate) trait TerminalChannel: Send {
    async fn write(&mut self, data: &[u8]) -> TerminalResult<()>;

    /// Apply a new geometry. `Ok(false)` means the transport cannot resize.
    fn resize(&mut self, cols: u16, rows: u16) -> TerminalResult<bool>;

    /// Tear the transport down. Calling it twice is harmless.
    async fn close(&mut self);
}
