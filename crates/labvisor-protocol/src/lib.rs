//! Wire types shared between the labvisor engine and the web layer.
//!
//! Everything in this crate is plain data: session snapshots, lifecycle
//! events, terminal control frames and verification rules. The engine crate
//! owns all behaviour.

pub mod events;
pub mod session;
pub mod terminal;
pub mod verify;

pub use events::LifecycleEvent;
pub use session::{
    AccessInfo, BackendKind, ConfigOverrides, PortRole, SessionKind, SessionState, SessionView,
    StartSessionRequest,
};
pub use terminal::{TerminalClientFrame, TerminalServerNotice};
pub use verify::{FlagResult, FlagSpec, VerifyOutcome, VerifyRule};
