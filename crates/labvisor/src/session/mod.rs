//! Session registry and lifecycle state machine.
//!
//! The [`SessionRegistry`] is the only owner of session records. Every
//! transition goes through it, and every transition that ends a run releases
//! the session's ports and tears its unit down before the record says so.

mod events;
mod models;
mod presets;
mod registry;

pub use events::EventHub;
pub use models::{Session, SessionKey, StopReason};
pub use presets::{ResolvedPreset, resolve};
pub use registry::{SessionRegistry, StartOutcome};
