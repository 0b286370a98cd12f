//! labvisor: lab environment orchestration.
//!
//! Starts isolated compute units (containers, Kubernetes pods or QEMU VMs)
//! for learners, bridges interactive terminals into them, tracks every
//! session through a strict state machine and reclaims what expires.

pub mod allocator;
pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod reconciler;
pub mod session;
pub mod terminal;
pub mod verifier;

pub use error::{LabError, LabResult};
pub use reconciler::{Reconciler, SweepReport};
pub use session::{SessionRegistry, StartOutcome, StopReason};
