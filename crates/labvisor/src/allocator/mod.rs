//! Resource allocation: host ports and deterministic resource names.
//!
//! Nothing in here performs I/O. The registry owns a single [`PortAllocator`]
//! behind a mutex so that acquire/release is atomic across concurrent starts.

mod names;
mod ports;

pub use names::{network_name_for, unit_name_for, volume_for_session, volume_name_for};
pub use ports::PortAllocator;
