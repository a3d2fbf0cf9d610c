//! Process launcher trait interfaces for tether
//!
//! This crate defines the interface between the supervision core and the
//! platform facility that actually creates processes, delivers signals and
//! decodes output into lines. It contains no platform code itself.

mod handle;
mod mock;
mod traits;

pub use handle::*;
pub use mock::*;
pub use traits::*;

pub use nix::sys::signal::Signal;
