//! Linux launcher for tether
//!
//! Provides:
//! - Process spawning with a fully specified environment
//! - Signal delivery that tells an exited child apart from an OS rejection
//! - stdout/stderr decoding into lines
//! - Exit observation, with `Closed` reported only after output is drained

mod adapter;
mod process;

pub use adapter::*;
pub use process::*;
