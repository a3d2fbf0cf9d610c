//! Process lifecycle core for tether
//!
//! This crate is the heart of tether, containing:
//! - Deadline races used by every blocking call
//! - Line channels with watchers and permanent observers
//! - The process handle state machine (Starting -> Running -> Closing -> Closed)
//! - Graceful-then-forceful stop escalation
//! - The exit hook registry that keeps children from outliving their owner

mod deadline;
mod error;
mod events;
mod hooks;
mod lines;
mod process;

pub use deadline::*;
pub use error::*;
pub use events::*;
pub use hooks::*;
pub use lines::*;
pub use process::*;

pub use tether_host_api::{ExitStatus, OutputStream, Signal};
