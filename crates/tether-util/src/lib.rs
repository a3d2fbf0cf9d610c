//! Shared utilities for tether
//!
//! This crate provides:
//! - ID types (HookId)
//! - Duration helpers (millisecond conversion, halving, human-readable seconds)

mod ids;
mod time;

pub use ids::*;
pub use time::*;
