//! Error types for process handles

use std::fmt;
use std::time::Duration;
use tether_host_api::{ExitStatus, Signal, SpawnError, UnknownStream};
use tether_util::format_seconds;
use thiserror::Error;

/// A deadline elapsed before the operation it guarded completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutError {
    /// What was being waited for, e.g. "kill process"
    pub label: &'static str,

    /// The deadline that was configured
    pub deadline: Duration,

    /// How long the wait actually took
    pub elapsed: Duration,
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to {} within {} second(s)",
            self.label,
            format_seconds(self.deadline)
        )
    }
}

impl std::error::Error for TimeoutError {}

/// Errors from process handle operations
///
/// Every variant is reported only to the call that was affected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("Failed to send signal {} to {name}: {reason}", .signal.as_str())]
    SignalDelivery {
        name: String,
        signal: Signal,
        reason: String,
    },

    #[error("{name} has already exited")]
    AlreadyExited { name: String },

    #[error("Process exited with {status} while waiting for output")]
    ExitedWhileWaiting { status: ExitStatus },

    #[error("Tried to signal '{binary}' when it was never started")]
    NotStarted { binary: String },

    #[error(transparent)]
    UnknownStream(#[from] UnknownStream),

    #[error("Process handle was dropped while waiting")]
    Detached,
}

impl ProcessError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProcessError::Timeout(_))
    }
}

pub type ProcessResult<T> = Result<T, ProcessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_label_and_seconds() {
        let err = TimeoutError {
            label: "kill process",
            deadline: Duration::from_millis(10),
            elapsed: Duration::from_millis(11),
        };
        assert_eq!(err.to_string(), "Failed to kill process within 0.01 second(s)");
        assert!(ProcessError::from(err).is_timeout());
    }

    #[test]
    fn exited_while_waiting_names_status() {
        let err = ProcessError::ExitedWhileWaiting {
            status: ExitStatus::with_code(1),
        };
        assert_eq!(
            err.to_string(),
            "Process exited with code 1 while waiting for output"
        );
        assert!(!err.is_timeout());
    }
}
