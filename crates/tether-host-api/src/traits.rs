//! Launcher traits

use nix::sys::signal::Signal;
use std::io;
use thiserror::Error;

use crate::{ExitStatus, LaunchSpec, LaunchedProcess};

/// The OS could not create the process
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to spawn '{program}': {message}")]
pub struct SpawnError {
    pub program: String,
    pub kind: io::ErrorKind,
    pub message: String,
}

impl SpawnError {
    pub fn new(program: impl Into<String>, kind: io::ErrorKind, message: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == io::ErrorKind::NotFound
    }
}

/// Errors from delivering a signal to a child
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("Process was never started")]
    NotStarted,

    #[error("Process {pid} has already exited")]
    AlreadyExited { pid: u32 },

    #[error("Failed to send signal {} to process {pid}: {reason}", .signal.as_str())]
    Rejected {
        pid: u32,
        signal: Signal,
        reason: String,
    },
}

/// Raw notifications from a launcher
#[derive(Debug, Clone)]
pub enum LaunchEvent {
    /// The process image is loaded
    Spawned { pid: u32 },

    /// The process could not be created
    SpawnFailed(SpawnError),

    /// The process has terminated; its output may still be draining
    Exited(ExitStatus),

    /// The process is reaped and both output streams are fully drained
    Closed(ExitStatus),

    /// A non-fatal error after spawn (e.g. waiting on the child failed)
    Error(String),
}

/// Delivers signals to one launched process
pub trait Signaller: Send + Sync {
    /// OS process ID, if the process was spawned
    fn pid(&self) -> Option<u32>;

    /// Send a signal to the process
    fn send_signal(&self, signal: Signal) -> Result<(), SignalError>;

    /// Whether the process is still running (spawned and not yet reaped)
    fn is_alive(&self) -> bool;
}

/// Process launcher - implemented by platform-specific adapters
pub trait Launcher: Send + Sync {
    /// Start a program.
    ///
    /// Never fails synchronously: spawn failures are reported as the first
    /// event on the returned event receiver.
    fn launch(&self, spec: &LaunchSpec) -> LaunchedProcess;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_error_display() {
        let err = SpawnError::new(
            "qocefkj",
            io::ErrorKind::NotFound,
            "ENOENT: No such file or directory",
        );
        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "Failed to spawn 'qocefkj': ENOENT: No such file or directory"
        );
    }

    #[test]
    fn signal_error_display() {
        let err = SignalError::Rejected {
            pid: 42,
            signal: Signal::SIGTERM,
            reason: "EPERM: Operation not permitted".into(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to send signal SIGTERM to process 42: EPERM: Operation not permitted"
        );
        assert_eq!(
            SignalError::AlreadyExited { pid: 7 }.to_string(),
            "Process 7 has already exited"
        );
    }
}
