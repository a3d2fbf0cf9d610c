//! Lifecycle events published by a process handle

use std::fmt;
use tether_host_api::ExitStatus;

/// Events forwarded to subscribers of a process handle
///
/// Observed in the order `Spawn`, then `Exit`, then `Close`. `Error` may
/// appear anywhere after `Spawn`; launcher errors raised before the spawn
/// outcome is known are reported through `ready()` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// The process image is loaded
    Spawn { pid: u32 },

    /// The process terminated; output may still be draining
    Exit(ExitStatus),

    /// The process is reaped and both output streams are drained
    Close(ExitStatus),

    /// A non-fatal launcher error
    Error(String),
}

/// Where a handle is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Waiting for the launcher to report the spawn outcome
    Starting,

    /// Spawned and not yet exited
    Running,

    /// The launcher could not create the process. Terminal.
    SpawnFailed,

    /// Exited, output still draining
    Closing,

    /// Reaped and drained. Terminal.
    Closed,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::SpawnFailed | ProcessState::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::SpawnFailed => "spawn_failed",
            ProcessState::Closing => "closing",
            ProcessState::Closed => "closed",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ProcessState::Closed.is_terminal());
        assert!(ProcessState::SpawnFailed.is_terminal());
        assert!(!ProcessState::Closing.is_terminal());
        assert_eq!(ProcessState::SpawnFailed.to_string(), "spawn_failed");
    }
}
