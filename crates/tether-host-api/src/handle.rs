//! Launched-process handle abstraction

use nix::sys::signal::Signal;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{LaunchEvent, Signaller};

/// Everything a launcher needs to start a program
///
/// `env` is the complete environment of the child; nothing is inherited
/// beyond what is listed here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: HashMap::new(),
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// One of the two captured output streams of a child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stream name other than `stdout` or `stderr`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown stream '{0}'; must be stdout or stderr")]
pub struct UnknownStream(pub String);

impl FromStr for OutputStream {
    type Err = UnknownStream;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(OutputStream::Stdout),
            "stderr" => Ok(OutputStream::Stderr),
            other => Err(UnknownStream(other.to_string())),
        }
    }
}

/// Exit status of a child, as reported once the OS has released it
///
/// Exactly one of `code` and `signal` is set for a real process: a child
/// either returned from `main` or was terminated by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code if the process exited normally
    pub code: Option<i32>,

    /// Signal that terminated the process
    pub signal: Option<Signal>,
}

impl ExitStatus {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            signal: None,
        }
    }

    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: Signal) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn signal_name(&self) -> Option<&'static str> {
        self.signal.map(|s| s.as_str())
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal.as_str()),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

impl Serialize for ExitStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ExitStatus", 2)?;
        state.serialize_field("code", &self.code)?;
        state.serialize_field("signal", &self.signal_name())?;
        state.end()
    }
}

/// What a launcher hands back for one launch attempt
///
/// The event receiver yields exactly one of `Spawned`/`SpawnFailed` first.
/// After a successful spawn it later yields `Exited` and finally `Closed`,
/// which is only sent once both line receivers have been fully fed.
pub struct LaunchedProcess {
    pub events: mpsc::UnboundedReceiver<LaunchEvent>,
    pub stdout: mpsc::UnboundedReceiver<String>,
    pub stderr: mpsc::UnboundedReceiver<String>,
    pub signaller: Arc<dyn Signaller>,
}

impl fmt::Debug for LaunchedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchedProcess")
            .field("pid", &self.signaller.pid())
            .finish_non_exhaustive()
    }
}
