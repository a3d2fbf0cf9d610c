//! Mock launcher for testing

use nix::sys::signal::Signal;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    ExitStatus, LaunchEvent, LaunchSpec, LaunchedProcess, Launcher, OutputStream, SignalError,
    Signaller, SpawnError,
};

/// Mock launcher for unit/integration testing
///
/// Every launch is recorded as a [`MockProcess`] that the test drives by
/// hand: emit lines, exit, close. Signals terminate the mock process
/// immediately unless listed in `ignored_signals`.
pub struct MockLauncher {
    next_pid: AtomicU32,
    processes: Arc<Mutex<Vec<MockProcess>>>,

    /// Configure spawn to fail with this error kind
    pub fail_spawn: Arc<Mutex<Option<io::ErrorKind>>>,

    /// Signals the mock process acknowledges but does not die from
    pub ignored_signals: Arc<Mutex<Vec<Signal>>>,

    /// Configure signal delivery to be rejected
    pub reject_signals: Arc<Mutex<bool>>,

    /// Error events reported ahead of the spawn outcome
    pub pre_spawn_errors: Arc<Mutex<Vec<String>>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            processes: Arc::new(Mutex::new(Vec::new())),
            fail_spawn: Arc::new(Mutex::new(None)),
            ignored_signals: Arc::new(Mutex::new(Vec::new())),
            reject_signals: Arc::new(Mutex::new(false)),
            pre_spawn_errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make subsequent launches fail to spawn
    pub fn set_fail_spawn(&self, kind: Option<io::ErrorKind>) {
        *self.fail_spawn.lock().unwrap() = kind;
    }

    /// Make subsequent launches report `message` as an error before
    /// `Spawned` or `SpawnFailed`
    pub fn queue_pre_spawn_error(&self, message: impl Into<String>) {
        self.pre_spawn_errors.lock().unwrap().push(message.into());
    }

    /// Make subsequent launches ignore the given signal
    pub fn ignore_signal(&self, signal: Signal) {
        self.ignored_signals.lock().unwrap().push(signal);
    }

    /// All processes launched so far
    pub fn processes(&self) -> Vec<MockProcess> {
        self.processes.lock().unwrap().clone()
    }

    /// The most recently launched process
    pub fn last_process(&self) -> Option<MockProcess> {
        self.processes.lock().unwrap().last().cloned()
    }
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl Launcher for MockLauncher {
    fn launch(&self, spec: &LaunchSpec) -> LaunchedProcess {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();

        let spawn_failure = *self.fail_spawn.lock().unwrap();
        let pid = match spawn_failure {
            Some(_) => None,
            None => Some(self.next_pid.fetch_add(1, Ordering::SeqCst)),
        };

        let process = MockProcess {
            spec: spec.clone(),
            shared: Arc::new(MockShared {
                pid,
                event_tx,
                stdout_tx: Mutex::new(Some(stdout_tx)),
                stderr_tx: Mutex::new(Some(stderr_tx)),
                state: Mutex::new(MockState {
                    alive: pid.is_some(),
                    signals: Vec::new(),
                    ignored: self.ignored_signals.lock().unwrap().clone(),
                    reject: *self.reject_signals.lock().unwrap(),
                }),
            }),
        };

        for message in self.pre_spawn_errors.lock().unwrap().iter() {
            process.send(LaunchEvent::Error(message.clone()));
        }

        match (pid, spawn_failure) {
            (Some(pid), _) => {
                debug!(pid = pid, program = %spec.program, "Mock process spawned");
                process.send(LaunchEvent::Spawned { pid });
            }
            (None, kind) => {
                let kind = kind.unwrap_or(io::ErrorKind::Other);
                let error = SpawnError::new(&spec.program, kind, io::Error::from(kind).to_string());
                process.send(LaunchEvent::SpawnFailed(error));
            }
        }

        self.processes.lock().unwrap().push(process.clone());

        LaunchedProcess {
            events: event_rx,
            stdout: stdout_rx,
            stderr: stderr_rx,
            signaller: Arc::new(MockSignaller {
                process: process.clone(),
            }),
        }
    }
}

#[derive(Debug)]
struct MockState {
    alive: bool,
    signals: Vec<Signal>,
    ignored: Vec<Signal>,
    reject: bool,
}

#[derive(Debug)]
struct MockShared {
    pid: Option<u32>,
    event_tx: mpsc::UnboundedSender<LaunchEvent>,
    stdout_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    stderr_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    state: Mutex<MockState>,
}

/// Test-side controller for one mock launch
#[derive(Debug, Clone)]
pub struct MockProcess {
    spec: LaunchSpec,
    shared: Arc<MockShared>,
}

impl MockProcess {
    pub fn pid(&self) -> Option<u32> {
        self.shared.pid
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    /// Signals delivered so far, in order
    pub fn signals(&self) -> Vec<Signal> {
        self.shared.state.lock().unwrap().signals.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.shared.state.lock().unwrap().alive
    }

    /// Write one line to stdout or stderr. Ignored once the stream is closed.
    pub fn emit_line(&self, stream: OutputStream, line: impl Into<String>) {
        let sender = match stream {
            OutputStream::Stdout => &self.shared.stdout_tx,
            OutputStream::Stderr => &self.shared.stderr_tx,
        };
        if let Some(tx) = sender.lock().unwrap().as_ref() {
            let _ = tx.send(line.into());
        }
    }

    pub fn emit_stdout(&self, line: impl Into<String>) {
        self.emit_line(OutputStream::Stdout, line);
    }

    pub fn emit_stderr(&self, line: impl Into<String>) {
        self.emit_line(OutputStream::Stderr, line);
    }

    /// Report a non-fatal launcher error
    pub fn emit_error(&self, message: impl Into<String>) {
        self.send(LaunchEvent::Error(message.into()));
    }

    /// Simulate process termination (output may still be draining)
    pub fn exit(&self, status: ExitStatus) {
        self.shared.state.lock().unwrap().alive = false;
        self.send(LaunchEvent::Exited(status));
    }

    /// Simulate the streams draining. Does not mark the process dead.
    pub fn close(&self, status: ExitStatus) {
        self.shared.stdout_tx.lock().unwrap().take();
        self.shared.stderr_tx.lock().unwrap().take();
        self.send(LaunchEvent::Closed(status));
    }

    /// Exit and close in one go
    pub fn finish(&self, status: ExitStatus) {
        self.exit(status);
        self.close(status);
    }

    fn send(&self, event: LaunchEvent) {
        // The receiving side may already be gone after close
        let _ = self.shared.event_tx.send(event);
    }
}

struct MockSignaller {
    process: MockProcess,
}

impl Signaller for MockSignaller {
    fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    fn send_signal(&self, signal: Signal) -> Result<(), SignalError> {
        let pid = self.process.pid().ok_or(SignalError::NotStarted)?;

        let terminates = {
            let mut state = self.process.shared.state.lock().unwrap();
            if state.reject {
                return Err(SignalError::Rejected {
                    pid,
                    signal,
                    reason: "EPERM: Operation not permitted".into(),
                });
            }
            if !state.alive {
                return Err(SignalError::AlreadyExited { pid });
            }
            state.signals.push(signal);
            !state.ignored.contains(&signal)
        };

        debug!(pid = pid, signal = signal.as_str(), terminates, "Mock process signaled");
        if terminates {
            self.process.finish(ExitStatus::signaled(signal));
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.process.is_alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_spawn_and_signal() {
        let launcher = MockLauncher::new();
        let mut launched = launcher.launch(&LaunchSpec::new("sleep", vec!["10".into()]));

        let pid = match launched.events.recv().await {
            Some(LaunchEvent::Spawned { pid }) => pid,
            other => panic!("Expected Spawned, got {:?}", other),
        };
        assert_eq!(launched.signaller.pid(), Some(pid));

        launched.signaller.send_signal(Signal::SIGTERM).unwrap();

        assert!(matches!(
            launched.events.recv().await,
            Some(LaunchEvent::Exited(status)) if status.signal == Some(Signal::SIGTERM)
        ));
        assert!(matches!(
            launched.events.recv().await,
            Some(LaunchEvent::Closed(_))
        ));
        assert!(!launched.signaller.is_alive());
        assert_eq!(
            launched.signaller.send_signal(Signal::SIGKILL),
            Err(SignalError::AlreadyExited { pid })
        );
    }

    #[tokio::test]
    async fn mock_spawn_failure() {
        let launcher = MockLauncher::new();
        launcher.set_fail_spawn(Some(io::ErrorKind::NotFound));

        let mut launched = launcher.launch(&LaunchSpec::new("qocefkj", vec![]));

        match launched.events.recv().await {
            Some(LaunchEvent::SpawnFailed(err)) => assert!(err.is_not_found()),
            other => panic!("Expected SpawnFailed, got {:?}", other),
        }
        assert_eq!(
            launched.signaller.send_signal(Signal::SIGTERM),
            Err(SignalError::NotStarted)
        );
    }

    #[tokio::test]
    async fn mock_pre_spawn_errors_come_first() {
        let launcher = MockLauncher::new();
        launcher.queue_pre_spawn_error("spawn raced with a signal");

        let mut launched = launcher.launch(&LaunchSpec::new("sleep", vec!["10".into()]));

        assert!(matches!(
            launched.events.recv().await,
            Some(LaunchEvent::Error(message)) if message == "spawn raced with a signal"
        ));
        assert!(matches!(
            launched.events.recv().await,
            Some(LaunchEvent::Spawned { pid: 1000 })
        ));
    }

    #[tokio::test]
    async fn mock_ignored_signal_keeps_running() {
        let launcher = MockLauncher::new();
        launcher.ignore_signal(Signal::SIGTERM);

        let launched = launcher.launch(&LaunchSpec::new("daemon", vec![]));
        launched.signaller.send_signal(Signal::SIGTERM).unwrap();

        let process = launcher.last_process().unwrap();
        assert!(process.is_alive());
        assert_eq!(process.signals(), vec![Signal::SIGTERM]);
    }

    #[tokio::test]
    async fn mock_lines_stop_after_close() {
        let launcher = MockLauncher::new();
        let mut launched = launcher.launch(&LaunchSpec::new("echo", vec![]));
        let process = launcher.last_process().unwrap();

        process.emit_stdout("Hello");
        process.finish(ExitStatus::success());
        process.emit_stdout("ignored");

        assert_eq!(launched.stdout.recv().await.as_deref(), Some("Hello"));
        assert_eq!(launched.stdout.recv().await, None);
    }
}
