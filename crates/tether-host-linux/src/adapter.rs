//! Linux launcher implementation

use std::sync::Arc;
use tether_host_api::{LaunchEvent, LaunchSpec, LaunchedProcess, Launcher, OutputStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::process::{
    ProcessSignaller, UnstartedSignaller, build_command, monitor_child, pump_lines, reap_guard,
    spawn_error,
};

/// Linux launcher
///
/// Each launch spawns three tasks on the current Tokio runtime: one line
/// pump per output stream and one monitor that reaps the child. `launch`
/// must therefore be called from within a runtime.
#[derive(Debug, Clone, Default)]
pub struct LinuxLauncher;

impl LinuxLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl Launcher for LinuxLauncher {
    fn launch(&self, spec: &LaunchSpec) -> LaunchedProcess {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();

        let mut child = match build_command(spec).spawn() {
            Ok(child) => child,
            Err(e) => {
                let error = spawn_error(&spec.program, &e);
                warn!(program = %spec.program, error = %error, "Spawn failed");
                let _ = event_tx.send(LaunchEvent::SpawnFailed(error));
                return LaunchedProcess {
                    events: event_rx,
                    stdout: stdout_rx,
                    stderr: stderr_rx,
                    signaller: Arc::new(UnstartedSignaller),
                };
            }
        };

        // `id()` is only `None` once the child has been reaped, which cannot have happened yet
        let pid = child.id().unwrap_or_default();
        info!(pid = pid, program = %spec.program, args = ?spec.args, "Spawned process");
        let _ = event_tx.send(LaunchEvent::Spawned { pid });

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_lines(stdout, stdout_tx, OutputStream::Stdout, pid)));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_lines(stderr, stderr_tx, OutputStream::Stderr, pid)));
        }

        let reaped = reap_guard();
        tokio::spawn(monitor_child(child, pid, pumps, reaped.clone(), event_tx));

        LaunchedProcess {
            events: event_rx,
            stdout: stdout_rx,
            stderr: stderr_rx,
            signaller: Arc::new(ProcessSignaller::new(pid, reaped)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tether_host_api::{ExitStatus, Signal, SignalError};

    fn spec(argv: &[&str]) -> LaunchSpec {
        let mut env = HashMap::new();
        if let Ok(path) = std::env::var("PATH") {
            env.insert("PATH".to_string(), path);
        }
        LaunchSpec::new(argv[0], argv[1..].iter().map(|s| s.to_string()).collect()).with_env(env)
    }

    #[tokio::test]
    async fn test_spawn_output_and_close() {
        let launcher = LinuxLauncher::new();
        let mut launched = launcher.launch(&spec(&["sh", "-c", "echo out; echo err >&2"]));

        assert!(matches!(
            launched.events.recv().await,
            Some(LaunchEvent::Spawned { pid }) if pid > 0
        ));
        assert!(matches!(
            launched.events.recv().await,
            Some(LaunchEvent::Exited(status)) if status.is_success()
        ));
        assert!(matches!(
            launched.events.recv().await,
            Some(LaunchEvent::Closed(status)) if status == ExitStatus::success()
        ));

        // Closed is only reported after both streams drained
        assert_eq!(launched.stdout.try_recv().ok().as_deref(), Some("out"));
        assert_eq!(launched.stderr.try_recv().ok().as_deref(), Some("err"));
    }

    #[tokio::test]
    async fn test_spawn_failure_reported_as_event() {
        let launcher = LinuxLauncher::new();
        let mut launched = launcher.launch(&spec(&["qocefkj-does-not-exist"]));

        match launched.events.recv().await {
            Some(LaunchEvent::SpawnFailed(err)) => {
                assert!(err.is_not_found());
                assert_eq!(err.program, "qocefkj-does-not-exist");
            }
            other => panic!("Expected SpawnFailed, got {:?}", other),
        }
        assert_eq!(launched.signaller.pid(), None);
        assert_eq!(
            launched.signaller.send_signal(Signal::SIGTERM),
            Err(SignalError::NotStarted)
        );
    }

    #[tokio::test]
    async fn test_spawn_and_kill() {
        let launcher = LinuxLauncher::new();
        let mut launched = launcher.launch(&spec(&["sleep", "60"]));

        assert!(matches!(
            launched.events.recv().await,
            Some(LaunchEvent::Spawned { .. })
        ));

        launched.signaller.send_signal(Signal::SIGKILL).unwrap();

        assert!(matches!(
            launched.events.recv().await,
            Some(LaunchEvent::Exited(status)) if status.signal == Some(Signal::SIGKILL)
        ));
        assert!(matches!(
            launched.events.recv().await,
            Some(LaunchEvent::Closed(_))
        ));
        assert!(!launched.signaller.is_alive());
    }
}
