//! Process management utilities

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{Id, WaitPidFlag, waitid};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tether_host_api::{
    ExitStatus, LaunchEvent, LaunchSpec, OutputStream, SignalError, Signaller, SpawnError,
};

/// Build the command for a launch spec
///
/// The child gets exactly the environment in the spec, piped stdout/stderr,
/// no stdin, and is killed if its `Child` is dropped before it is reaped.
pub fn build_command(spec: &LaunchSpec) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .env_clear()
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Describe a spawn failure, naming the errno (`ENOENT: No such file or directory`)
pub fn spawn_error(program: &str, err: &io::Error) -> SpawnError {
    let message = match err.raw_os_error() {
        Some(code) => Errno::from_raw(code).to_string(),
        None => err.to_string(),
    };
    SpawnError::new(program, err.kind(), message)
}

/// Convert a std exit status into the launcher's representation
pub fn convert_status(status: std::process::ExitStatus) -> ExitStatus {
    if let Some(code) = status.code() {
        return ExitStatus::with_code(code);
    }
    match status.signal().map(Signal::try_from) {
        Some(Ok(sig)) => ExitStatus::signaled(sig),
        _ => ExitStatus {
            code: None,
            signal: None,
        },
    }
}

/// Decode a byte stream into lines and forward them until EOF
///
/// Accepts `\n` and `\r\n` terminators, replaces invalid UTF-8, and emits a
/// final unterminated line if the stream ends without a newline.
pub async fn pump_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>, stream: OutputStream, pid: u32)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                // Keep draining even with nobody listening so the child never blocks on a full pipe
                let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
            }
            Err(e) => {
                warn!(pid = pid, stream = %stream, error = %e, "Error reading child output");
                break;
            }
        }
    }

    debug!(pid = pid, stream = %stream, "Output stream ended");
}

/// Shared between a child's signaller and its monitor; true once the pid
/// may be released to the OS
///
/// Signals are sent while holding the lock and the monitor only sets the
/// flag (and then reaps) while nobody else holds it, so a signal can never
/// reach a recycled pid.
pub type ReapGuard = Arc<Mutex<bool>>;

pub fn reap_guard() -> ReapGuard {
    Arc::new(Mutex::new(false))
}

/// Block until `pid` has exited without reaping it.
///
/// The child stays a zombie, so its pid cannot be reused until it is waited on.
pub fn wait_for_exit(pid: u32) -> nix::Result<()> {
    loop {
        let id = Id::Pid(Pid::from_raw(pid as i32));
        match waitid(id, WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Err(Errno::EINTR) => continue,
            other => return other.map(|_| ()),
        }
    }
}

/// Signal delivery for a spawned child
pub struct ProcessSignaller {
    pid: u32,
    reaped: ReapGuard,
}

impl ProcessSignaller {
    pub fn new(pid: u32, reaped: ReapGuard) -> Self {
        Self { pid, reaped }
    }
}

impl Signaller for ProcessSignaller {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn send_signal(&self, sig: Signal) -> Result<(), SignalError> {
        let reaped = self.reaped.lock().unwrap();
        if *reaped {
            return Err(SignalError::AlreadyExited { pid: self.pid });
        }

        match signal::kill(Pid::from_raw(self.pid as i32), sig) {
            Ok(()) => {
                debug!(pid = self.pid, signal = sig.as_str(), "Sent signal");
                Ok(())
            }
            Err(Errno::ESRCH) => Err(SignalError::AlreadyExited { pid: self.pid }),
            Err(e) => Err(SignalError::Rejected {
                pid: self.pid,
                signal: sig,
                reason: e.to_string(),
            }),
        }
    }

    fn is_alive(&self) -> bool {
        !*self.reaped.lock().unwrap()
    }
}

/// Signaller for a launch that never produced a process
pub struct UnstartedSignaller;

impl Signaller for UnstartedSignaller {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn send_signal(&self, _signal: Signal) -> Result<(), SignalError> {
        Err(SignalError::NotStarted)
    }

    fn is_alive(&self) -> bool {
        false
    }
}

/// Wait for the child, then for its output pumps, reporting `Exited` and `Closed`
///
/// Exit is first observed without reaping (on a blocking thread), the guard
/// is flipped, and only then is the child reaped.
pub async fn monitor_child(
    mut child: Child,
    pid: u32,
    pumps: Vec<JoinHandle<()>>,
    reaped: ReapGuard,
    event_tx: mpsc::UnboundedSender<LaunchEvent>,
) {
    match tokio::task::spawn_blocking(move || wait_for_exit(pid)).await {
        Ok(Ok(())) => *reaped.lock().unwrap() = true,
        Ok(Err(e)) => debug!(pid = pid, error = %e, "Could not observe exit before reaping"),
        Err(e) => warn!(pid = pid, error = %e, "Exit watcher task failed"),
    }

    let status = match child.wait().await {
        Ok(status) => convert_status(status),
        Err(e) => {
            warn!(pid = pid, error = %e, "Wait failed");
            let _ = event_tx.send(LaunchEvent::Error(format!("Wait failed: {}", e)));
            ExitStatus {
                code: None,
                signal: None,
            }
        }
    };
    *reaped.lock().unwrap() = true;

    debug!(pid = pid, status = %status, "Process exited");
    let _ = event_tx.send(LaunchEvent::Exited(status));

    for pump in pumps {
        if let Err(e) = pump.await {
            warn!(pid = pid, error = %e, "Output pump task failed");
        }
    }

    debug!(pid = pid, status = %status, "Process closed");
    let _ = event_tx.send(LaunchEvent::Closed(status));
}
