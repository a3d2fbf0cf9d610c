//! Process handle state machine
//!
//! A [`ProcessHandle`] owns one launched child. A driver task consumes the
//! launcher's notifications and output lines, moves the handle through
//! `Starting -> Running -> Closing -> Closed` (or `SpawnFailed`) and
//! settles the ready and closed signals exactly once each. Every public
//! wait is a deadline race over one of those signals.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_config::ProcessOptions;
use tether_host_api::{
    ExitStatus, LaunchEvent, LaunchedProcess, Launcher, OutputStream, Signal, SignalError,
    Signaller, SpawnError,
};
use tether_util::{HookId, as_millis, half};
use tokio::sync::{OnceCell, broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::{
    ExitHooks, HookKind, LineChannel, Matcher, ProcessError, ProcessEvent, ProcessResult,
    ProcessState, race, resolve_timeout,
};

/// Buffered lifecycle events per subscriber
const EVENT_CAPACITY: usize = 64;

#[derive(Debug)]
struct HandleState {
    state: ProcessState,
    pid: Option<u32>,
    stopped: bool,
    hook_ids: Vec<HookId>,
}

struct Inner {
    binary: String,
    args: Vec<String>,
    name: String,
    default_timeout: Duration,
    signaller: Arc<dyn Signaller>,
    stdout: LineChannel,
    stderr: LineChannel,
    state: Mutex<HandleState>,
    ready_tx: watch::Sender<Option<Result<u32, SpawnError>>>,
    closed_tx: watch::Sender<Option<ExitStatus>>,
    events_tx: broadcast::Sender<ProcessEvent>,
    stop_result: OnceCell<ExitStatus>,
    hooks: ExitHooks,
}

/// Handle to one supervised child process
///
/// Cheap to clone; all clones refer to the same child. Every operation is
/// safe to call concurrently from multiple tasks.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<Inner>,
}

impl ProcessHandle {
    /// Launch a child and start supervising it.
    ///
    /// Never fails: a spawn error is reported by [`ready`](Self::ready).
    /// Exit and interrupt hooks are registered in `hooks` until the child
    /// closes. Must be called from within a Tokio runtime.
    pub fn spawn(options: ProcessOptions, launcher: &dyn Launcher, hooks: &ExitHooks) -> Self {
        let spec = options.launch_spec();
        let LaunchedProcess {
            events,
            stdout,
            stderr,
            signaller,
        } = launcher.launch(&spec);

        let (ready_tx, _) = watch::channel(None);
        let (closed_tx, _) = watch::channel(None);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let name = options.display_name().to_string();
        let handle = Self {
            inner: Arc::new(Inner {
                binary: options.binary,
                args: options.args,
                name,
                default_timeout: options.timeout,
                signaller,
                stdout: LineChannel::new(OutputStream::Stdout),
                stderr: LineChannel::new(OutputStream::Stderr),
                state: Mutex::new(HandleState {
                    state: ProcessState::Starting,
                    pid: None,
                    stopped: false,
                    hook_ids: Vec::new(),
                }),
                ready_tx,
                closed_tx,
                events_tx,
                stop_result: OnceCell::new(),
                hooks: hooks.clone(),
            }),
        };

        handle.install_hooks();
        tokio::spawn(drive(handle.inner.clone(), events, stdout, stderr));
        handle
    }

    fn install_hooks(&self) {
        let ids = [HookKind::Exit, HookKind::Interrupt].map(|kind| {
            let weak = Arc::downgrade(&self.inner);
            self.inner.hooks.register(kind, move || {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let handle = ProcessHandle { inner };
                    if let Err(e) = handle.stop(None).await {
                        warn!(process = %handle, hook = %kind, error = %e, "Failed to stop process from hook");
                    }
                }
            })
        });
        self.inner.state.lock().unwrap().hook_ids.extend(ids);
    }

    /// Wait for the spawn outcome. Resolves with the pid.
    pub async fn ready(&self, timeout: Option<Duration>) -> ProcessResult<u32> {
        let deadline = self.resolve(timeout);
        match race("spawn process", deadline, settled(self.inner.ready_tx.subscribe())).await? {
            Some(Ok(pid)) => Ok(pid),
            Some(Err(e)) => Err(e.into()),
            None => Err(ProcessError::Detached),
        }
    }

    /// Wait for the first line on `stream` (stdout by default) that
    /// satisfies `matcher`. Lines printed before the call that nobody has
    /// claimed yet are searched first, so `ready()` followed by `output()`
    /// cannot miss an early line.
    pub async fn output(
        &self,
        matcher: impl Into<Matcher>,
        timeout: Option<Duration>,
        stream: Option<&str>,
    ) -> ProcessResult<String> {
        let channel = match stream {
            Some(name) => self.stream_by_name(name)?,
            None => &self.inner.stdout,
        };
        channel.on_line(matcher, self.resolve(timeout)).await
    }

    /// Send `signal` (SIGTERM by default) and wait for the child to close.
    ///
    /// Delivery failures are returned at once. A timeout does not undo the
    /// signal.
    pub async fn kill(&self, signal: Option<Signal>, timeout: Option<Duration>) -> ProcessResult<ExitStatus> {
        let signal = signal.unwrap_or(Signal::SIGTERM);
        self.signal_and_wait(signal, self.resolve(timeout)).await
    }

    /// Stop the child: SIGTERM with half the deadline, then SIGKILL with
    /// the other half if it was ignored.
    ///
    /// Idempotent. Once a stop has completed every later call returns the
    /// same status without signaling again.
    pub async fn stop(&self, timeout: Option<Duration>) -> ProcessResult<ExitStatus> {
        let deadline = self.resolve(timeout);
        let status = self
            .inner
            .stop_result
            .get_or_try_init(|| self.stop_sequence(deadline))
            .await?;
        Ok(*status)
    }

    async fn stop_sequence(&self, deadline: Duration) -> ProcessResult<ExitStatus> {
        let step = half(deadline);
        info!(process = %self, timeout_ms = as_millis(deadline), "Stopping process");

        let status = match self.signal_and_wait(Signal::SIGTERM, step).await {
            Ok(status) => status,
            Err(ProcessError::Timeout(_)) => {
                warn!(process = %self, grace_ms = as_millis(step), "Process ignored SIGTERM, sending SIGKILL");
                match self.signal_and_wait(Signal::SIGKILL, step).await {
                    Ok(status) => status,
                    Err(ProcessError::AlreadyExited { .. }) => self.wait_closed("stop process", step).await?,
                    Err(e) => return Err(e),
                }
            }
            Err(ProcessError::AlreadyExited { .. }) => {
                debug!(process = %self, "Process already exited, waiting for close");
                self.wait_closed("stop process", deadline).await?
            }
            Err(e) => return Err(e),
        };

        self.inner.state.lock().unwrap().stopped = true;
        info!(process = %self, status = %status, "Process stopped");
        Ok(status)
    }

    /// Wait for the child to close without signaling it.
    ///
    /// `None` waits indefinitely. After a spawn failure this never resolves.
    pub async fn close(&self, timeout: Option<Duration>) -> ProcessResult<ExitStatus> {
        match timeout {
            Some(timeout) => self.wait_closed("close process", self.resolve(Some(timeout))).await,
            None => settled(self.inner.closed_tx.subscribe())
                .await
                .ok_or(ProcessError::Detached),
        }
    }

    async fn signal_and_wait(&self, signal: Signal, deadline: Duration) -> ProcessResult<ExitStatus> {
        self.send_signal(signal)?;
        self.wait_closed("kill process", deadline).await
    }

    fn send_signal(&self, signal: Signal) -> ProcessResult<()> {
        debug!(process = %self, signal = signal.as_str(), "Sending signal");
        self.inner
            .signaller
            .send_signal(signal)
            .map_err(|e| match e {
                SignalError::NotStarted => ProcessError::NotStarted {
                    binary: self.inner.binary.clone(),
                },
                SignalError::AlreadyExited { .. } => ProcessError::AlreadyExited {
                    name: self.inner.name.clone(),
                },
                SignalError::Rejected { signal, reason, .. } => ProcessError::SignalDelivery {
                    name: self.inner.name.clone(),
                    signal,
                    reason,
                },
            })
    }

    async fn wait_closed(&self, label: &'static str, deadline: Duration) -> ProcessResult<ExitStatus> {
        race(label, deadline, settled(self.inner.closed_tx.subscribe()))
            .await?
            .ok_or(ProcessError::Detached)
    }

    fn resolve(&self, timeout: Option<Duration>) -> Duration {
        resolve_timeout(timeout, self.inner.default_timeout)
    }

    /// Look up a line channel by stream name
    pub fn stream_by_name(&self, name: &str) -> ProcessResult<&LineChannel> {
        Ok(self.stream(name.parse()?))
    }

    pub fn stream(&self, stream: OutputStream) -> &LineChannel {
        match stream {
            OutputStream::Stdout => &self.inner.stdout,
            OutputStream::Stderr => &self.inner.stderr,
        }
    }

    pub fn stdout(&self) -> &LineChannel {
        &self.inner.stdout
    }

    pub fn stderr(&self) -> &LineChannel {
        &self.inner.stderr
    }

    /// Subscribe to lifecycle events from this point on
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.state.lock().unwrap().pid
    }

    pub fn state(&self) -> ProcessState {
        self.inner.state.lock().unwrap().state
    }

    /// Whether a `stop` sequence has completed
    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().unwrap().stopped
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn binary(&self) -> &str {
        &self.inner.binary
    }

    pub fn args(&self) -> &[String] {
        &self.inner.args
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid() {
            Some(pid) => write!(f, "[PID: {}] ({}", pid, self.inner.name)?,
            None => write!(f, "[PID: -] ({}", self.inner.name)?,
        }
        for arg in &self.inner.args {
            write!(f, " {}", arg)?;
        }
        f.write_str(")")
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("ProcessHandle")
            .field("name", &self.inner.name)
            .field("pid", &state.pid)
            .field("state", &state.state)
            .field("stopped", &state.stopped)
            .finish_non_exhaustive()
    }
}

/// Wait until a watch slot is filled and return its value
async fn settled<T: Clone>(mut rx: watch::Receiver<Option<T>>) -> Option<T> {
    let value = rx.wait_for(Option::is_some).await.map(|value| (*value).clone());
    value.ok().flatten()
}

/// Driver task: the only writer of a handle's state and line channels
async fn drive(
    inner: Arc<Inner>,
    mut events: mpsc::UnboundedReceiver<LaunchEvent>,
    mut stdout: mpsc::UnboundedReceiver<String>,
    mut stderr: mpsc::UnboundedReceiver<String>,
) {
    let pid = loop {
        match events.recv().await {
            Some(LaunchEvent::Spawned { pid }) => break pid,
            Some(LaunchEvent::SpawnFailed(err)) => {
                inner.on_spawn_failed(err);
                return;
            }
            Some(LaunchEvent::Error(message)) => {
                // Reported through ready() instead
                debug!(name = %inner.name, error = %message, "Dropping launcher error before spawn outcome");
            }
            Some(other) => {
                warn!(name = %inner.name, event = ?other, "Unexpected launcher event before spawn");
            }
            None => {
                let err = SpawnError::new(
                    &inner.binary,
                    io::ErrorKind::Other,
                    "launcher went away before reporting the spawn outcome",
                );
                inner.on_spawn_failed(err);
                return;
            }
        }
    };
    inner.on_spawned(pid);

    let mut stdout_open = true;
    let mut stderr_open = true;
    let status = loop {
        tokio::select! {
            biased;

            line = stdout.recv(), if stdout_open => match line {
                Some(line) => inner.stdout.dispatch(&line),
                None => stdout_open = false,
            },
            line = stderr.recv(), if stderr_open => match line {
                Some(line) => inner.stderr.dispatch(&line),
                None => stderr_open = false,
            },
            event = events.recv() => match event {
                Some(LaunchEvent::Exited(status)) => inner.on_exit(status),
                Some(LaunchEvent::Error(message)) => inner.on_error(message),
                Some(LaunchEvent::Closed(status)) => {
                    while let Ok(line) = stdout.try_recv() {
                        inner.stdout.dispatch(&line);
                    }
                    while let Ok(line) = stderr.try_recv() {
                        inner.stderr.dispatch(&line);
                    }
                    break status;
                }
                Some(other) => {
                    warn!(pid, event = ?other, "Unexpected launcher event after spawn");
                }
                None => {
                    warn!(pid, "Launcher went away without reporting close");
                    break ExitStatus { code: None, signal: None };
                }
            },
        }
    };
    inner.on_close(status);
}

impl Inner {
    fn on_spawned(&self, pid: u32) {
        {
            let mut state = self.state.lock().unwrap();
            state.state = ProcessState::Running;
            state.pid = Some(pid);
        }
        info!(pid, name = %self.name, "Process spawned");
        self.ready_tx.send_replace(Some(Ok(pid)));
        let _ = self.events_tx.send(ProcessEvent::Spawn { pid });
    }

    fn on_spawn_failed(&self, err: SpawnError) {
        warn!(name = %self.name, error = %err, "Process failed to spawn");
        self.state.lock().unwrap().state = ProcessState::SpawnFailed;
        self.ready_tx.send_replace(Some(Err(err.clone())));
        self.deregister_hooks();
        self.stdout.close(ProcessError::Spawn(err.clone()));
        self.stderr.close(ProcessError::Spawn(err));
    }

    fn on_exit(&self, status: ExitStatus) {
        debug!(name = %self.name, status = %status, "Process exited, draining output");
        self.state.lock().unwrap().state = ProcessState::Closing;
        let _ = self.events_tx.send(ProcessEvent::Exit(status));
    }

    fn on_error(&self, message: String) {
        warn!(name = %self.name, error = %message, "Launcher error");
        let _ = self.events_tx.send(ProcessEvent::Error(message));
    }

    fn on_close(&self, status: ExitStatus) {
        let reason = ProcessError::ExitedWhileWaiting { status };
        let failed = self.stdout.close(reason.clone()) + self.stderr.close(reason);
        if failed > 0 {
            warn!(name = %self.name, status = %status, failed, "Failing output watchers on close");
        }

        self.deregister_hooks();

        let pid = {
            let mut state = self.state.lock().unwrap();
            state.state = ProcessState::Closed;
            state.pid
        };
        info!(pid = ?pid, name = %self.name, status = %status, "Process closed");
        self.closed_tx.send_replace(Some(status));
        let _ = self.events_tx.send(ProcessEvent::Close(status));

        if self.signaller.is_alive() {
            warn!(pid = ?pid, name = %self.name, "Process closed but still alive, sending SIGKILL");
            if let Err(e) = self.signaller.send_signal(Signal::SIGKILL) {
                debug!(pid = ?pid, error = %e, "Safety-net SIGKILL not delivered");
            }
        }
    }

    fn deregister_hooks(&self) {
        let ids = std::mem::take(&mut self.state.lock().unwrap().hook_ids);
        for id in ids {
            self.hooks.deregister(id);
        }
    }
}
