//! tether - run a command under supervision
//!
//! Launches one child process, optionally waits for a readiness line,
//! mirrors its output to the log and brings it down cleanly when it exits,
//! when a deadline passes, or when tether itself is interrupted. The exit
//! status is printed to stdout as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tether_config::{ProcessOptions, ReadyCheck, load_config};
use tether_core::{ExitHooks, ExitStatus, HookKind, OutputStream, ProcessEvent, ProcessHandle};
use tether_host_linux::LinuxLauncher;
use tether_util::millis;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// tether - Run a command under supervision and report how it exited
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Run a command under supervision and report how it exited", long_about = None)]
struct Args {
    /// Configuration file with named process entries
    #[arg(short, long, requires = "entry")]
    config: Option<PathBuf>,

    /// Entry in the configuration file to run
    #[arg(short, long, requires = "config")]
    entry: Option<String>,

    /// Wait for an output line containing this text before continuing
    #[arg(short, long)]
    wait_for: Option<String>,

    /// Stream to watch for --wait-for (stdout or stderr)
    #[arg(long, default_value = "stdout")]
    stream: String,

    /// Default timeout for every wait, in milliseconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Stop the command after this many milliseconds
    #[arg(long)]
    run_for: Option<u64>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Command to run, after `--`
    #[arg(last = true)]
    command: Vec<String>,
}

/// Machine-readable summary printed when the child is gone
#[derive(Debug, Serialize)]
struct ExitReport<'a> {
    name: &'a str,
    pid: Option<u32>,
    stopped: bool,
    status: ExitStatus,
}

/// Work out what to run and what readiness line to wait for
fn resolve_process(args: &Args) -> Result<(ProcessOptions, Option<ReadyCheck>)> {
    let (mut options, mut ready) = match (&args.config, &args.entry) {
        (Some(path), Some(entry)) => {
            let config = load_config(path)
                .with_context(|| format!("Failed to load config from {:?}", path))?;
            let entry = config
                .get_process(entry)
                .with_context(|| format!("No process named '{}' in {:?}", entry, path))?;
            (entry.options.clone(), entry.ready.clone())
        }
        _ => {
            let options = ProcessOptions::from_command(args.command.clone())
                .context("No command given; pass one after `--` or use --config/--entry")?;
            (options, None)
        }
    };

    if let Some(timeout) = args.timeout {
        options = options.with_timeout(millis(timeout));
    }

    if let Some(output) = &args.wait_for {
        let stream: OutputStream = args.stream.parse()?;
        ready = Some(ReadyCheck {
            output: output.clone(),
            stream,
            timeout: None,
        });
    }

    Ok((options, ready))
}

/// Copy every child output line and lifecycle event into the log
fn mirror_output(handle: &ProcessHandle) {
    for channel in [handle.stdout(), handle.stderr()] {
        let name = handle.name().to_string();
        let stream = channel.stream();
        channel.subscribe(move |line| {
            info!(target: "tether::child", name = %name, stream = %stream, "{}", line);
        });
    }

    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ProcessEvent::Error(message)) => warn!(error = %message, "Child process error"),
                Ok(event) => debug!(event = ?event, "Child process event"),
                Err(RecvError::Lagged(missed)) => warn!(missed, "Missed child process events"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Map the child's status onto our own exit code, shell style
fn exit_code(status: &ExitStatus) -> u8 {
    match (status.code, status.signal) {
        (Some(code), _) => code.clamp(0, 255) as u8,
        (None, Some(signal)) => (128 + signal as i32).clamp(0, 255) as u8,
        (None, None) => 1,
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let (options, ready) = resolve_process(&args)?;

    let hooks = ExitHooks::new();
    let launcher = LinuxLauncher::new();
    let handle = ProcessHandle::spawn(options, &launcher, &hooks);
    mirror_output(&handle);

    let pid = handle
        .ready(None)
        .await
        .with_context(|| format!("Failed to start {}", handle.name()))?;
    info!(pid, process = %handle, "Process started");

    if let Some(ready) = &ready {
        let waited = handle
            .output(ready.output.as_str(), ready.timeout, Some(ready.stream.as_str()))
            .await;
        match waited {
            Ok(line) => info!(process = %handle, line = %line, "Process ready"),
            Err(e) => {
                hooks.run(HookKind::Exit).await;
                return Err(e).with_context(|| {
                    format!("{} never printed {:?} on {}", handle.name(), ready.output, ready.stream)
                });
            }
        }
    }

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
    let mut interrupted = hooks.listen_for_interrupt();
    let run_for = async {
        match args.run_for {
            Some(ms) => tokio::time::sleep(millis(ms)).await,
            None => std::future::pending().await,
        }
    };

    let status = tokio::select! {
        status = handle.close(None) => status?,
        ran = &mut interrupted => {
            info!(hooks = ran.unwrap_or_default(), "Received SIGINT, stopping child");
            handle.stop(None).await?
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, stopping child");
            hooks.run(HookKind::Exit).await;
            handle.stop(None).await?
        }
        _ = run_for => {
            info!(run_for_ms = args.run_for, "Run time elapsed, stopping child");
            handle.stop(None).await?
        }
    };
    interrupted.abort();

    let report = ExitReport {
        name: handle.name(),
        pid: handle.pid(),
        stopped: handle.is_stopped(),
        status,
    };
    println!("{}", serde_json::to_string(&report)?);
    info!(process = %handle, status = %status, "Process finished");

    Ok(ExitCode::from(exit_code(&status)))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "tether starting");

    run(args).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::Signal;

    fn args(argv: &[&str]) -> Args {
        Args::parse_from(std::iter::once("tether").chain(argv.iter().copied()))
    }

    #[test]
    fn command_after_separator() {
        let (options, ready) = resolve_process(&args(&["--timeout", "250", "--", "sleep", "10"])).unwrap();
        assert_eq!(options.binary, "sleep");
        assert_eq!(options.args, vec!["10"]);
        assert_eq!(options.timeout, millis(250));
        assert!(ready.is_none());
    }

    #[test]
    fn wait_for_builds_ready_check() {
        let (_, ready) =
            resolve_process(&args(&["--wait-for", "listening", "--stream", "stderr", "--", "server"])).unwrap();
        let ready = ready.unwrap();
        assert_eq!(ready.output, "listening");
        assert_eq!(ready.stream, OutputStream::Stderr);
    }

    #[test]
    fn missing_command_is_an_error() {
        assert!(resolve_process(&args(&[])).is_err());
        assert!(resolve_process(&args(&["--stream", "stdin", "--wait-for", "x", "--", "true"])).is_err());
    }

    #[test]
    fn config_entry_is_used() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"
config_version = 1

[[processes]]
name = "echo"
command = ["echo", "hi"]
timeout_ms = 300
"#,
        )
        .unwrap();

        let path = file.path().to_str().unwrap();
        let (options, _) = resolve_process(&args(&["--config", path, "--entry", "echo"])).unwrap();
        assert_eq!(options.display_name(), "echo");
        assert_eq!(options.args, vec!["hi"]);
        assert_eq!(options.timeout, millis(300));

        assert!(resolve_process(&args(&["--config", path, "--entry", "missing"])).is_err());
    }

    #[test]
    fn exit_codes_follow_shell_convention() {
        assert_eq!(exit_code(&ExitStatus::success()), 0);
        assert_eq!(exit_code(&ExitStatus::with_code(3)), 3);
        assert_eq!(exit_code(&ExitStatus::signaled(Signal::SIGTERM)), 143);
        assert_eq!(exit_code(&ExitStatus::signaled(Signal::SIGKILL)), 137);
    }
}
