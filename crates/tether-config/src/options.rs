//! Validated process options

use crate::schema::{RawConfig, RawProcess, RawReadyCheck};
use crate::validation::validate_command;
use crate::{ConfigError, ConfigResult};
use std::collections::HashMap;
use std::time::Duration;
use tether_host_api::{LaunchSpec, OutputStream};
use tether_util::millis;

/// Default timeout for every blocking call on a process handle
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// How to launch one process and how long to wait on it
///
/// The child's environment is built in three tiers, later tiers winning:
/// `x_env` (defaults), then `env` (the base, the supervisor's own
/// environment when `None`), then `env_x` (forced overrides).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOptions {
    pub binary: String,
    pub args: Vec<String>,
    pub name: Option<String>,
    pub x_env: HashMap<String, String>,
    pub env: Option<HashMap<String, String>>,
    pub env_x: HashMap<String, String>,
    pub timeout: Duration,
}

impl ProcessOptions {
    /// Options for `binary` with `args` and every other setting at its default
    pub fn new<I, S>(binary: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            binary: binary.into(),
            args: args.into_iter().map(Into::into).collect(),
            name: None,
            x_env: HashMap::new(),
            env: None,
            env_x: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Options from a command list whose first element is the binary
    pub fn from_command(command: Vec<String>) -> ConfigResult<Self> {
        validate_command(&command).map_err(ConfigError::InvalidCommand)?;
        let mut command = command.into_iter();
        let binary = command.next().unwrap_or_default();
        Ok(Self::new(binary, command))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_x_env(mut self, x_env: HashMap<String, String>) -> Self {
        self.x_env = x_env;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_env_x(mut self, env_x: HashMap<String, String>) -> Self {
        self.env_x = env_x;
        self
    }

    /// Set the default timeout. Zero keeps the built-in default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() { DEFAULT_TIMEOUT } else { timeout };
        self
    }

    /// Display label: the configured name, or the binary
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.binary)
    }

    /// The child's full environment after layering the three tiers
    pub fn merged_env(&self) -> HashMap<String, String> {
        let mut merged = self.x_env.clone();
        match &self.env {
            Some(env) => merged.extend(env.clone()),
            None => merged.extend(std::env::vars()),
        }
        merged.extend(self.env_x.clone());
        merged
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec::new(&self.binary, self.args.clone()).with_env(self.merged_env())
    }
}

/// Output that marks a process as ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyCheck {
    pub output: String,
    pub stream: OutputStream,
    pub timeout: Option<Duration>,
}

impl ReadyCheck {
    fn from_raw(raw: RawReadyCheck) -> Self {
        Self {
            output: raw.output,
            stream: raw.stream.unwrap_or(OutputStream::Stdout),
            timeout: raw.timeout_ms.map(millis),
        }
    }
}

/// A named process definition from the config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub options: ProcessOptions,
    pub ready: Option<ReadyCheck>,
}

impl ProcessEntry {
    fn from_raw(raw: RawProcess, default_timeout: Duration) -> ConfigResult<Self> {
        let timeout = raw.timeout_ms.map(millis).unwrap_or(default_timeout);

        let mut options = ProcessOptions::from_command(raw.command)?
            .with_name(raw.name)
            .with_x_env(raw.x_env)
            .with_env_x(raw.env_x)
            .with_timeout(timeout);
        options.env = raw.env;

        Ok(Self {
            options,
            ready: raw.ready.map(ReadyCheck::from_raw),
        })
    }

    pub fn name(&self) -> &str {
        self.options.display_name()
    }
}

/// Validated configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub default_timeout: Duration,
    pub processes: Vec<ProcessEntry>,
}

impl Config {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> ConfigResult<Self> {
        let default_timeout = raw
            .defaults
            .timeout_ms
            .map(millis)
            .unwrap_or(DEFAULT_TIMEOUT);

        let processes = raw
            .processes
            .into_iter()
            .map(|p| ProcessEntry::from_raw(p, default_timeout))
            .collect::<ConfigResult<Vec<_>>>()?;

        Ok(Self {
            default_timeout,
            processes,
        })
    }

    /// Get a process entry by name
    pub fn get_process(&self, name: &str) -> Option<&ProcessEntry> {
        self.processes.iter().find(|p| p.name() == name)
    }
}
