//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tether_host_api::OutputStream;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Settings shared by every process entry
    #[serde(default)]
    pub defaults: RawDefaults,

    /// Process definitions
    #[serde(default)]
    pub processes: Vec<RawProcess>,
}

/// Workspace-wide defaults
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawDefaults {
    /// Default timeout for blocking calls, in milliseconds
    pub timeout_ms: Option<u64>,
}

/// Raw process definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawProcess {
    /// Unique name, also used as the display label
    pub name: String,

    /// Binary followed by its arguments
    pub command: Vec<String>,

    /// Default values for environment variables
    #[serde(default)]
    pub x_env: HashMap<String, String>,

    /// Base environment. Omitted means "inherit from the supervisor".
    pub env: Option<HashMap<String, String>>,

    /// Overrides that take precedence over everything else
    #[serde(default)]
    pub env_x: HashMap<String, String>,

    /// Timeout override for this process, in milliseconds
    pub timeout_ms: Option<u64>,

    /// Output that signals the process is ready
    pub ready: Option<RawReadyCheck>,
}

/// Readiness marker
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawReadyCheck {
    /// Substring to wait for
    pub output: String,

    /// Stream to watch (default: stdout)
    #[serde(default)]
    pub stream: Option<OutputStream>,

    /// Wait limit in milliseconds, overriding the process timeout
    pub timeout_ms: Option<u64>,
}
