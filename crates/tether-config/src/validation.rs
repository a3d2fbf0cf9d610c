//! Configuration validation

use crate::schema::{RawConfig, RawProcess};
use std::collections::HashSet;
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Process '{name}': {message}")]
    ProcessError { name: String, message: String },

    #[error("Duplicate process name: {0}")]
    DuplicateName(String),

    #[error("Global config error: {0}")]
    GlobalError(String),
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.defaults.timeout_ms == Some(0) {
        errors.push(ValidationError::GlobalError(
            "defaults.timeout_ms must be greater than 0 (omit it to use 1000)".into(),
        ));
    }

    // Check for duplicate names
    let mut seen = HashSet::new();
    for process in &config.processes {
        if !seen.insert(&process.name) {
            errors.push(ValidationError::DuplicateName(process.name.clone()));
        }
    }

    for process in &config.processes {
        errors.extend(validate_process(process));
    }

    errors
}

/// Validate a command list: at least one element, and a non-empty binary
pub fn validate_command(command: &[String]) -> Result<(), String> {
    match command.first() {
        None => Err("command must have at least 1 string indicating the binary".into()),
        Some(binary) if binary.trim().is_empty() => Err("binary cannot be empty".into()),
        Some(_) => Ok(()),
    }
}

fn validate_process(process: &RawProcess) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let error = |message: &str| ValidationError::ProcessError {
        name: process.name.clone(),
        message: message.to_string(),
    };

    if process.name.trim().is_empty() {
        errors.push(error("name cannot be empty"));
    }

    if let Err(message) = validate_command(&process.command) {
        errors.push(error(&message));
    }

    if process.timeout_ms == Some(0) {
        errors.push(error("timeout_ms must be greater than 0"));
    }

    if let Some(ready) = &process.ready {
        if ready.output.is_empty() {
            errors.push(error("ready.output cannot be empty"));
        }
        if ready.timeout_ms == Some(0) {
            errors.push(error("ready.timeout_ms must be greater than 0"));
        }
    }

    errors
}
