//! Config validation CLI tool
//!
//! Validates a tether configuration file and reports any errors.

use std::path::PathBuf;
use std::process::ExitCode;
use tether_util::{as_millis, format_seconds};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("Usage: validate-config <config-file>");
            eprintln!();
            eprintln!("Validates a tether configuration file.");
            eprintln!();
            eprintln!("Example:");
            eprintln!("  validate-config tether.toml");
            return ExitCode::from(2);
        }
    };

    // Check file exists
    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    // Try to load and validate
    match tether_config::load_config(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", tether_config::CURRENT_CONFIG_VERSION);
            println!("  Default timeout: {}ms", as_millis(config.default_timeout));
            println!("  Processes: {}", config.processes.len());

            if !config.processes.is_empty() {
                println!();
                println!("Processes:");
                for entry in &config.processes {
                    let mut command = vec![entry.options.binary.clone()];
                    command.extend(entry.options.args.iter().cloned());
                    println!(
                        "  - {} (timeout {}s): {}",
                        entry.name(),
                        format_seconds(entry.options.timeout),
                        command.join(" ")
                    );
                    if let Some(ready) = &entry.ready {
                        println!("      ready when {} contains {:?}", ready.stream, ready.output);
                    }
                }
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                tether_config::ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                tether_config::ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                tether_config::ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                tether_config::ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver,
                        tether_config::CURRENT_CONFIG_VERSION
                    );
                }
                tether_config::ConfigError::InvalidCommand(msg) => {
                    eprintln!("Invalid command: {}", msg);
                }
            }
            ExitCode::from(1)
        }
    }
}
