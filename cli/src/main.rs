// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # sshrotate CLI
//!
//! The `sshrotate` binary drives fleet-wide SSH key rotation.
//!
//! ## Commands
//!
//! - `sshrotate step --secret-id --token --step` - Run one rotation step
//! - `sshrotate event [FILE|-]` - Run one step from a JSON trigger payload
//! - `sshrotate rotate --secret-id` - Stage a new version and run all four steps
//! - `sshrotate cleanup --secret-id` - Re-run removal of the PREVIOUS key
//! - `sshrotate secret init|describe|enable|disable|stage` - Manage secrets
//! - `sshrotate config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::debug;

use sshrotate::commands::{
    self, CleanupArgs, ConfigCommand, EventArgs, RotateArgs, SecretCommand, StepArgs,
};
use sshrotate::wiring;
use sshrotate_core::domain::rotator_config::RotatorConfigManifest;

/// sshrotate - Rotate SSH keys across a tagged fleet
#[derive(Parser)]
#[command(name = "sshrotate")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "SSHROTATE_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, env = "SSHROTATE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, env = "SSHROTATE_LOG_FORMAT", value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single rotation step
    #[command(name = "step")]
    Step(StepArgs),

    /// Run a single rotation step from a JSON event payload
    #[command(name = "event")]
    Event(EventArgs),

    /// Run a complete rotation
    #[command(name = "rotate")]
    Rotate(RotateArgs),

    /// Remove the PREVIOUS version's key from the fleet
    #[command(name = "cleanup")]
    Cleanup(CleanupArgs),

    /// Secret management
    #[command(name = "secret")]
    Secret {
        #[command(subcommand)]
        command: SecretCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let logging = (cli.log_level, cli.log_format);

    match cli.command {
        Commands::Config { command } => {
            init_logging(
                logging.0.as_deref().unwrap_or("info"),
                logging.1.unwrap_or(LogFormat::Text),
            )?;
            commands::config::handle_command(command, cli.config).await
        }
        Commands::Step(args) => {
            let config = prepare(cli.config, logging)?;
            commands::step::handle_step(args, &config).await
        }
        Commands::Event(args) => {
            let config = prepare(cli.config, logging)?;
            commands::step::handle_event(args, &config).await
        }
        Commands::Rotate(args) => {
            let config = prepare(cli.config, logging)?;
            commands::rotate::handle_rotate(args, &config).await
        }
        Commands::Cleanup(args) => {
            let config = prepare(cli.config, logging)?;
            commands::rotate::handle_cleanup(args, &config).await
        }
        Commands::Secret { command } => {
            let config = prepare(cli.config, logging)?;
            commands::secret::handle_command(command, &config).await
        }
    }
}

/// Load configuration and start logging; flags win over the config's
/// `observability.logging` section
fn prepare(
    config_path: Option<PathBuf>,
    (log_level, log_format): (Option<String>, Option<LogFormat>),
) -> Result<RotatorConfigManifest> {
    let config = wiring::load_config(config_path)?;
    let logging = config
        .spec
        .observability
        .as_ref()
        .and_then(|o| o.logging.as_ref());

    let level = log_level
        .or_else(|| logging.map(|l| l.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let format = log_format.unwrap_or(match logging.map(|l| l.format.as_str()) {
        Some("json") => LogFormat::Json,
        _ => LogFormat::Text,
    });

    init_logging(&level, format)?;
    debug!("Loaded configuration '{}'", config.metadata.name);
    Ok(config)
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        LogFormat::Text => builder.compact().init(),
        LogFormat::Json => builder.json().with_current_span(true).init(),
    }

    Ok(())
}
