// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use sshrotate_core::domain::rotator_config::RotatorConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective manifest as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./sshrotate.yaml)
        #[arg(short, long, default_value = "./sshrotate.yaml")]
        output: PathBuf,

        /// Include examples and comments
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = RotatorConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. SSHROTATE_CONFIG_PATH: {}",
            std::env::var("SSHROTATE_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./sshrotate.yaml");
        println!("  4. ~/.sshrotate/config.yaml");
        println!("  5. /etc/sshrotate/config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    println!("{}", "Current configuration:".bold());
    println!();

    let rotation = &config.spec.rotation;
    println!("{}", "Rotation:".bold());
    println!("  Name: {}", config.metadata.name);
    println!("  Username: {}", or_unset(&rotation.username));
    println!("  Verification command: {}", rotation.verification_command);
    println!("  Command timeout: {:?}", rotation.command_timeout);
    println!("  Verification timeout: {:?}", rotation.verification_timeout);
    println!("  Max concurrency: {}", rotation.max_concurrency);
    println!();

    let fleet = &config.spec.fleet;
    println!("{}", "Fleet:".bold());
    println!("  Selector: {}", fleet.selector);
    println!(
        "  Poll interval: {:?} (max {:?})",
        fleet.poll_interval, fleet.max_poll_interval
    );
    match &fleet.management {
        Some(management) => println!(
            "  Management identity: {} ({})",
            management
                .username
                .as_deref()
                .unwrap_or(rotation.username.as_str()),
            management.private_key_path.display()
        ),
        None => println!("  Management identity: {}", "(not set)".yellow()),
    }
    println!(
        "  authorized_keys: {}",
        fleet
            .authorized_keys_path
            .as_deref()
            .unwrap_or("$HOME/.ssh/authorized_keys")
    );
    let targeted: Vec<_> = config.targeted_hosts().collect();
    println!("  Hosts: {} configured, {} targeted", fleet.hosts.len(), targeted.len());
    for host in targeted {
        println!("    - {}", host.address);
    }
    println!();

    println!("{}", "SSH:".bold());
    println!("  Program: {} (port {})", config.spec.ssh.program, config.spec.ssh.port);
    println!("  StrictHostKeyChecking: {}", config.spec.ssh.strict_host_key_checking);
    println!();

    println!("{}", "Store:".bold());
    println!("  Path: {}", config.spec.store.path.display());
    println!();

    Ok(())
}

fn or_unset(value: &str) -> String {
    if value.is_empty() {
        "(not set)".yellow().to_string()
    } else {
        value.to_string()
    }
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = RotatorConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    if config.spec.fleet.management.is_none() {
        println!(
            "{}",
            "⚠ spec.fleet.management is not set; setSecret and finishSecret cannot push keys"
                .yellow()
        );
    }

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, with_examples: bool) -> Result<()> {
    let sample = if with_examples {
        include_str!("../../templates/config-with-examples.yaml")
    } else {
        include_str!("../../templates/config-minimal.yaml")
    };

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}
