// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Single-step invocation commands
//!
//! `step` takes the request as flags; `event` reads the JSON payload a
//! rotation trigger would deliver (`{"SecretId", "ClientRequestToken", "Step"}`).

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::io::Read;
use std::path::PathBuf;

use sshrotate_core::domain::rotation::{RotationRequest, RotationStep};
use sshrotate_core::domain::rotator_config::RotatorConfigManifest;
use sshrotate_core::domain::secret::{SecretId, VersionId};

use crate::wiring::RotatorRuntime;

#[derive(Args)]
pub struct StepArgs {
    /// Secret identifier
    #[arg(long, value_name = "SECRET_ID")]
    pub secret_id: String,

    /// Version token of the rotation in progress
    #[arg(long, value_name = "TOKEN")]
    pub token: String,

    /// createSecret, setSecret, testSecret or finishSecret
    #[arg(long, value_parser = parse_step)]
    pub step: RotationStep,
}

#[derive(Args)]
pub struct EventArgs {
    /// JSON payload file; `-` or omitted reads stdin
    #[arg(value_name = "FILE")]
    pub file: Option<PathBuf>,
}

fn parse_step(value: &str) -> Result<RotationStep, String> {
    value.parse::<RotationStep>().map_err(|e| e.to_string())
}

pub async fn handle_step(args: StepArgs, config: &RotatorConfigManifest) -> Result<()> {
    let request = RotationRequest::new(
        SecretId::new(args.secret_id),
        VersionId::new(args.token),
        args.step,
    );
    run_request(&request, config).await
}

pub async fn handle_event(args: EventArgs, config: &RotatorConfigManifest) -> Result<()> {
    let payload = read_payload(args.file)?;
    let request = RotationRequest::from_json(&payload).context("Invalid rotation event payload")?;
    run_request(&request, config).await
}

fn read_payload(file: Option<PathBuf>) -> Result<String> {
    match file {
        Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read event from {:?}", path)),
        _ => {
            let mut payload = String::new();
            std::io::stdin()
                .read_to_string(&mut payload)
                .context("Failed to read event from stdin")?;
            Ok(payload)
        }
    }
}

async fn run_request(request: &RotationRequest, config: &RotatorConfigManifest) -> Result<()> {
    let runtime = RotatorRuntime::new(config)?;

    match runtime.orchestrator.handle_step(request).await {
        Ok(()) => {
            println!(
                "{}",
                format!(
                    "✓ {} completed for {} (version {})",
                    request.step, request.secret_id, request.token
                )
                .green()
            );
            Ok(())
        }
        Err(e) => {
            if e.is_retryable() {
                eprintln!("{}", "The step can be re-run with the same token.".yellow());
            } else if e.is_precondition() {
                eprintln!(
                    "{}",
                    "The secret or token is not eligible for this step; retrying will not help."
                        .yellow()
                );
            }
            Err(e.into())
        }
    }
}
