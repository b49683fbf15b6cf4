// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Whole-rotation commands: run all four steps, or re-run stale key cleanup

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use uuid::Uuid;

use sshrotate_core::domain::rotator_config::RotatorConfigManifest;
use sshrotate_core::domain::secret::{SecretId, VersionId};

use crate::wiring::RotatorRuntime;

#[derive(Args)]
pub struct RotateArgs {
    /// Secret identifier
    #[arg(long, value_name = "SECRET_ID")]
    pub secret_id: String,

    /// Version token to rotate in (default: a fresh UUID). Re-use a token
    /// to resume an interrupted rotation.
    #[arg(long, value_name = "TOKEN")]
    pub token: Option<String>,
}

#[derive(Args)]
pub struct CleanupArgs {
    /// Secret identifier
    #[arg(long, value_name = "SECRET_ID")]
    pub secret_id: String,

    /// Remove this version's key instead of the PREVIOUS one (e.g. a
    /// PENDING version abandoned after setSecret)
    #[arg(long, value_name = "TOKEN")]
    pub version: Option<String>,
}

pub async fn handle_rotate(args: RotateArgs, config: &RotatorConfigManifest) -> Result<()> {
    let runtime = RotatorRuntime::new(config)?;
    let secret_id = SecretId::new(args.secret_id);
    let token = VersionId::new(args.token.unwrap_or_else(|| Uuid::new_v4().to_string()));

    runtime
        .store
        .begin_rotation(&secret_id, &token)
        .await
        .with_context(|| format!("Failed to stage version {} for {}", token, secret_id))?;
    println!("Rotating {} to version {}", secret_id.to_string().bold(), token);

    runtime.orchestrator.rotate(&secret_id, &token).await?;

    println!(
        "{}",
        format!("✓ Rotation complete: {} is now CURRENT", token).green()
    );
    Ok(())
}

pub async fn handle_cleanup(args: CleanupArgs, config: &RotatorConfigManifest) -> Result<()> {
    let runtime = RotatorRuntime::new(config)?;
    let secret_id = SecretId::new(args.secret_id);

    if let Some(version) = args.version {
        let version = VersionId::new(version);
        runtime
            .orchestrator
            .cleanup_version(&secret_id, &version)
            .await?;
        println!(
            "{}",
            format!("✓ Removed key of version {} from the fleet", version).green()
        );
        return Ok(());
    }

    match runtime.orchestrator.cleanup_previous(&secret_id).await? {
        Some(previous) => println!(
            "{}",
            format!("✓ Removed key of version {} from the fleet", previous).green()
        ),
        None => println!("{}", "No PREVIOUS version; nothing to remove".dimmed()),
    }
    Ok(())
}
