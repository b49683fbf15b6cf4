// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Secret management commands
//!
//! Commands: init, describe, enable, disable, stage

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;
use uuid::Uuid;

use sshrotate_core::domain::rotator_config::RotatorConfigManifest;
use sshrotate_core::domain::secret::{
    CredentialMaterial, SecretId, SecretStore, StageLabel, VersionId,
};
use sshrotate_core::infrastructure::secret_store::FileSecretStore;

use crate::wiring::open_store;

#[derive(Subcommand)]
pub enum SecretCommand {
    /// Create a secret, optionally importing the key pair already deployed as CURRENT
    Init {
        #[arg(value_name = "SECRET_ID")]
        secret_id: String,

        /// OpenSSH public key file of the deployed key
        #[arg(long, requires = "private_key", value_name = "FILE")]
        public_key: Option<PathBuf>,

        /// OpenSSH private key file of the deployed key
        #[arg(long, requires = "public_key", value_name = "FILE")]
        private_key: Option<PathBuf>,

        /// Version token for the imported key (default: a fresh UUID)
        #[arg(long, value_name = "TOKEN")]
        version: Option<String>,

        /// Create with rotation disabled
        #[arg(long)]
        disabled: bool,
    },

    /// Show versions and stage labels
    Describe {
        #[arg(value_name = "SECRET_ID")]
        secret_id: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Allow rotation
    Enable {
        #[arg(value_name = "SECRET_ID")]
        secret_id: String,
    },

    /// Refuse rotation steps
    Disable {
        #[arg(value_name = "SECRET_ID")]
        secret_id: String,
    },

    /// Stage a value-less PENDING version, as a rotation trigger would
    Stage {
        #[arg(value_name = "SECRET_ID")]
        secret_id: String,

        #[arg(long, value_name = "TOKEN")]
        token: Option<String>,
    },
}

pub async fn handle_command(command: SecretCommand, config: &RotatorConfigManifest) -> Result<()> {
    let store = open_store(config);
    match command {
        SecretCommand::Init {
            secret_id,
            public_key,
            private_key,
            version,
            disabled,
        } => {
            let key_files = public_key.zip(private_key);
            init(&store, SecretId::new(secret_id), key_files, version, !disabled).await
        }
        SecretCommand::Describe { secret_id, json } => describe(&store, SecretId::new(secret_id), json).await,
        SecretCommand::Enable { secret_id } => set_enabled(&store, SecretId::new(secret_id), true).await,
        SecretCommand::Disable { secret_id } => set_enabled(&store, SecretId::new(secret_id), false).await,
        SecretCommand::Stage { secret_id, token } => stage(&store, SecretId::new(secret_id), token).await,
    }
}

fn fresh_token(token: Option<String>) -> VersionId {
    VersionId::new(token.unwrap_or_else(|| Uuid::new_v4().to_string()))
}

async fn init(
    store: &FileSecretStore,
    secret_id: SecretId,
    key_files: Option<(PathBuf, PathBuf)>,
    version: Option<String>,
    rotation_enabled: bool,
) -> Result<()> {
    store
        .create_secret(&secret_id, rotation_enabled)
        .await
        .with_context(|| format!("Failed to create secret {}", secret_id))?;

    if let Some((public_path, private_path)) = key_files {
        let public_key = std::fs::read_to_string(&public_path)
            .with_context(|| format!("Failed to read public key {:?}", public_path))?;
        let private_key = std::fs::read_to_string(&private_path)
            .with_context(|| format!("Failed to read private key {:?}", private_path))?;
        let material = CredentialMaterial::new(public_key.trim(), private_key);
        let fingerprint = material
            .fingerprint()
            .context("Public key is not in OpenSSH '<type> <base64>' format")?;

        let version = fresh_token(version);
        store
            .put_value(&secret_id, &version, &material.to_payload()?, &[StageLabel::Current])
            .await
            .context("Failed to store imported key pair")?;
        println!("Imported {} as CURRENT version {}", fingerprint, version);
    }

    println!("{}", format!("✓ Secret {} created", secret_id).green());
    Ok(())
}

async fn describe(store: &FileSecretStore, secret_id: SecretId, json: bool) -> Result<()> {
    let description = store.describe(&secret_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&description)?);
        return Ok(());
    }

    println!("{} {}", "Secret:".bold(), description.secret_id);
    let rotation = if description.rotation_enabled {
        "enabled".green()
    } else {
        "disabled".yellow()
    };
    println!("  Rotation: {}", rotation);
    println!("  Versions:");
    if description.versions.is_empty() {
        println!("    {}", "(none)".dimmed());
    }
    for (version, stages) in &description.versions {
        let labels = stages
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let labels = if labels.is_empty() {
            "(deprecated)".dimmed().to_string()
        } else {
            labels
        };
        println!("    {} {}", version, labels);
    }

    if let Ok(current) = store.get_value(&secret_id, &StageLabel::Current, None).await {
        if let Some(fingerprint) = CredentialMaterial::from_payload(&current.payload)
            .ok()
            .and_then(|m| m.fingerprint())
        {
            println!("  Current key: {}", fingerprint);
        }
    }
    Ok(())
}

async fn set_enabled(store: &FileSecretStore, secret_id: SecretId, enabled: bool) -> Result<()> {
    store.set_rotation_enabled(&secret_id, enabled).await?;
    let state = if enabled { "enabled" } else { "disabled" };
    println!("{}", format!("✓ Rotation {} for {}", state, secret_id).green());
    Ok(())
}

async fn stage(store: &FileSecretStore, secret_id: SecretId, token: Option<String>) -> Result<()> {
    let token = fresh_token(token);
    store.begin_rotation(&secret_id, &token).await?;
    println!("{}", format!("✓ Staged PENDING version {}", token).green());
    println!("{}", token);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_imports_current_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let public_path = dir.path().join("id.pub");
        let private_path = dir.path().join("id");
        std::fs::write(
            &public_path,
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl ops\n",
        )
        .unwrap();
        std::fs::write(&private_path, "PRIVATE").unwrap();

        let store = FileSecretStore::new(dir.path().join("secrets.json"));
        let secret = SecretId::new("bastion");
        init(
            &store,
            secret.clone(),
            Some((public_path, private_path)),
            Some("v0".to_string()),
            true,
        )
        .await
        .unwrap();

        let description = store.describe(&secret).await.unwrap();
        assert!(description.rotation_enabled);
        assert_eq!(
            description.version_with(&StageLabel::Current),
            Some(&VersionId::new("v0"))
        );

        let err = init(&store, secret, None, None, true).await.unwrap_err();
        assert!(err.to_string().contains("Failed to create secret"));
    }
}
