// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-process wiring of the rotation service
//!
//! Builds the orchestrator and its collaborators from a loaded
//! [`RotatorConfigManifest`] and hooks Ctrl-C up to its shutdown token.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sshrotate_core::{
    application::{RotationOrchestrator, RotationSettings},
    domain::rotator_config::RotatorConfigManifest,
    infrastructure::{
        fleet::{DispatcherSettings, InventoryFleetDispatcher, ManagementIdentity, StaticInventory},
        keygen::Ed25519KeyPairGenerator,
        secret_store::FileSecretStore,
        ssh::{OpenSshExecutor, SshSettings},
    },
};

/// Load configuration through the standard discovery chain
pub fn load_config(config_path: Option<PathBuf>) -> Result<RotatorConfigManifest> {
    RotatorConfigManifest::load_or_default(config_path).context("Failed to load configuration")
}

pub fn open_store(config: &RotatorConfigManifest) -> FileSecretStore {
    FileSecretStore::new(config.spec.store.path.clone())
}

pub struct RotatorRuntime {
    pub store: Arc<FileSecretStore>,
    pub orchestrator: Arc<RotationOrchestrator>,
}

impl RotatorRuntime {
    pub fn new(config: &RotatorConfigManifest) -> Result<Self> {
        config
            .validate()
            .context("Configuration validation failed")?;

        let management = config
            .spec
            .fleet
            .management
            .as_ref()
            .context("spec.fleet.management is required to push keys to the fleet")?;
        let management_user = management
            .username
            .clone()
            .unwrap_or_else(|| config.spec.rotation.username.clone());
        let identity = ManagementIdentity::load(management_user, &management.private_key_path)
            .context("Failed to load management identity")?;

        let mut ssh_settings = SshSettings::from_config(&config.spec.ssh);
        ssh_settings.session_timeout = config.spec.rotation.command_timeout;
        let executor = Arc::new(OpenSshExecutor::new(ssh_settings));

        let inventory = StaticInventory::new(config.spec.fleet.hosts.clone());
        if config.targeted_hosts().next().is_none() {
            warn!(
                "No configured host matches {}; fleet commands will have no targets",
                config.spec.fleet.selector
            );
        }

        let dispatcher = Arc::new(InventoryFleetDispatcher::new(
            Arc::new(inventory),
            executor.clone(),
            identity,
            DispatcherSettings::from_config(config),
        ));

        let store = Arc::new(open_store(config));
        let orchestrator = Arc::new(RotationOrchestrator::new(
            store.clone(),
            dispatcher,
            Arc::new(Ed25519KeyPairGenerator::new()),
            executor,
            RotationSettings::from_config(config),
        ));

        info!(
            store = %store.path().display(),
            selector = %config.spec.fleet.selector,
            "Rotation service initialized"
        );

        spawn_interrupt_handler(orchestrator.shutdown_token());
        Ok(Self {
            store,
            orchestrator,
        })
    }
}

/// Cancel in-flight waits on the first Ctrl-C
fn spawn_interrupt_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if signal.is_ok() {
                    warn!("Interrupt received, cancelling the running step");
                    shutdown.cancel();
                }
            }
            _ = shutdown.cancelled() => {}
        }
    });
}
