// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Inventory Fleet Dispatcher
//!
//! [`FleetCommandDispatcher`] that pushes key changes itself instead of
//! delegating to a managed run-command service:
//!
//! 1. `issue` resolves the selector through a [`FleetInventory`], records a
//!    [`RotationCommand`] and spawns one task per target
//! 2. each task edits `authorized_keys` over SSH with the management
//!    identity, bounded by a shared semaphore and a per-target timeout
//! 3. `await_completion` polls the record with doubling backoff until it is
//!    terminal
//!
//! The record leaves the registry whenever `await_completion` ends: terminal
//! status, its own deadline, or the caller dropping the wait. Target tasks
//! still running for that command are cancelled at the same time.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use async_trait::async_trait;
use chrono::Utc;

use super::authorized_keys::{add_key_script, authorized_key_line, remove_key_script, validate_token};
use super::inventory::FleetInventory;
use crate::domain::fleet::{
    CommandId, CommandStatus, FleetCommandDispatcher, FleetError, FleetSelector, KeyAction,
    RotationCommand, TargetOutcome, TargetResult,
};
use crate::domain::remote::RemoteExecutor;
use crate::domain::rotator_config::RotatorConfigManifest;
use crate::domain::secret::VersionId;

/// Credentials the dispatcher uses to log into hosts and edit their keys
#[derive(Clone)]
pub struct ManagementIdentity {
    pub username: String,
    pub private_key: String,
}

impl std::fmt::Debug for ManagementIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementIdentity")
            .field("username", &self.username)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl ManagementIdentity {
    pub fn new(username: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            private_key: private_key.into(),
        }
    }

    pub fn load(username: impl Into<String>, private_key_path: &Path) -> Result<Self, FleetError> {
        let private_key = std::fs::read_to_string(private_key_path).map_err(|e| {
            FleetError::InvalidRequest(format!(
                "Failed to read management key {}: {}",
                private_key_path.display(),
                e
            ))
        })?;
        Ok(Self::new(username, private_key))
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    /// Upper bound for `await_completion`
    pub command_timeout: Duration,
    /// Upper bound for one host's key edit
    pub target_timeout: Duration,
    pub max_concurrency: usize,
    /// `None` edits `$HOME/.ssh/authorized_keys` of the management user
    pub authorized_keys_path: Option<String>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_poll_interval: Duration::from_secs(30),
            command_timeout: Duration::from_secs(600),
            target_timeout: Duration::from_secs(60),
            max_concurrency: 16,
            authorized_keys_path: None,
        }
    }
}

impl DispatcherSettings {
    pub fn from_config(config: &RotatorConfigManifest) -> Self {
        let fleet = &config.spec.fleet;
        let rotation = &config.spec.rotation;
        Self {
            poll_interval: fleet.poll_interval,
            max_poll_interval: fleet.max_poll_interval.max(fleet.poll_interval),
            command_timeout: rotation.command_timeout,
            target_timeout: rotation.command_timeout.min(Duration::from_secs(60)),
            max_concurrency: rotation.max_concurrency.max(1),
            authorized_keys_path: fleet.authorized_keys_path.clone(),
        }
    }
}

struct TrackedCommand {
    command: RotationCommand,
    cancel: CancellationToken,
}

type CommandRegistry = Arc<Mutex<HashMap<CommandId, TrackedCommand>>>;

/// Drops a command from the registry and cancels its target tasks once the
/// waiter goes away, however `await_completion` ends
struct Collector<'a> {
    commands: &'a CommandRegistry,
    command_id: CommandId,
}

impl Drop for Collector<'_> {
    fn drop(&mut self) {
        let removed = self.commands.lock().remove(&self.command_id);
        if let Some(tracked) = removed {
            if !tracked.command.status().is_terminal() {
                debug!("Abandoning command {}", self.command_id);
            }
            tracked.cancel.cancel();
        }
    }
}

pub struct InventoryFleetDispatcher {
    inventory: Arc<dyn FleetInventory>,
    executor: Arc<dyn RemoteExecutor>,
    identity: ManagementIdentity,
    settings: DispatcherSettings,
    commands: CommandRegistry,
    permits: Arc<Semaphore>,
}

impl InventoryFleetDispatcher {
    pub fn new(
        inventory: Arc<dyn FleetInventory>,
        executor: Arc<dyn RemoteExecutor>,
        identity: ManagementIdentity,
        settings: DispatcherSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrency.max(1)));
        Self {
            inventory,
            executor,
            identity,
            settings,
            commands: Arc::new(Mutex::new(HashMap::new())),
            permits,
        }
    }

    /// Commands issued but not yet collected by `await_completion`
    pub fn outstanding(&self) -> usize {
        self.commands.lock().len()
    }

    fn script_for(&self, action: &KeyAction) -> Result<String, FleetError> {
        let path = self.settings.authorized_keys_path.as_deref();
        match action {
            KeyAction::AddKey {
                version,
                public_key,
            } => {
                let line = authorized_key_line(public_key, version)?;
                Ok(add_key_script(path, &line))
            }
            KeyAction::RemoveKey { version } => remove_key_script(path, version),
        }
    }

    fn spawn_target(
        &self,
        command_id: CommandId,
        address: String,
        script: Arc<String>,
        cancel: CancellationToken,
    ) {
        let executor = self.executor.clone();
        let identity = self.identity.clone();
        let commands = self.commands.clone();
        let permits = self.permits.clone();
        let timeout = self.settings.target_timeout;

        tokio::spawn(async move {
            let work = async {
                match permits.acquire_owned().await {
                    Ok(_permit) => {
                        let run = executor.run(&address, &identity.username, &identity.private_key, &script);
                        match tokio::time::timeout(timeout, run).await {
                            Ok(Ok(_)) => TargetOutcome::Success,
                            Ok(Err(e)) => TargetOutcome::Failed(e.to_string()),
                            Err(_) => TargetOutcome::Failed(format!("timed out after {:?}", timeout)),
                        }
                    }
                    Err(_) => TargetOutcome::Failed("dispatcher shut down".to_string()),
                }
            };

            let outcome = tokio::select! {
                outcome = work => outcome,
                _ = cancel.cancelled() => {
                    debug!("Command {} abandoned, stopped work on {}", command_id, address);
                    return;
                }
            };

            if let TargetOutcome::Failed(reason) = &outcome {
                warn!("Command {} failed on {}: {}", command_id, address, reason);
            } else {
                debug!("Command {} succeeded on {}", command_id, address);
            }

            let result = TargetResult {
                address,
                outcome,
                finished_at: Utc::now(),
            };
            if let Some(tracked) = commands.lock().get_mut(&command_id) {
                tracked.command.record(result);
            }
        });
    }
}

#[async_trait]
impl FleetCommandDispatcher for InventoryFleetDispatcher {
    async fn issue(&self, selector: &FleetSelector, action: KeyAction) -> Result<CommandId, FleetError> {
        validate_token(action.version())?;
        let script = Arc::new(self.script_for(&action)?);
        let targets = self.inventory.resolve(selector).await?;

        let command = RotationCommand::new(selector.clone(), action, targets.clone());
        let command_id = command.id;
        info!(
            command_id = %command_id,
            action = command.action.name(),
            version = %command.action.version(),
            targets = targets.len(),
            "Issued fleet command for {}",
            selector
        );
        let cancel = CancellationToken::new();
        self.commands.lock().insert(
            command_id,
            TrackedCommand {
                command,
                cancel: cancel.clone(),
            },
        );

        for address in targets {
            self.spawn_target(command_id, address, script.clone(), cancel.clone());
        }
        Ok(command_id)
    }

    async fn await_completion(&self, command_id: &CommandId) -> Result<CommandStatus, FleetError> {
        let waited = self.settings.command_timeout;
        let _collector = Collector {
            commands: &self.commands,
            command_id: *command_id,
        };
        let poll = async {
            let mut delay = self.settings.poll_interval;
            loop {
                let status = self
                    .commands
                    .lock()
                    .get(command_id)
                    .map(|tracked| tracked.command.status())
                    .ok_or(FleetError::UnknownCommand(*command_id))?;

                if status.is_terminal() {
                    return Ok(status);
                }

                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.settings.max_poll_interval);
            }
        };

        match tokio::time::timeout(waited, poll).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Command {} still pending after {:?}", command_id, waited);
                Err(FleetError::Timeout {
                    command_id: *command_id,
                    waited,
                })
            }
        }
    }

    async fn resolve_addresses(
        &self,
        selector: &FleetSelector,
        version: &VersionId,
    ) -> Result<Vec<String>, FleetError> {
        validate_token(version)?;
        let addresses = self.inventory.resolve(selector).await?;
        debug!("Resolved {} host(s) for {} (version {})", addresses.len(), selector, version);
        Ok(addresses)
    }
}
