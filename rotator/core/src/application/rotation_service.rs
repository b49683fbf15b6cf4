// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Rotation Orchestrator
//!
//! Four-step state machine that moves a fleet-wide SSH credential from the
//! `CURRENT` version to a freshly staged `PENDING` one.
//!
//! ## Step Table
//! | Step | Effect | Re-run behaviour |
//! |------|--------|------------------|
//! | `createSecret` | Generate a key pair, store it as `PENDING` | Reuses stored material |
//! | `setSecret` | Append the public key on every targeted host | Remote append is idempotent |
//! | `testSecret` | SSH into every host with the pending key | Read-only |
//! | `finishSecret` | Move `CURRENT` to the token, remove the prior key | No-op once promoted |
//!
//! The orchestrator holds no rotation state between invocations. Every call
//! re-reads the secret's stage labels and derives its position from them; the
//! store's atomic label move is the only point of mutual exclusion.

use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::fleet::{
    CommandId, CommandState, CommandStatus, FleetCommandDispatcher, FleetError, FleetSelector,
    KeyAction, TargetFailure,
};
use crate::domain::keygen::KeyPairGenerator;
use crate::domain::remote::RemoteExecutor;
use crate::domain::rotation::{RotationError, RotationErrorKind, RotationRequest, RotationStep};
use crate::domain::rotator_config::RotatorConfigManifest;
use crate::domain::secret::{
    CredentialMaterial, SecretDescription, SecretId, SecretStore, SecretStoreError, StageLabel,
    VersionId,
};

/// Process-wide rotation settings, fixed for the lifetime of the orchestrator
#[derive(Debug, Clone)]
pub struct RotationSettings {
    pub selector: FleetSelector,
    /// Login user for the rotated key
    pub username: String,
    pub verification_command: String,
    pub command_timeout: Duration,
    pub verification_timeout: Duration,
    pub max_concurrency: usize,
    pub allow_empty_fleet: bool,
}

impl RotationSettings {
    pub fn new(selector: FleetSelector, username: impl Into<String>) -> Self {
        Self {
            selector,
            username: username.into(),
            verification_command: "hostname".to_string(),
            command_timeout: Duration::from_secs(600),
            verification_timeout: Duration::from_secs(30),
            max_concurrency: 16,
            allow_empty_fleet: false,
        }
    }

    pub fn from_config(config: &RotatorConfigManifest) -> Self {
        let rotation = &config.spec.rotation;
        Self {
            selector: config.spec.fleet.selector.clone(),
            username: rotation.username.clone(),
            verification_command: rotation.verification_command.clone(),
            command_timeout: rotation.command_timeout,
            verification_timeout: rotation.verification_timeout,
            max_concurrency: rotation.max_concurrency.max(1),
            allow_empty_fleet: rotation.allow_empty_fleet,
        }
    }
}

/// Outcome of the per-invocation precondition check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Token already holds `CURRENT`; the invocation is a retry of a finished rotation
    AlreadyCurrent,
    Proceed,
}

/// Validate that `token` is eligible for a rotation step
pub fn check_preconditions(
    description: &SecretDescription,
    token: &VersionId,
) -> Result<Disposition, RotationErrorKind> {
    if !description.rotation_enabled {
        return Err(RotationErrorKind::RotationNotEnabled);
    }

    let stages = description
        .stages_of(token)
        .ok_or(RotationErrorKind::UnknownVersion)?;

    if stages.contains(&StageLabel::Current) {
        return Ok(Disposition::AlreadyCurrent);
    }

    if !stages.contains(&StageLabel::Pending) {
        return Err(RotationErrorKind::NotPending {
            stages: stages.iter().map(|s| s.to_string()).collect(),
        });
    }

    Ok(Disposition::Proceed)
}

pub struct RotationOrchestrator {
    store: Arc<dyn SecretStore>,
    dispatcher: Arc<dyn FleetCommandDispatcher>,
    generator: Arc<dyn KeyPairGenerator>,
    executor: Arc<dyn RemoteExecutor>,
    settings: RotationSettings,
    shutdown_token: CancellationToken,
}

impl RotationOrchestrator {
    pub fn new(
        store: Arc<dyn SecretStore>,
        dispatcher: Arc<dyn FleetCommandDispatcher>,
        generator: Arc<dyn KeyPairGenerator>,
        executor: Arc<dyn RemoteExecutor>,
        settings: RotationSettings,
    ) -> Self {
        Self {
            store,
            dispatcher,
            generator,
            executor,
            settings,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &RotationSettings {
        &self.settings
    }

    /// Cancelling this token aborts any in-flight wait with `Cancelled`
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Run one rotation step.
    ///
    /// Safe to call any number of times with the same request: every step
    /// either converges on the same end state or short-circuits as a no-op.
    #[tracing::instrument(
        name = "rotation_step",
        skip_all,
        fields(secret_id = %request.secret_id, token = %request.token, step = %request.step)
    )]
    pub async fn handle_step(&self, request: &RotationRequest) -> Result<(), RotationError> {
        let fail = |kind: RotationErrorKind| RotationError::new(request, kind);

        let description = self
            .store
            .describe(&request.secret_id)
            .await
            .map_err(|e| fail(e.into()))?;
        debug!(versions = description.versions.len(), "Fetched secret metadata");

        match check_preconditions(&description, &request.token) {
            Ok(Disposition::Proceed) => {}
            Ok(Disposition::AlreadyCurrent) => {
                info!(
                    "Secret version {} already set as CURRENT for secret {}",
                    request.token, request.secret_id
                );
                return Ok(());
            }
            Err(kind) => {
                warn!("Rotation precondition failed: {}", kind);
                return Err(fail(kind));
            }
        }

        info!("Executing step: {}", request.step);
        let result = match request.step {
            RotationStep::CreateSecret => self.create_secret(&request.secret_id, &request.token).await,
            RotationStep::SetSecret => self.set_secret(&request.secret_id, &request.token).await,
            RotationStep::TestSecret => self.test_secret(&request.secret_id, &request.token).await,
            RotationStep::FinishSecret => self.finish_secret(&request.secret_id, &request.token).await,
        };

        result.map_err(|kind| {
            warn!("Step {} failed: {}", request.step, kind);
            fail(kind)
        })
    }

    /// Run all four steps in order for a token already staged as `PENDING`
    pub async fn rotate(&self, secret_id: &SecretId, token: &VersionId) -> Result<(), RotationError> {
        for step in RotationStep::ALL {
            let request = RotationRequest::new(secret_id.clone(), token.clone(), step);
            self.handle_step(&request).await?;
        }
        Ok(())
    }

    async fn create_secret(&self, secret_id: &SecretId, token: &VersionId) -> Result<(), RotationErrorKind> {
        match self
            .store
            .get_value(secret_id, &StageLabel::Pending, Some(token))
            .await
        {
            Ok(_) => {
                info!("createSecret: Successfully retrieved secret for {}", secret_id);
                return Ok(());
            }
            Err(e) if e.is_value_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        info!("createSecret: Generating a key pair with token {}", token);
        let material = self.generator.generate(token.as_str())?.into_material();
        info!(
            fingerprint = material.fingerprint().as_deref().unwrap_or("unknown"),
            "createSecret: Key pair generated"
        );

        let payload = material
            .to_payload()
            .map_err(|e| RotationErrorKind::MalformedSecret(e.to_string()))?;
        self.store
            .put_value(secret_id, token, &payload, &[StageLabel::Pending])
            .await?;

        info!(
            "createSecret: Successfully put secret for {} and version {}",
            secret_id, token
        );
        Ok(())
    }

    async fn set_secret(&self, secret_id: &SecretId, token: &VersionId) -> Result<(), RotationErrorKind> {
        let material = self.pending_material(secret_id, token).await?;

        info!(
            selector = %self.settings.selector,
            "setSecret: Adding the new public key with token {}", token
        );
        let command_id = self
            .dispatcher
            .issue(
                &self.settings.selector,
                KeyAction::AddKey {
                    version: token.clone(),
                    public_key: material.public_key.clone(),
                },
            )
            .await?;

        info!("setSecret: Waiting for command {} to complete", command_id);
        let status = self.wait_for_command(command_id).await?;
        ensure_succeeded(&status)?;

        info!(
            targets = status.targets.len(),
            "setSecret: Command {} completed successfully", command_id
        );
        Ok(())
    }

    async fn test_secret(&self, secret_id: &SecretId, token: &VersionId) -> Result<(), RotationErrorKind> {
        let material = self.pending_material(secret_id, token).await?;

        let addresses = self
            .dispatcher
            .resolve_addresses(&self.settings.selector, token)
            .await?;

        if addresses.is_empty() {
            if self.settings.allow_empty_fleet {
                warn!("testSecret: Selector resolved no hosts, nothing to verify");
                return Ok(());
            }
            return Err(RotationErrorKind::CredentialVerificationFailed {
                failures: vec![TargetFailure {
                    address: self.settings.selector.to_string(),
                    reason: "selector resolved no hosts".to_string(),
                }],
            });
        }

        info!(
            targets = addresses.len(),
            "testSecret: Running '{}' as '{}' with the pending key",
            self.settings.verification_command,
            self.settings.username
        );

        let verification = stream::iter(
            addresses
                .iter()
                .map(|address| self.verify_target(address, &material))
                .collect::<Vec<_>>(),
        )
            .buffer_unordered(self.settings.max_concurrency.max(1))
            .filter_map(|outcome| async move { outcome.err() })
            .collect::<Vec<TargetFailure>>();

        let failures = tokio::select! {
            failures = verification => failures,
            _ = self.shutdown_token.cancelled() => return Err(RotationErrorKind::Cancelled),
        };

        if !failures.is_empty() {
            return Err(RotationErrorKind::CredentialVerificationFailed { failures });
        }

        info!("testSecret: SSH test succeeded on {} host(s)", addresses.len());
        Ok(())
    }

    async fn finish_secret(&self, secret_id: &SecretId, token: &VersionId) -> Result<(), RotationErrorKind> {
        let description = self.store.describe(secret_id).await?;
        let prior_version = description.version_with(&StageLabel::Current).cloned();

        if prior_version.as_ref() == Some(token) {
            info!(
                "finishSecret: Version {} already marked as CURRENT for {}",
                token, secret_id
            );
            return Ok(());
        }

        match self
            .store
            .move_stage_label(secret_id, &StageLabel::Current, token, prior_version.as_ref())
            .await
        {
            Ok(()) => {}
            Err(SecretStoreError::StageConflict(detail)) => {
                // Lost the race: succeed only if the concurrent winner promoted this token
                let fresh = self.store.describe(secret_id).await?;
                if fresh.version_with(&StageLabel::Current) == Some(token) {
                    info!("finishSecret: Version {} was promoted concurrently", token);
                    return Ok(());
                }
                return Err(SecretStoreError::StageConflict(detail).into());
            }
            Err(e) => return Err(e.into()),
        }
        info!(
            "finishSecret: Successfully set CURRENT stage to version {} for secret {}",
            token, secret_id
        );

        // Promotion is durable; removal runs even if the re-read fails
        let reread = self.reread_current(secret_id, token).await;
        if let Err(e) = &reread {
            warn!("finishSecret: Failed to re-read CURRENT after promotion: {}", e);
        }

        match prior_version {
            Some(prior) => self.cleanup_stale_key(&prior).await?,
            None => info!("finishSecret: No prior CURRENT version, nothing to remove"),
        }
        reread
    }

    async fn reread_current(&self, secret_id: &SecretId, token: &VersionId) -> Result<(), RotationErrorKind> {
        let current = self
            .store
            .get_value(secret_id, &StageLabel::Current, None)
            .await?;
        if &current.version_id != token {
            warn!(
                "finishSecret: CURRENT resolved to {} instead of {}",
                current.version_id, token
            );
        }
        let material = parse_material(&current.payload)?;
        info!(
            fingerprint = material.fingerprint().as_deref().unwrap_or("unknown"),
            "finishSecret: CURRENT material re-read"
        );
        Ok(())
    }

    /// Remove the key tagged `prior_version` from the fleet.
    ///
    /// Runs as the tail of `finishSecret` and can be re-run on its own when
    /// that cleanup failed; the promotion itself is never undone.
    pub async fn cleanup_stale_key(&self, prior_version: &VersionId) -> Result<(), RotationErrorKind> {
        let stale = |detail: String| RotationErrorKind::StaleKeyCleanupFailed {
            prior_version: prior_version.clone(),
            detail,
        };

        info!(
            "finishSecret: Removing the old public key with token {}",
            prior_version
        );
        let command_id = self
            .dispatcher
            .issue(
                &self.settings.selector,
                KeyAction::RemoveKey {
                    version: prior_version.clone(),
                },
            )
            .await
            .map_err(|e| stale(e.to_string()))?;

        info!("finishSecret: Waiting for command {} to complete", command_id);
        let status = self
            .wait_for_command(command_id)
            .await
            .map_err(|kind| stale(kind.to_string()))?;
        ensure_succeeded(&status).map_err(|kind| stale(kind.to_string()))?;

        info!("finishSecret: Command {} completed successfully", command_id);
        Ok(())
    }

    /// Re-run stale key removal for the version labeled `PREVIOUS`
    pub async fn cleanup_previous(&self, secret_id: &SecretId) -> Result<Option<VersionId>, RotationErrorKind> {
        let description = self.store.describe(secret_id).await?;
        let Some(previous) = description.version_with(&StageLabel::Previous).cloned() else {
            info!("No PREVIOUS version for {}, nothing to clean up", secret_id);
            return Ok(None);
        };
        self.cleanup_stale_key(&previous).await?;
        Ok(Some(previous))
    }

    /// Remove the key of a version that is neither `CURRENT` nor `PENDING`,
    /// such as one abandoned after `setSecret` when a new rotation took over
    pub async fn cleanup_version(&self, secret_id: &SecretId, version: &VersionId) -> Result<(), RotationErrorKind> {
        let description = self.store.describe(secret_id).await?;
        let Some(stages) = description.stages_of(version) else {
            return Err(RotationErrorKind::UnknownVersion);
        };
        if stages.contains(&StageLabel::Current) || stages.contains(&StageLabel::Pending) {
            return Err(SecretStoreError::InvalidRequest(format!(
                "version {} is still in use ({:?}), refusing to remove its key",
                version, stages
            ))
            .into());
        }
        self.cleanup_stale_key(version).await
    }

    async fn pending_material(
        &self,
        secret_id: &SecretId,
        token: &VersionId,
    ) -> Result<CredentialMaterial, RotationErrorKind> {
        let value = self
            .store
            .get_value(secret_id, &StageLabel::Pending, Some(token))
            .await?;
        parse_material(&value.payload)
    }

    /// Suspend until the command is terminal, the deadline passes or shutdown is requested
    async fn wait_for_command(&self, command_id: CommandId) -> Result<CommandStatus, RotationErrorKind> {
        let deadline = self.settings.command_timeout;
        let wait = tokio::time::timeout(deadline, self.dispatcher.await_completion(&command_id));

        let outcome = tokio::select! {
            outcome = wait => outcome,
            _ = self.shutdown_token.cancelled() => return Err(RotationErrorKind::Cancelled),
        };

        match outcome {
            Ok(Ok(status)) if status.is_terminal() => Ok(status),
            Ok(Ok(_)) | Err(_) => Err(RotationErrorKind::CommandTimeout {
                command_id,
                waited: deadline,
            }),
            Ok(Err(FleetError::Timeout { command_id, waited })) => {
                Err(RotationErrorKind::CommandTimeout { command_id, waited })
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn verify_target(&self, address: &str, material: &CredentialMaterial) -> Result<(), TargetFailure> {
        let session = self.executor.run(
            address,
            &self.settings.username,
            &material.private_key,
            &self.settings.verification_command,
        );

        match tokio::time::timeout(self.settings.verification_timeout, session).await {
            Ok(Ok(output)) => {
                debug!(address, output = output.stdout.trim(), "Verification succeeded");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(address, "Verification failed: {}", e);
                Err(TargetFailure {
                    address: address.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!(address, "Verification timed out");
                Err(TargetFailure {
                    address: address.to_string(),
                    reason: format!(
                        "verification timed out after {:?}",
                        self.settings.verification_timeout
                    ),
                })
            }
        }
    }
}

fn parse_material(payload: &str) -> Result<CredentialMaterial, RotationErrorKind> {
    CredentialMaterial::from_payload(payload)
        .map_err(|e| RotationErrorKind::MalformedSecret(e.to_string()))
}

fn ensure_succeeded(status: &CommandStatus) -> Result<(), RotationErrorKind> {
    if status.state == CommandState::Success {
        return Ok(());
    }
    Err(RotationErrorKind::FleetCommandFailed {
        command_id: status.command_id,
        failures: status.failures(),
    })
}

/// Versions holding `CURRENT`; used by invariant checks and diagnostics
pub fn current_holders(description: &SecretDescription) -> BTreeSet<VersionId> {
    description
        .versions
        .iter()
        .filter(|(_, stages)| stages.contains(&StageLabel::Current))
        .map(|(version, _)| version.clone())
        .collect()
}
