// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Rotation Request & Error Taxonomy
//!
//! A rotation is driven one step at a time by an external trigger. Each
//! invocation names the secret, the version token being rotated in and the
//! [`RotationStep`] to run.
//!
//! ## Error classes
//! | Class | Kinds | Retry |
//! |-------|-------|-------|
//! | Precondition | `RotationNotEnabled`, `UnknownVersion`, `NotPending` | No, fix upstream |
//! | Operational | `FleetCommandFailed`, `CommandTimeout`, `CredentialVerificationFailed` | Re-run the step |
//! | Hygiene | `StaleKeyCleanupFailed` | Rotation already complete, re-run cleanup |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::domain::fleet::{CommandId, FleetError, TargetFailure};
use crate::domain::keygen::KeyGenerationError;
use crate::domain::secret::{SecretId, SecretStoreError, VersionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RotationStep {
    #[serde(rename = "createSecret")]
    CreateSecret,
    #[serde(rename = "setSecret")]
    SetSecret,
    #[serde(rename = "testSecret")]
    TestSecret,
    #[serde(rename = "finishSecret")]
    FinishSecret,
}

impl RotationStep {
    /// Steps in the order a full rotation runs them
    pub const ALL: [RotationStep; 4] = [
        RotationStep::CreateSecret,
        RotationStep::SetSecret,
        RotationStep::TestSecret,
        RotationStep::FinishSecret,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RotationStep::CreateSecret => "createSecret",
            RotationStep::SetSecret => "setSecret",
            RotationStep::TestSecret => "testSecret",
            RotationStep::FinishSecret => "finishSecret",
        }
    }
}

impl fmt::Display for RotationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Invalid step parameter '{0}': expected one of createSecret, setSecret, testSecret, finishSecret")]
pub struct UnknownStepError(pub String);

impl FromStr for RotationStep {
    type Err = UnknownStepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RotationStep::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| UnknownStepError(s.to_string()))
    }
}

/// One step invocation. Deserializes from the trigger payload
/// `{"SecretId": ..., "ClientRequestToken": ..., "Step": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationRequest {
    #[serde(rename = "SecretId", alias = "secretArn", alias = "secret_id")]
    pub secret_id: SecretId,
    #[serde(rename = "ClientRequestToken", alias = "clientRequestToken", alias = "token")]
    pub token: VersionId,
    #[serde(rename = "Step", alias = "step")]
    pub step: RotationStep,
}

impl RotationRequest {
    pub fn new(secret_id: SecretId, token: VersionId, step: RotationStep) -> Self {
        Self {
            secret_id,
            token,
            step,
        }
    }

    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

fn describe_failures(failures: &[TargetFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum RotationErrorKind {
    #[error("Secret is not enabled for rotation")]
    RotationNotEnabled,

    #[error("Secret version has no stage for rotation")]
    UnknownVersion,

    #[error("Secret version not set as PENDING for rotation (stages: {stages:?})")]
    NotPending { stages: Vec<String> },

    #[error("Fleet command {command_id} failed on {} target(s): {}", .failures.len(), describe_failures(.failures))]
    FleetCommandFailed {
        command_id: CommandId,
        failures: Vec<TargetFailure>,
    },

    #[error("Fleet command {command_id} timed out after {waited:?}")]
    CommandTimeout { command_id: CommandId, waited: Duration },

    #[error("Credential verification failed on {} target(s): {}", .failures.len(), describe_failures(.failures))]
    CredentialVerificationFailed { failures: Vec<TargetFailure> },

    #[error("Failed to remove stale key for version {prior_version}: {detail}")]
    StaleKeyCleanupFailed { prior_version: VersionId, detail: String },

    #[error("Secret store error: {0}")]
    SecretStore(#[from] SecretStoreError),

    #[error("Fleet dispatch error: {0}")]
    Fleet(#[from] FleetError),

    #[error("Key generation failed: {0}")]
    KeyGeneration(#[from] KeyGenerationError),

    #[error("Malformed secret value: {0}")]
    MalformedSecret(String),

    #[error("Rotation step cancelled")]
    Cancelled,
}

/// Rotation failure with the correlation context of the invocation
#[derive(Debug, Error)]
#[error("{step} failed for secret {secret_id} version {token}: {kind}")]
pub struct RotationError {
    pub secret_id: SecretId,
    pub token: VersionId,
    pub step: RotationStep,
    pub kind: RotationErrorKind,
}

impl RotationError {
    pub fn new(request: &RotationRequest, kind: impl Into<RotationErrorKind>) -> Self {
        Self {
            secret_id: request.secret_id.clone(),
            token: request.token.clone(),
            step: request.step,
            kind: kind.into(),
        }
    }

    /// Misconfiguration upstream; retrying the same input cannot succeed
    pub fn is_precondition(&self) -> bool {
        matches!(
            self.kind,
            RotationErrorKind::RotationNotEnabled
                | RotationErrorKind::UnknownVersion
                | RotationErrorKind::NotPending { .. }
        )
    }

    /// Operational failure; re-invoking the same step is safe
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            RotationErrorKind::FleetCommandFailed { .. }
            | RotationErrorKind::CommandTimeout { .. }
            | RotationErrorKind::CredentialVerificationFailed { .. }
            | RotationErrorKind::StaleKeyCleanupFailed { .. }
            | RotationErrorKind::Fleet(_)
            | RotationErrorKind::Cancelled => true,
            RotationErrorKind::SecretStore(err) => matches!(
                err,
                SecretStoreError::Backend(_) | SecretStoreError::StageConflict(_)
            ),
            _ => false,
        }
    }
}
