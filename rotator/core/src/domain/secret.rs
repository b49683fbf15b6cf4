// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Versioned Secret Domain Types
//!
//! A rotated credential lives in a versioned secret store. Every version is
//! identified by an opaque token and carries zero or more **stage labels**;
//! the labels are the only durable record of where a rotation stands.
//!
//! | Label | Meaning |
//! |-------|---------|
//! | `CURRENT` | Material in active use across the fleet |
//! | `PENDING` | Material being rotated in, not yet promoted |
//! | `PREVIOUS` | Material superseded by the last promotion |
//!
//! The [`SecretStore`] trait is the persistence contract consumed by the
//! rotation orchestrator; implementations live in
//! `crate::infrastructure::secret_store`.

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Identifier (ARN or name) of a secret in the store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretId(pub String);

impl SecretId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned version token (the rotation's client request token)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(pub String);

impl VersionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stage label attached to a secret version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StageLabel {
    Current,
    Pending,
    Previous,
    /// Labels owned by other tooling; carried through untouched
    Custom(String),
}

impl StageLabel {
    pub fn as_str(&self) -> &str {
        match self {
            StageLabel::Current => "CURRENT",
            StageLabel::Pending => "PENDING",
            StageLabel::Previous => "PREVIOUS",
            StageLabel::Custom(label) => label,
        }
    }
}

impl From<String> for StageLabel {
    fn from(value: String) -> Self {
        match value.as_str() {
            "CURRENT" | "AWSCURRENT" => StageLabel::Current,
            "PENDING" | "AWSPENDING" => StageLabel::Pending,
            "PREVIOUS" | "AWSPREVIOUS" => StageLabel::Previous,
            _ => StageLabel::Custom(value),
        }
    }
}

impl From<StageLabel> for String {
    fn from(label: StageLabel) -> Self {
        label.as_str().to_string()
    }
}

impl fmt::Display for StageLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a secret's rotation metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretDescription {
    pub secret_id: SecretId,
    pub rotation_enabled: bool,
    pub versions: BTreeMap<VersionId, BTreeSet<StageLabel>>,
}

impl SecretDescription {
    /// Stage labels of a version, `None` when the store does not know it
    pub fn stages_of(&self, version: &VersionId) -> Option<&BTreeSet<StageLabel>> {
        self.versions.get(version)
    }

    /// The version currently holding `label`, if any
    pub fn version_with(&self, label: &StageLabel) -> Option<&VersionId> {
        self.versions
            .iter()
            .find(|(_, stages)| stages.contains(label))
            .map(|(version, _)| version)
    }

    /// Number of versions holding `label`; `CURRENT` must never exceed one
    pub fn holders_of(&self, label: &StageLabel) -> usize {
        self.versions.values().filter(|stages| stages.contains(label)).count()
    }
}

/// A secret value as returned by the store
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue {
    pub secret_id: SecretId,
    pub version_id: VersionId,
    pub stages: BTreeSet<StageLabel>,
    pub payload: String,
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretValue")
            .field("secret_id", &self.secret_id)
            .field("version_id", &self.version_id)
            .field("stages", &self.stages)
            .field("payload", &"<redacted>")
            .finish()
    }
}

/// SSH key pair stored as the secret payload.
///
/// Wire format is a JSON object `{"PublicKey": "...", "PrivateKey": "..."}`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialMaterial {
    #[serde(rename = "PublicKey")]
    pub public_key: String,
    #[serde(rename = "PrivateKey")]
    pub private_key: String,
}

impl CredentialMaterial {
    pub fn new(public_key: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            private_key: private_key.into(),
        }
    }

    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// OpenSSH-style `SHA256:` fingerprint of the public key, safe to log
    pub fn fingerprint(&self) -> Option<String> {
        public_key_fingerprint(&self.public_key)
    }
}

impl fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialMaterial")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Fingerprint an OpenSSH public key line (`<algo> <base64> [comment]`)
pub fn public_key_fingerprint(public_key: &str) -> Option<String> {
    let blob = public_key.split_whitespace().nth(1)?;
    let decoded = STANDARD.decode(blob).ok()?;
    let digest = Sha256::digest(&decoded);
    Some(format!("SHA256:{}", STANDARD_NO_PAD.encode(digest)))
}

/// Secret store errors
#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("No value for secret {secret_id} at stage {stage} (version {})", .version.as_deref().unwrap_or("any"))]
    ValueNotFound {
        secret_id: String,
        stage: String,
        version: Option<String>,
    },

    #[error("Stage label conflict: {0}")]
    StageConflict(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SecretStoreError {
    /// Whether the error means "this value does not exist (yet)"
    pub fn is_value_not_found(&self) -> bool {
        matches!(self, SecretStoreError::ValueNotFound { .. })
    }
}

impl From<serde_json::Error> for SecretStoreError {
    fn from(err: serde_json::Error) -> Self {
        SecretStoreError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SecretStoreError {
    fn from(err: std::io::Error) -> Self {
        SecretStoreError::Backend(err.to_string())
    }
}

/// Versioned secret store consumed by the rotation orchestrator
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Rotation flag and version → stage label map
    async fn describe(&self, secret_id: &SecretId) -> Result<SecretDescription, SecretStoreError>;

    /// Value at `stage`; when `version` is given it must also hold `stage`
    async fn get_value(
        &self,
        secret_id: &SecretId,
        stage: &StageLabel,
        version: Option<&VersionId>,
    ) -> Result<SecretValue, SecretStoreError>;

    /// Store `payload` under `version` and attach `stages` to it
    async fn put_value(
        &self,
        secret_id: &SecretId,
        version: &VersionId,
        payload: &str,
        stages: &[StageLabel],
    ) -> Result<(), SecretStoreError>;

    /// Atomically move `label` to `to`; fails with `StageConflict` unless
    /// `from` is the version currently holding it
    async fn move_stage_label(
        &self,
        secret_id: &SecretId,
        label: &StageLabel,
        to: &VersionId,
        from: Option<&VersionId>,
    ) -> Result<(), SecretStoreError>;
}
