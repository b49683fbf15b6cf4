// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! In-memory model of versioned secrets shared by every store backend.
//!
//! Label semantics:
//! - a stage label is attached to at most one version of a secret; attaching
//!   it elsewhere detaches it from the previous holder
//! - moving `CURRENT` re-labels the old holder `PREVIOUS` and clears
//!   `PENDING` from the new holder
//! - `move_stage_label` is a compare-and-swap on the label's current holder
//! - a version's payload is immutable once written

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::domain::secret::{
    SecretDescription, SecretId, SecretStoreError, SecretValue, StageLabel, VersionId,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretCatalog {
    #[serde(default)]
    pub secrets: BTreeMap<SecretId, SecretRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRecord {
    pub rotation_enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub versions: BTreeMap<VersionId, VersionRecord>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    #[serde(default)]
    pub stages: BTreeSet<StageLabel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for VersionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionRecord")
            .field("stages", &self.stages)
            .field("has_payload", &self.payload.is_some())
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl VersionRecord {
    fn new(payload: Option<String>) -> Self {
        Self {
            stages: BTreeSet::new(),
            payload,
            created_at: Utc::now(),
        }
    }
}

impl SecretRecord {
    fn holder_of(&self, label: &StageLabel) -> Option<VersionId> {
        self.versions
            .iter()
            .find(|(_, version)| version.stages.contains(label))
            .map(|(id, _)| id.clone())
    }

    /// Attach `label` to `to`, detaching it from every other version
    fn attach_label(&mut self, label: &StageLabel, to: &VersionId) {
        if *label == StageLabel::Current {
            let demoted: Vec<VersionId> = self
                .versions
                .iter()
                .filter(|(id, v)| *id != to && v.stages.contains(&StageLabel::Current))
                .map(|(id, _)| id.clone())
                .collect();
            if !demoted.is_empty() {
                for version in self.versions.values_mut() {
                    version.stages.remove(&StageLabel::Previous);
                }
                for id in &demoted {
                    if let Some(version) = self.versions.get_mut(id) {
                        version.stages.insert(StageLabel::Previous);
                    }
                }
            }
        }

        for (id, version) in self.versions.iter_mut() {
            if id != to {
                version.stages.remove(label);
            }
        }

        if let Some(version) = self.versions.get_mut(to) {
            if *label == StageLabel::Current {
                version.stages.remove(&StageLabel::Pending);
                version.stages.remove(&StageLabel::Previous);
            }
            version.stages.insert(label.clone());
        }
    }
}

impl SecretCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, secret_id: &SecretId) -> Result<&SecretRecord, SecretStoreError> {
        self.secrets
            .get(secret_id)
            .ok_or_else(|| SecretStoreError::SecretNotFound(secret_id.to_string()))
    }

    fn record_mut(&mut self, secret_id: &SecretId) -> Result<&mut SecretRecord, SecretStoreError> {
        self.secrets
            .get_mut(secret_id)
            .ok_or_else(|| SecretStoreError::SecretNotFound(secret_id.to_string()))
    }

    pub fn create_secret(&mut self, secret_id: &SecretId, rotation_enabled: bool) -> Result<(), SecretStoreError> {
        if self.secrets.contains_key(secret_id) {
            return Err(SecretStoreError::InvalidRequest(format!(
                "secret {} already exists",
                secret_id
            )));
        }
        self.secrets.insert(
            secret_id.clone(),
            SecretRecord {
                rotation_enabled,
                created_at: Utc::now(),
                versions: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn set_rotation_enabled(&mut self, secret_id: &SecretId, enabled: bool) -> Result<(), SecretStoreError> {
        self.record_mut(secret_id)?.rotation_enabled = enabled;
        Ok(())
    }

    /// Stage a value-less `PENDING` version, as a rotation trigger does before
    /// invoking `createSecret`. Re-staging the same pending token is a no-op.
    pub fn begin_rotation(&mut self, secret_id: &SecretId, token: &VersionId) -> Result<(), SecretStoreError> {
        let record = self.record_mut(secret_id)?;
        if let Some(existing) = record.versions.get(token) {
            if existing.stages.contains(&StageLabel::Pending) {
                return Ok(());
            }
            return Err(SecretStoreError::InvalidRequest(format!(
                "version {} already exists and is not PENDING",
                token
            )));
        }
        if let Some(abandoned) = record.holder_of(&StageLabel::Pending) {
            let pushed = record
                .versions
                .get(&abandoned)
                .is_some_and(|version| version.payload.is_some());
            if pushed {
                warn!(
                    "Version {} of {} loses PENDING to {}; its key may already be on the fleet, remove it with `sshrotate cleanup --version {}`",
                    abandoned, secret_id, token, abandoned
                );
            }
        }
        record.versions.insert(token.clone(), VersionRecord::new(None));
        record.attach_label(&StageLabel::Pending, token);
        Ok(())
    }

    pub fn describe(&self, secret_id: &SecretId) -> Result<SecretDescription, SecretStoreError> {
        let record = self.record(secret_id)?;
        Ok(SecretDescription {
            secret_id: secret_id.clone(),
            rotation_enabled: record.rotation_enabled,
            versions: record
                .versions
                .iter()
                .map(|(id, version)| (id.clone(), version.stages.clone()))
                .collect(),
        })
    }

    pub fn get_value(
        &self,
        secret_id: &SecretId,
        stage: &StageLabel,
        version: Option<&VersionId>,
    ) -> Result<SecretValue, SecretStoreError> {
        let record = self.record(secret_id)?;
        let not_found = || SecretStoreError::ValueNotFound {
            secret_id: secret_id.to_string(),
            stage: stage.to_string(),
            version: version.map(|v| v.to_string()),
        };

        let version_id = match version {
            Some(version) => version.clone(),
            None => record.holder_of(stage).ok_or_else(not_found)?,
        };

        let entry = record.versions.get(&version_id).ok_or_else(not_found)?;
        if !entry.stages.contains(stage) {
            return Err(not_found());
        }
        let payload = entry.payload.clone().ok_or_else(not_found)?;

        Ok(SecretValue {
            secret_id: secret_id.clone(),
            version_id,
            stages: entry.stages.clone(),
            payload,
        })
    }

    pub fn put_value(
        &mut self,
        secret_id: &SecretId,
        version: &VersionId,
        payload: &str,
        stages: &[StageLabel],
    ) -> Result<(), SecretStoreError> {
        let record = self.record_mut(secret_id)?;
        let entry = record
            .versions
            .entry(version.clone())
            .or_insert_with(|| VersionRecord::new(None));

        match &entry.payload {
            Some(existing) if existing != payload => {
                return Err(SecretStoreError::InvalidRequest(format!(
                    "version {} already holds a different value",
                    version
                )));
            }
            Some(_) => {}
            None => entry.payload = Some(payload.to_string()),
        }

        for stage in stages {
            record.attach_label(stage, version);
        }
        Ok(())
    }

    pub fn move_stage_label(
        &mut self,
        secret_id: &SecretId,
        label: &StageLabel,
        to: &VersionId,
        from: Option<&VersionId>,
    ) -> Result<(), SecretStoreError> {
        let record = self.record_mut(secret_id)?;
        if !record.versions.contains_key(to) {
            return Err(SecretStoreError::InvalidRequest(format!(
                "version {} does not exist",
                to
            )));
        }

        let holder = record.holder_of(label);
        if holder.as_ref() != from {
            return Err(SecretStoreError::StageConflict(format!(
                "{} is attached to {}, expected {}",
                label,
                holder.map(|v| v.to_string()).unwrap_or_else(|| "no version".to_string()),
                from.map(|v| v.to_string()).unwrap_or_else(|| "no version".to_string()),
            )));
        }

        record.attach_label(label, to);
        Ok(())
    }
}
