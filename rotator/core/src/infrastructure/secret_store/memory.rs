// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use super::catalog::SecretCatalog;
use crate::domain::secret::{
    SecretDescription, SecretId, SecretStore, SecretStoreError, SecretValue, StageLabel, VersionId,
};

/// Process-local secret store. Every operation runs under one lock, so
/// label moves are atomic with respect to concurrent step invocations.
#[derive(Clone, Default)]
pub struct InMemorySecretStore {
    catalog: Arc<Mutex<SecretCatalog>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_catalog(catalog: SecretCatalog) -> Self {
        Self {
            catalog: Arc::new(Mutex::new(catalog)),
        }
    }

    pub fn create_secret(&self, secret_id: &SecretId, rotation_enabled: bool) -> Result<(), SecretStoreError> {
        self.catalog.lock().create_secret(secret_id, rotation_enabled)
    }

    pub fn set_rotation_enabled(&self, secret_id: &SecretId, enabled: bool) -> Result<(), SecretStoreError> {
        self.catalog.lock().set_rotation_enabled(secret_id, enabled)
    }

    pub fn begin_rotation(&self, secret_id: &SecretId, token: &VersionId) -> Result<(), SecretStoreError> {
        self.catalog.lock().begin_rotation(secret_id, token)
    }

    pub fn snapshot(&self) -> SecretCatalog {
        self.catalog.lock().clone()
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn describe(&self, secret_id: &SecretId) -> Result<SecretDescription, SecretStoreError> {
        self.catalog.lock().describe(secret_id)
    }

    async fn get_value(
        &self,
        secret_id: &SecretId,
        stage: &StageLabel,
        version: Option<&VersionId>,
    ) -> Result<SecretValue, SecretStoreError> {
        self.catalog.lock().get_value(secret_id, stage, version)
    }

    async fn put_value(
        &self,
        secret_id: &SecretId,
        version: &VersionId,
        payload: &str,
        stages: &[StageLabel],
    ) -> Result<(), SecretStoreError> {
        self.catalog.lock().put_value(secret_id, version, payload, stages)
    }

    async fn move_stage_label(
        &self,
        secret_id: &SecretId,
        label: &StageLabel,
        to: &VersionId,
        from: Option<&VersionId>,
    ) -> Result<(), SecretStoreError> {
        self.catalog.lock().move_stage_label(secret_id, label, to, from)
    }
}
