// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # File-backed Secret Store
//!
//! Persists the [`SecretCatalog`] as a single JSON document. Writes go to a
//! sibling temp file which is then renamed over the target, so a crash never
//! leaves a half-written catalog behind.
//!
//! Every operation holds an advisory lock on `<path>.lock` (shared for
//! reads, exclusive for load-mutate-save), so concurrent `sshrotate`
//! processes pointed at the same document serialize their writes and
//! `move_stage_label` stays a compare-and-swap across processes.

use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::catalog::SecretCatalog;
use crate::domain::secret::{
    SecretDescription, SecretId, SecretStore, SecretStoreError, SecretValue, StageLabel, VersionId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Advisory lock on the store's sibling lock file, released on drop
struct StoreLock {
    file: File,
}

impl StoreLock {
    fn acquire(path: &Path, mode: LockMode) -> Result<Self, SecretStoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let locked = match mode {
            LockMode::Shared => FileExt::lock_shared(&file),
            LockMode::Exclusive => FileExt::lock_exclusive(&file),
        };
        locked.map_err(|e| {
            SecretStoreError::Backend(format!("Failed to lock {}: {}", path.display(), e))
        })?;
        Ok(Self { file })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release secret store lock: {}", e);
        }
    }
}

#[derive(Clone)]
pub struct FileSecretStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling file carrying the cross-process lock
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    async fn acquire(&self, mode: LockMode) -> Result<StoreLock, SecretStoreError> {
        let path = self.lock_path();
        tokio::task::spawn_blocking(move || StoreLock::acquire(&path, mode))
            .await
            .map_err(|e| SecretStoreError::Backend(format!("Store lock task failed: {}", e)))?
    }

    async fn load(&self) -> Result<SecretCatalog, SecretStoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(SecretCatalog::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SecretCatalog::new()),
            Err(e) => Err(SecretStoreError::Backend(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn save(&self, catalog: &SecretCatalog) -> Result<(), SecretStoreError> {
        let contents = serde_json::to_vec_pretty(catalog)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomically(&path, &contents))
            .await
            .map_err(|e| SecretStoreError::Backend(format!("Store writer task failed: {}", e)))??;

        debug!("Persisted secret catalog to {}", self.path.display());
        Ok(())
    }

    async fn read<T>(
        &self,
        f: impl FnOnce(&SecretCatalog) -> Result<T, SecretStoreError>,
    ) -> Result<T, SecretStoreError> {
        let _guard = self.lock.lock().await;
        let _file_lock = self.acquire(LockMode::Shared).await?;
        let catalog = self.load().await?;
        f(&catalog)
    }

    /// Load, mutate and persist under the exclusive store lock. Nothing is
    /// written when `f` fails.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut SecretCatalog) -> Result<T, SecretStoreError>,
    ) -> Result<T, SecretStoreError> {
        let _guard = self.lock.lock().await;
        let _file_lock = self.acquire(LockMode::Exclusive).await?;
        let mut catalog = self.load().await?;
        let result = f(&mut catalog)?;
        self.save(&catalog).await?;
        Ok(result)
    }

    pub async fn create_secret(&self, secret_id: &SecretId, rotation_enabled: bool) -> Result<(), SecretStoreError> {
        self.mutate(|catalog| catalog.create_secret(secret_id, rotation_enabled))
            .await
    }

    pub async fn set_rotation_enabled(&self, secret_id: &SecretId, enabled: bool) -> Result<(), SecretStoreError> {
        self.mutate(|catalog| catalog.set_rotation_enabled(secret_id, enabled))
            .await
    }

    pub async fn begin_rotation(&self, secret_id: &SecretId, token: &VersionId) -> Result<(), SecretStoreError> {
        self.mutate(|catalog| catalog.begin_rotation(secret_id, token))
            .await
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), SecretStoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| SecretStoreError::Backend(format!("Failed to replace {}: {}", path.display(), e)))?;
    Ok(())
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn describe(&self, secret_id: &SecretId) -> Result<SecretDescription, SecretStoreError> {
        self.read(|catalog| catalog.describe(secret_id)).await
    }

    async fn get_value(
        &self,
        secret_id: &SecretId,
        stage: &StageLabel,
        version: Option<&VersionId>,
    ) -> Result<SecretValue, SecretStoreError> {
        self.read(|catalog| catalog.get_value(secret_id, stage, version))
            .await
    }

    async fn put_value(
        &self,
        secret_id: &SecretId,
        version: &VersionId,
        payload: &str,
        stages: &[StageLabel],
    ) -> Result<(), SecretStoreError> {
        self.mutate(|catalog| catalog.put_value(secret_id, version, payload, stages))
            .await
    }

    async fn move_stage_label(
        &self,
        secret_id: &SecretId,
        label: &StageLabel,
        to: &VersionId,
        from: Option<&VersionId>,
    ) -> Result<(), SecretStoreError> {
        self.mutate(|catalog| catalog.move_stage_label(secret_id, label, to, from))
            .await
    }
}
