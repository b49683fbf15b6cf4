// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use thiserror::Error;

use crate::domain::secret::CredentialMaterial;

/// Freshly generated key pair in OpenSSH encodings
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl KeyPair {
    pub fn into_material(self) -> CredentialMaterial {
        CredentialMaterial::new(self.public_key, self.private_key)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum KeyGenerationError {
    #[error("Invalid seed: {0}")]
    InvalidSeed(String),
    #[error("Key encoding failed: {0}")]
    Encoding(String),
}

/// Produces a key pair labeled by `seed` (the rotation's version token).
/// Implementations hold no shared mutable state so a retry is always safe.
pub trait KeyPairGenerator: Send + Sync {
    fn generate(&self, seed: &str) -> Result<KeyPair, KeyGenerationError>;
}
