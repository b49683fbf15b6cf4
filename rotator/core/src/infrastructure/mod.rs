// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod fleet;
pub mod keygen;
pub mod secret_store;
pub mod ssh;

pub use fleet::{DispatcherSettings, InventoryFleetDispatcher, ManagementIdentity, StaticInventory};
pub use keygen::Ed25519KeyPairGenerator;
pub use secret_store::{FileSecretStore, InMemorySecretStore, SecretCatalog};
pub use ssh::{OpenSshExecutor, SshSettings};
