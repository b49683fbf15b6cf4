// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod catalog;
pub mod file;
pub mod memory;

pub use catalog::SecretCatalog;
pub use file::FileSecretStore;
pub use memory::InMemorySecretStore;
