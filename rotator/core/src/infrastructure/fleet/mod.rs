// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod authorized_keys;
pub mod dispatcher;
pub mod inventory;

pub use dispatcher::{DispatcherSettings, InventoryFleetDispatcher, ManagementIdentity};
pub use inventory::{FleetInventory, StaticInventory};
