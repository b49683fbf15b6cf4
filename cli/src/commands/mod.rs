// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the sshrotate CLI

pub mod config;
pub mod rotate;
pub mod secret;
pub mod step;

pub use self::config::ConfigCommand;
pub use self::rotate::{CleanupArgs, RotateArgs};
pub use self::secret::SecretCommand;
pub use self::step::{EventArgs, StepArgs};
