// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Fleet-wide SSH key rotation.
//!
//! # Architecture
//!
//! - **Domain:** secret versions, fleet commands, collaborator traits
//! - **Application:** the four-step [`application::RotationOrchestrator`]
//! - **Infrastructure:** secret stores, key generation, OpenSSH execution,
//!   inventory-backed fleet dispatch

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
