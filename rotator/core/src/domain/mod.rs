// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain types and collaborator contracts for SSH key rotation.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Secret versions, fleet commands, rotation errors and the
//!   traits the orchestrator consumes

pub mod fleet;
pub mod keygen;
pub mod remote;
pub mod rotation;
pub mod rotator_config;
pub mod secret;
