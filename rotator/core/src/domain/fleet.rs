// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Fleet Command Domain Types
//!
//! A [`RotationCommand`] is one fleet-wide key operation (add or remove a
//! public key tagged with a secret version). The dispatcher owns its
//! lifecycle; the orchestrator only ever holds the [`CommandId`] handle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::secret::VersionId;

/// Tag-based descriptor of the target host set
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FleetSelector {
    pub tag_key: String,
    pub tag_value: String,
}

impl FleetSelector {
    pub fn new(tag_key: impl Into<String>, tag_value: impl Into<String>) -> Self {
        Self {
            tag_key: tag_key.into(),
            tag_value: tag_value.into(),
        }
    }

    pub fn matches(&self, tags: &HashMap<String, String>) -> bool {
        tags.get(&self.tag_key).is_some_and(|value| value == &self.tag_value)
    }
}

impl fmt::Display for FleetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag:{}={}", self.tag_key, self.tag_value)
    }
}

/// Key operation pushed to every host of a selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum KeyAction {
    /// Append `public_key` tagged with `version`; re-adding is a no-op
    AddKey { version: VersionId, public_key: String },
    /// Remove every key tagged with `version`
    RemoveKey { version: VersionId },
}

impl KeyAction {
    pub fn version(&self) -> &VersionId {
        match self {
            KeyAction::AddKey { version, .. } | KeyAction::RemoveKey { version } => version,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KeyAction::AddKey { .. } => "add_key",
            KeyAction::RemoveKey { .. } => "remove_key",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(pub Uuid);

impl CommandId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum TargetOutcome {
    Success,
    Failed(String),
}

/// Result of a command on one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetResult {
    pub address: String,
    pub outcome: TargetOutcome,
    pub finished_at: DateTime<Utc>,
}

/// Per-target failure carried in rotation errors for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFailure {
    pub address: String,
    pub reason: String,
}

impl fmt::Display for TargetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.address, self.reason)
    }
}

/// Status snapshot of an issued command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandStatus {
    pub command_id: CommandId,
    pub state: CommandState,
    pub targets: Vec<TargetResult>,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        self.state != CommandState::Pending
    }

    pub fn failures(&self) -> Vec<TargetFailure> {
        self.targets
            .iter()
            .filter_map(|target| match &target.outcome {
                TargetOutcome::Failed(reason) => Some(TargetFailure {
                    address: target.address.clone(),
                    reason: reason.clone(),
                }),
                TargetOutcome::Success => None,
            })
            .collect()
    }
}

/// One outstanding fleet-wide key operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationCommand {
    pub id: CommandId,
    pub selector: FleetSelector,
    pub action: KeyAction,
    pub issued_at: DateTime<Utc>,
    /// Addresses resolved from the selector at issue time
    pub targets: Vec<String>,
    pub results: Vec<TargetResult>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RotationCommand {
    pub fn new(selector: FleetSelector, action: KeyAction, targets: Vec<String>) -> Self {
        let mut command = Self {
            id: CommandId::new(),
            selector,
            action,
            issued_at: Utc::now(),
            targets,
            results: Vec::new(),
            completed_at: None,
        };
        if command.targets.is_empty() {
            command.completed_at = Some(command.issued_at);
        }
        command
    }

    pub fn record(&mut self, result: TargetResult) {
        self.results.push(result);
        if self.results.len() >= self.targets.len() && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }

    pub fn status(&self) -> CommandStatus {
        let state = if self.completed_at.is_none() {
            CommandState::Pending
        } else if self
            .results
            .iter()
            .all(|r| r.outcome == TargetOutcome::Success)
        {
            CommandState::Success
        } else {
            CommandState::Failed
        };

        CommandStatus {
            command_id: self.id,
            state,
            targets: self.results.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Command {command_id} did not complete within {waited:?}")]
    Timeout { command_id: CommandId, waited: Duration },

    #[error("Unknown command: {0}")]
    UnknownCommand(CommandId),

    #[error("Invalid fleet request: {0}")]
    InvalidRequest(String),

    #[error("Fleet inventory error: {0}")]
    Inventory(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),
}

/// Issues key commands to a fleet and reports their completion
#[async_trait]
pub trait FleetCommandDispatcher: Send + Sync {
    /// Start `action` on every host matching `selector`
    async fn issue(&self, selector: &FleetSelector, action: KeyAction) -> Result<CommandId, FleetError>;

    /// Suspend until the command is terminal; bounded by the dispatcher's timeout
    async fn await_completion(&self, command_id: &CommandId) -> Result<CommandStatus, FleetError>;

    /// Addresses currently reachable for `selector`, queried fresh on every call
    async fn resolve_addresses(
        &self,
        selector: &FleetSelector,
        version: &VersionId,
    ) -> Result<Vec<String>, FleetError>;
}
