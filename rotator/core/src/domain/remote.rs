// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Authentication failed for {username}@{address}: {detail}")]
    AuthenticationFailed {
        address: String,
        username: String,
        detail: String,
    },
    #[error("Remote command failed on {address} (exit {exit_code}): {stderr}")]
    RemoteCommandFailed {
        address: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("Host unreachable: {address}: {detail}")]
    Unreachable { address: String, detail: String },
    #[error("Session timed out on {0}")]
    Timeout(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Opens a session to `address` authenticated with `private_key` and runs one command
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(
        &self,
        address: &str,
        username: &str,
        private_key: &str,
        command: &str,
    ) -> Result<RemoteOutput, RemoteError>;
}
