// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # OpenSSH Remote Executor
//!
//! Implements [`RemoteExecutor`] by spawning the system `ssh` client. The
//! private key never touches a shared location: it is written to a
//! per-session temp file readable only by the current user and removed when
//! the session ends.
//!
//! ## Exit classification
//! | ssh exit | stderr | Result |
//! |----------|--------|--------|
//! | 0 | - | `Ok(RemoteOutput)` |
//! | 255 | `Permission denied` | `AuthenticationFailed` |
//! | 255 | anything else | `Unreachable` |
//! | other | - | `RemoteCommandFailed` |

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::debug;

use crate::domain::remote::{RemoteError, RemoteExecutor, RemoteOutput};
use crate::domain::rotator_config::SshConfig;

/// ssh reserves 255 for its own (connection / auth) errors
const SSH_CLIENT_ERROR: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub program: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub strict_host_key_checking: String,
    pub known_hosts_path: Option<PathBuf>,
    /// Hard bound on one session, connection included
    pub session_timeout: Duration,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self::from_config(&SshConfig::default())
    }
}

impl SshSettings {
    pub fn from_config(config: &SshConfig) -> Self {
        Self {
            program: config.program.clone(),
            port: config.port,
            connect_timeout: config.connect_timeout,
            strict_host_key_checking: config.strict_host_key_checking.clone(),
            known_hosts_path: config.known_hosts_path.clone(),
            session_timeout: Duration::from_secs(300),
        }
    }
}

pub struct OpenSshExecutor {
    settings: SshSettings,
}

impl OpenSshExecutor {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    fn build_args(&self, address: &str, username: &str, key_path: &Path, command: &str) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            key_path.display().to_string(),
            "-p".to_string(),
            self.settings.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.settings.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            format!("StrictHostKeyChecking={}", self.settings.strict_host_key_checking),
        ];
        if let Some(known_hosts) = &self.settings.known_hosts_path {
            args.push("-o".to_string());
            args.push(format!("UserKnownHostsFile={}", known_hosts.display()));
        }
        args.extend([
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-l".to_string(),
            username.to_string(),
            address.to_string(),
            command.to_string(),
        ]);
        args
    }
}

fn write_identity(private_key: &str) -> Result<tempfile::NamedTempFile, RemoteError> {
    let mut file = tempfile::Builder::new()
        .prefix("sshrotate-id-")
        .tempfile()
        .map_err(|e| RemoteError::Transport(format!("Failed to create identity file: {}", e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(|e| RemoteError::Transport(format!("Failed to restrict identity file: {}", e)))?;
    }

    let mut contents = private_key.to_string();
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    file.write_all(contents.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| RemoteError::Transport(format!("Failed to write identity file: {}", e)))?;
    Ok(file)
}

/// Map an ssh client exit into the remote error taxonomy
fn classify(
    address: &str,
    username: &str,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
) -> Result<RemoteOutput, RemoteError> {
    match exit_code {
        Some(0) => Ok(RemoteOutput {
            stdout,
            stderr,
            exit_code: 0,
        }),
        Some(SSH_CLIENT_ERROR) if stderr.contains("Permission denied") => {
            Err(RemoteError::AuthenticationFailed {
                address: address.to_string(),
                username: username.to_string(),
                detail: stderr.trim().to_string(),
            })
        }
        Some(SSH_CLIENT_ERROR) => Err(RemoteError::Unreachable {
            address: address.to_string(),
            detail: stderr.trim().to_string(),
        }),
        Some(code) => Err(RemoteError::RemoteCommandFailed {
            address: address.to_string(),
            exit_code: code,
            stderr: stderr.trim().to_string(),
        }),
        None => Err(RemoteError::Transport(format!(
            "ssh to {} terminated by signal",
            address
        ))),
    }
}

#[async_trait]
impl RemoteExecutor for OpenSshExecutor {
    async fn run(
        &self,
        address: &str,
        username: &str,
        private_key: &str,
        command: &str,
    ) -> Result<RemoteOutput, RemoteError> {
        if address.is_empty() || address.starts_with('-') {
            return Err(RemoteError::Transport(format!("Invalid host address '{}'", address)));
        }
        if username.is_empty() || username.starts_with('-') {
            return Err(RemoteError::Transport(format!("Invalid username '{}'", username)));
        }

        // Removed on drop, after the child has exited
        let identity = write_identity(private_key)?;
        let args = self.build_args(address, username, identity.path(), command);

        debug!("Running ssh session to {}@{}", username, address);
        let mut cmd = tokio::process::Command::new(&self.settings.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.settings.session_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(RemoteError::Transport(format!(
                    "Failed to spawn {}: {}",
                    self.settings.program, e
                )))
            }
            Err(_) => return Err(RemoteError::Timeout(address.to_string())),
        };

        classify(
            address,
            username,
            output.status.code(),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_enforce_key_only_batch_auth() {
        let executor = OpenSshExecutor::new(SshSettings {
            known_hosts_path: Some(PathBuf::from("/tmp/known_hosts")),
            ..SshSettings::default()
        });
        let args = executor.build_args("10.0.0.5", "ec2-user", Path::new("/tmp/id"), "hostname");

        assert_eq!(&args[..2], &["-i", "/tmp/id"]);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"IdentitiesOnly=yes".to_string()));
        assert!(args.contains(&"UserKnownHostsFile=/tmp/known_hosts".to_string()));
        assert_eq!(&args[args.len() - 4..], &["-l", "ec2-user", "10.0.0.5", "hostname"]);
    }

    #[test]
    fn test_exit_classification() {
        let auth = classify(
            "h",
            "u",
            Some(255),
            String::new(),
            "u@h: Permission denied (publickey).".to_string(),
        );
        assert!(matches!(auth, Err(RemoteError::AuthenticationFailed { .. })));

        let unreachable = classify(
            "h",
            "u",
            Some(255),
            String::new(),
            "ssh: connect to host h port 22: Connection refused".to_string(),
        );
        assert!(matches!(unreachable, Err(RemoteError::Unreachable { .. })));

        let failed = classify("h", "u", Some(2), String::new(), "boom".to_string());
        assert!(matches!(
            failed,
            Err(RemoteError::RemoteCommandFailed { exit_code: 2, .. })
        ));

        let ok = classify("h", "u", Some(0), "h\n".to_string(), String::new()).unwrap();
        assert_eq!(ok.stdout, "h\n");
    }

    #[cfg(unix)]
    fn fake_ssh(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-ssh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_passes_command_and_removes_identity() {
        let dir = tempfile::TempDir::new().unwrap();
        // Echo the identity path (arg 2) and the remote command (last arg)
        let program = fake_ssh(dir.path(), "for last; do :; done\necho \"$2 $last\"");
        let executor = OpenSshExecutor::new(SshSettings {
            program,
            ..SshSettings::default()
        });

        let output = executor
            .run("10.0.0.5", "ec2-user", "PRIVATE", "hostname")
            .await
            .unwrap();
        let mut fields = output.stdout.split_whitespace();
        let identity = fields.next().unwrap();
        assert_eq!(fields.next(), Some("hostname"));
        assert!(!Path::new(identity).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reports_rejected_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let program = fake_ssh(
            dir.path(),
            "echo 'ec2-user@10.0.0.5: Permission denied (publickey).' >&2\nexit 255",
        );
        let executor = OpenSshExecutor::new(SshSettings {
            program,
            ..SshSettings::default()
        });

        let err = executor
            .run("10.0.0.5", "ec2-user", "PRIVATE", "hostname")
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::AuthenticationFailed { .. }));
    }

    #[tokio::test]
    async fn test_rejects_option_like_addresses() {
        let executor = OpenSshExecutor::new(SshSettings::default());
        let err = executor
            .run("-oProxyCommand=x", "ec2-user", "PRIVATE", "hostname")
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Transport(_)));
    }
}
