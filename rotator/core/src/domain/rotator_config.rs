// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Rotator Configuration Types
//
// Defines the configuration schema for an sshrotate deployment:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Rotation settings (remote username, verification command, bounds)
// - Fleet selector, static inventory and management identity
// - SSH client options
// - Secret store location and logging

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::fleet::FleetSelector;

pub const API_VERSION: &str = "sshrotate.io/v1";
pub const KIND: &str = "RotatorConfig";

/// Top-level Kubernetes-style configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotatorConfigManifest {
    /// API version (must be "sshrotate.io/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "RotatorConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: RotatorConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotatorConfigSpec {
    #[serde(default)]
    pub rotation: RotationConfig,

    #[serde(default)]
    pub fleet: FleetConfig,

    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Remote login user whose authorized_keys holds the rotated key
    #[serde(default)]
    pub username: String,

    /// Command run on every host during testSecret
    #[serde(default = "default_verification_command")]
    pub verification_command: String,

    /// Upper bound for one fleet command to reach a terminal status
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Upper bound for a single host's SSH verification
    #[serde(default = "default_verification_timeout", with = "humantime_serde")]
    pub verification_timeout: Duration,

    /// Width of the per-target worker pool
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Let testSecret pass when the selector resolves to no hosts
    #[serde(default)]
    pub allow_empty_fleet: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            verification_command: default_verification_command(),
            command_timeout: default_command_timeout(),
            verification_timeout: default_verification_timeout(),
            max_concurrency: default_max_concurrency(),
            allow_empty_fleet: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub selector: FleetSelector,

    /// First completion poll delay; doubles up to `max_poll_interval`
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(default = "default_max_poll_interval", with = "humantime_serde")]
    pub max_poll_interval: Duration,

    /// Identity used to push and remove keys on hosts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub management: Option<ManagementConfig>,

    /// Absolute authorized_keys path on hosts (default: $HOME/.ssh/authorized_keys)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorized_keys_path: Option<String>,

    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            selector: FleetSelector::new("", ""),
            poll_interval: default_poll_interval(),
            max_poll_interval: default_max_poll_interval(),
            management: None,
            authorized_keys_path: None,
            hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementConfig {
    /// Login user for key management sessions (default: rotation username)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Path to the management private key (OpenSSH format)
    pub private_key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub address: String,

    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// ssh client binary
    #[serde(default = "default_ssh_program")]
    pub program: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Value for `-o StrictHostKeyChecking=`
    #[serde(default = "default_strict_host_key_checking")]
    pub strict_host_key_checking: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: default_ssh_program(),
            port: default_ssh_port(),
            connect_timeout: default_connect_timeout(),
            strict_host_key_checking: default_strict_host_key_checking(),
            known_hosts_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON document backing the file secret store
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_verification_command() -> String {
    "hostname".to_string()
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_verification_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_concurrency() -> usize {
    16
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_max_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_strict_host_key_checking() -> String {
    "accept-new".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./sshrotate-secrets.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for RotatorConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "sshrotate".to_string(),
                labels: None,
            },
            spec: RotatorConfigSpec::default(),
        }
    }
}

impl RotatorConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. SSHROTATE_CONFIG_PATH environment variable
    /// 2. ./sshrotate.yaml (working directory)
    /// 3. ~/.sshrotate/config.yaml (user home)
    /// 4. /etc/sshrotate/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("SSHROTATE_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./sshrotate.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".sshrotate").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/sshrotate/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing/invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("SSHROTATE_USERNAME") {
            tracing::info!("Environment override: SSHROTATE_USERNAME={}", val);
            self.spec.rotation.username = val;
        }
        if let Some(val) = lookup("SSHROTATE_TAG_NAME") {
            tracing::info!("Environment override: SSHROTATE_TAG_NAME={}", val);
            self.spec.fleet.selector.tag_key = val;
        }
        if let Some(val) = lookup("SSHROTATE_TAG_VALUE") {
            tracing::info!("Environment override: SSHROTATE_TAG_VALUE={}", val);
            self.spec.fleet.selector.tag_value = val;
        }
        if let Some(val) = lookup("SSHROTATE_STORE_PATH") {
            tracing::info!("Environment override: SSHROTATE_STORE_PATH={}", val);
            self.spec.store.path = PathBuf::from(val);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        let rotation = &self.spec.rotation;
        if rotation.username.trim().is_empty() {
            anyhow::bail!("spec.rotation.username cannot be empty");
        }
        if rotation.verification_command.trim().is_empty() {
            anyhow::bail!("spec.rotation.verification_command cannot be empty");
        }
        if rotation.max_concurrency == 0 {
            anyhow::bail!("spec.rotation.max_concurrency must be at least 1");
        }
        if rotation.command_timeout.is_zero() || rotation.verification_timeout.is_zero() {
            anyhow::bail!("spec.rotation timeouts must be greater than zero");
        }

        let fleet = &self.spec.fleet;
        if fleet.selector.tag_key.is_empty() || fleet.selector.tag_value.is_empty() {
            anyhow::bail!("spec.fleet.selector requires both tag_key and tag_value");
        }
        if fleet.poll_interval.is_zero() {
            anyhow::bail!("spec.fleet.poll_interval must be greater than zero");
        }
        if fleet.max_poll_interval < fleet.poll_interval {
            anyhow::bail!("spec.fleet.max_poll_interval must not be shorter than poll_interval");
        }
        for host in &fleet.hosts {
            if host.address.trim().is_empty() {
                anyhow::bail!("spec.fleet.hosts entries require an address");
            }
        }
        if let Some(path) = &fleet.authorized_keys_path {
            if !path.starts_with('/') {
                anyhow::bail!("spec.fleet.authorized_keys_path must be absolute: {}", path);
            }
        }

        Ok(())
    }

    /// Hosts in the static inventory matching the configured selector
    pub fn targeted_hosts(&self) -> impl Iterator<Item = &HostConfig> {
        self.spec
            .fleet
            .hosts
            .iter()
            .filter(|host| self.spec.fleet.selector.matches(&host.tags))
    }
}
