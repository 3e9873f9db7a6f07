// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0
//! # Node Configuration
//!
//! Per-agent settings loaded from a YAML file (or an external config
//! service — either way read-only to this core). The dispatch router and
//! failure policy engine consume these as admission-control inputs; nothing
//! in the core mutates them.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::domain::identity::AgentId;
use crate::domain::policy::RetryPolicy;
use crate::domain::update::UpdateChannel;

/// Resource and autonomy limits for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentLimits {
    /// Maximum task requests allowed to sit in the agent's mailbox.
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    /// 0 (fully supervised) to 100 (fully autonomous).
    #[serde(default = "default_autonomy_level")]
    pub autonomy_level: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_millis: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(default = "default_true")]
    pub sandboxed: bool,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_tasks: default_max_tasks(),
            autonomy_level: default_autonomy_level(),
            cpu_millis: None,
            memory_bytes: None,
            sandboxed: true,
        }
    }
}

/// Health beacon producer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconConfig {
    #[serde(default = "default_beacon_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Where beacons are POSTed. `None` disables emission (the beacon is
    /// still constructible in-process).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink_url: Option<String>,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self { interval: default_beacon_interval(), sink_url: None }
    }
}

/// Update path locations and trust anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSettings {
    /// Release endpoint polled for manifests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_url: Option<String>,
    #[serde(default = "default_install_path")]
    pub install_path: PathBuf,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    /// Hex Ed25519 public key that release manifests must be signed with.
    /// When unset, manifest signatures are not checked (artifact hashes
    /// always are).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_key: Option<String>,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            manifest_url: None,
            install_path: default_install_path(),
            staging_dir: default_staging_dir(),
            backup_dir: default_backup_dir(),
            release_key: None,
        }
    }
}

/// Root configuration for one mesh node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub agent_id: AgentId,
    #[serde(default)]
    pub channel: UpdateChannel,
    #[serde(default)]
    pub limits: AgentLimits,
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub beacon: BeaconConfig,
    #[serde(default)]
    pub update: UpdateSettings,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let raw = std::fs::read_to_string(&path)
            .map_err(|source| ConfigError::Read { path, source })?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_id.as_str().is_empty() {
            return Err(ConfigError::Invalid("agent_id must not be empty".into()));
        }
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::Invalid("mailbox_capacity must be positive".into()));
        }
        if self.limits.max_tasks == 0 {
            return Err(ConfigError::Invalid("limits.max_tasks must be positive".into()));
        }
        if self.limits.autonomy_level > 100 {
            return Err(ConfigError::Invalid(format!(
                "limits.autonomy_level {} out of range (0-100)",
                self.limits.autonomy_level
            )));
        }
        if self.beacon.interval.is_zero() {
            return Err(ConfigError::Invalid("beacon.interval must be positive".into()));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_max_tasks() -> usize {
    8
}
fn default_autonomy_level() -> u8 {
    50
}
fn default_mailbox_capacity() -> usize {
    256
}
fn default_beacon_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_install_path() -> PathBuf {
    PathBuf::from("/var/lib/kindlink/agent.bin")
}
fn default_staging_dir() -> PathBuf {
    PathBuf::from("/var/lib/kindlink/staging")
}
fn default_backup_dir() -> PathBuf {
    PathBuf::from("/var/lib/kindlink/backups")
}
