// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0
//! # Update Manifests & Rollout Phases
//!
//! Domain model for the update path: the signed [`UpdateManifest`] fetched
//! from a release channel, the total-orderable [`Version`] it announces, the
//! [`UpdatePhase`] machine one apply attempt moves through, and the
//! [`ArtifactSource`]/[`ArtifactStore`] traits the rollout controller drives
//! (infrastructure implementations in [`crate::infrastructure`]).
//!
//! ## Invariants
//!
//! - A manifest missing `id`, `version`, `sha256`, or `url` is rejected
//!   before any network or disk action.
//! - `rollout.end_time > rollout.start_time`; `batch_percent` is 0–100.
//! - Phases advance monotonically; `RolledBack` is reachable only at or
//!   after `BackedUp`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Release channel an agent subscribes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateChannel {
    #[default]
    Stable,
    Beta,
    Nightly,
}

impl std::fmt::Display for UpdateChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stable => "stable",
            Self::Beta => "beta",
            Self::Nightly => "nightly",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for UpdateChannel {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stable" => Ok(Self::Stable),
            "beta" => Ok(Self::Beta),
            "nightly" => Ok(Self::Nightly),
            other => Err(ManifestError::UnknownChannel(other.to_string())),
        }
    }
}

/// Total-orderable release version: dotted numeric segments with an optional
/// pre-release tag (`1.4.0`, `2.0.0-beta.1`). Segments compare numerically
/// with zero-extension; a pre-release sorts before its release, pre-release
/// tags compare lexicographically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    segments: Vec<u64>,
    pre_release: Option<String>,
}

impl Version {
    pub fn parse(s: &str) -> Result<Self, ManifestError> {
        let (numeric, pre_release) = match s.split_once('-') {
            Some((head, tail)) if !tail.is_empty() => (head, Some(tail.to_string())),
            Some(_) => return Err(ManifestError::MalformedVersion(s.to_string())),
            None => (s, None),
        };
        if numeric.is_empty() {
            return Err(ManifestError::MalformedVersion(s.to_string()));
        }
        let segments = numeric
            .split('.')
            .map(|seg| seg.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ManifestError::MalformedVersion(s.to_string()))?;
        Ok(Self { segments, pre_release })
    }
}

impl std::str::FromStr for Version {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let numeric = self
            .segments
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(".");
        match &self.pre_release {
            Some(pre) => write!(f, "{numeric}-{pre}"),
            None => write!(f, "{numeric}"),
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let len = self.segments.len().max(other.segments.len());
        for i in 0..len {
            let a = self.segments.get(i).copied().unwrap_or(0);
            let b = other.segments.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                std::cmp::Ordering::Equal => continue,
                other => return other,
            }
        }
        // Same numeric release: a pre-release precedes the release proper.
        match (&self.pre_release, &other.pre_release) {
            (None, None) => std::cmp::Ordering::Equal,
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Staged rollout gate: when `staged`, only agents whose deterministic
/// bucket falls below `batch_percent` receive the update, and only within
/// `[start_time, end_time]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutWindow {
    #[serde(default)]
    pub staged: bool,
    #[serde(default = "default_batch_percent")]
    pub batch_percent: u8,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

fn default_batch_percent() -> u8 {
    100
}

/// A release announcement fetched from the update endpoint (JSON or YAML).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateManifest {
    pub id: String,
    pub version: Version,
    #[serde(default)]
    pub channel: UpdateChannel,
    /// Expected hex SHA-256 of the release artifact.
    pub sha256: String,
    pub url: String,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub downgrade_allowed: bool,
    pub rollout: RolloutWindow,
    /// Detached base64 Ed25519 signature over [`UpdateManifest::canonical_bytes`],
    /// produced by the channel's release key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Manifest validation failures. All are terminal: a manifest that fails
/// validation is never retried and never touches the network or disk.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("manifest field `{0}` is missing or empty")]
    MissingField(&'static str),

    #[error("manifest sha256 is not a 64-char hex digest")]
    MalformedSha256,

    #[error("malformed version string `{0}`")]
    MalformedVersion(String),

    #[error("unknown release channel `{0}`")]
    UnknownChannel(String),

    #[error("rollout batch_percent {0} out of range (0-100)")]
    BatchPercentOutOfRange(u8),

    #[error("rollout window is empty: end_time must be after start_time")]
    EmptyRolloutWindow,
}

impl UpdateManifest {
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.id.is_empty() {
            return Err(ManifestError::MissingField("id"));
        }
        if self.url.is_empty() {
            return Err(ManifestError::MissingField("url"));
        }
        if self.sha256.len() != 64 || !self.sha256.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ManifestError::MalformedSha256);
        }
        if self.rollout.batch_percent > 100 {
            return Err(ManifestError::BatchPercentOutOfRange(self.rollout.batch_percent));
        }
        if self.rollout.end_time <= self.rollout.start_time {
            return Err(ManifestError::EmptyRolloutWindow);
        }
        Ok(())
    }

    /// Deterministic byte serialization the release key signs: fields in
    /// fixed order, strings length-prefixed (u32 BE), booleans one byte,
    /// timestamps as RFC 3339 strings. The `signature` field itself is
    /// excluded.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        fn put_str(out: &mut Vec<u8>, s: &str) {
            out.extend_from_slice(&(s.len() as u32).to_be_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        let mut out = Vec::new();
        put_str(&mut out, &self.id);
        put_str(&mut out, &self.version.to_string());
        put_str(&mut out, &self.channel.to_string());
        put_str(&mut out, &self.sha256);
        put_str(&mut out, &self.url);
        out.push(u8::from(self.mandatory));
        out.push(u8::from(self.downgrade_allowed));
        out.push(u8::from(self.rollout.staged));
        out.push(self.rollout.batch_percent);
        put_str(&mut out, &self.rollout.start_time.to_rfc3339());
        put_str(&mut out, &self.rollout.end_time.to_rfc3339());
        out
    }
}

/// Phase of one update attempt. Monotonic; see module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    Fetched,
    SignatureVerified,
    BackedUp,
    Downloaded,
    Installed,
    IntegrityVerified,
    Committed,
    RolledBack,
}

impl std::fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Fetched => "fetched",
            Self::SignatureVerified => "signature_verified",
            Self::BackedUp => "backed_up",
            Self::Downloaded => "downloaded",
            Self::Installed => "installed",
            Self::IntegrityVerified => "integrity_verified",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        };
        write!(f, "{name}")
    }
}

/// Failures while talking to the release endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("release endpoint returned status {0}")]
    Status(u16),

    #[error("manifest body could not be decoded: {0}")]
    Decode(String),
}

impl ArtifactError {
    /// Transient failures are eligible for retry under the failure policy;
    /// decode failures and client errors are terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status(code) => *code >= 500,
            Self::Decode(_) => false,
        }
    }
}

/// Fetch of manifests and release artifacts over the network.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn fetch_manifest(&self, url: &str) -> Result<UpdateManifest, ArtifactError>;
    async fn fetch_artifact(&self, url: &str) -> Result<Vec<u8>, ArtifactError>;
}

/// Handle to one backup snapshot. `previous` is `None` when nothing was
/// installed before the attempt (first install); restoring such a handle
/// removes the installed artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupHandle {
    pub id: Uuid,
    pub previous: Option<PathBuf>,
    pub taken_at: DateTime<Utc>,
}

/// Failures in the local artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("io failure: {0}")]
    Io(String),

    #[error("a backup is already in progress")]
    BackupInProgress,

    #[error("no staged artifact to promote")]
    NoStagedArtifact,

    #[error("no installed artifact")]
    NothingInstalled,
}

/// Local install/staging/backup area for the release artifact.
///
/// At most one backup may be in progress at a time; `snapshot` takes the
/// slot, `restore`/`discard` release it. The rollout controller relies on
/// that exclusivity so a new attempt cannot start mid-backup.
pub trait ArtifactStore: Send + Sync {
    /// Snapshot the currently installed artifact before any destructive step.
    fn snapshot(&self) -> Result<BackupHandle, StoreError>;

    /// Restore the snapshot, replacing whatever is currently installed.
    fn restore(&self, handle: &BackupHandle) -> Result<(), StoreError>;

    /// Drop the snapshot after a committed update.
    fn discard(&self, handle: BackupHandle) -> Result<(), StoreError>;

    /// Write downloaded bytes to the staging area.
    fn stage(&self, bytes: &[u8]) -> Result<PathBuf, StoreError>;

    /// Move the staged artifact into the install location.
    fn promote(&self) -> Result<(), StoreError>;

    /// Recompute the hex SHA-256 of the installed artifact.
    fn installed_sha256(&self) -> Result<String, StoreError>;
}
