// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0
//! # Update Verifier & Rollout Controller
//!
//! Owns one update attempt at a time and drives it through
//!
//! ```text
//! Fetched → SignatureVerified → BackedUp → Downloaded → Installed
//!         → IntegrityVerified → Committed
//! ```
//!
//! Any failure at or after `BackedUp` triggers an automatic rollback to the
//! pre-attempt snapshot; the backup is discarded only after the post-install
//! integrity check passes, so the node always has a restorable prior state
//! mid-update. A failed rollback is fatal ([`UpdateError::RollbackFailed`])
//! and is surfaced, never retried. Verification (manifest signature, staged
//! and installed artifact hashes) is never skipped — `mandatory` bypasses
//! user deferral only.
//!
//! Cancellation is honored up to the moment the backup is taken; after that
//! the attempt runs to a terminal state (committed or rolled back).

use chrono::{DateTime, Utc};
use metrics::counter;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::events::UpdateEvent;
use crate::domain::identity::AgentId;
use crate::domain::node_config::UpdateSettings;
use crate::domain::update::{
    ArtifactError, ArtifactSource, ArtifactStore, BackupHandle, ManifestError, UpdateChannel,
    UpdateManifest, UpdatePhase, Version,
};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::signing;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("manifest invalid: {0}")]
    ManifestInvalid(#[from] ManifestError),

    #[error("manifest signature rejected: {0}")]
    SignatureInvalid(String),

    #[error("manifest fetch failed: {0}")]
    Fetch(#[from] ArtifactError),

    #[error("update attempt cancelled before backup")]
    Cancelled,

    #[error("another update attempt is in progress")]
    AttemptInProgress,

    #[error("update failed during {phase}: {reason} (rolled back)")]
    Failed { phase: UpdatePhase, reason: String },

    #[error("update failed during {phase} and rollback also failed: {reason} — manual intervention required")]
    RollbackFailed { phase: UpdatePhase, reason: String },
}

/// Outcome of a committed update.
#[derive(Debug, Clone)]
pub struct UpdateReport {
    pub manifest_id: String,
    pub previous_version: Version,
    pub new_version: Version,
    pub committed_at: DateTime<Utc>,
}

/// Deterministic rollout bucket for an agent: first four big-endian bytes of
/// `sha256(agent_id ":" manifest_id)` reduced mod 100. Stable across calls
/// and across processes, so staged batches select the same population slice
/// every time.
pub fn rollout_bucket(agent_id: &AgentId, manifest_id: &str) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(agent_id.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(manifest_id.as_bytes());
    let digest = hasher.finalize();
    let word = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (word % 100) as u8
}

/// Pure eligibility check (§ the rollout gate). `true` iff:
/// - the manifest's channel matches the subscribed channel,
/// - when staged, `now` falls within the rollout window and the agent's
///   deterministic bucket is below `batch_percent`,
/// - the version moves forward, or backward with `downgrade_allowed`.
pub fn check_eligible(
    manifest: &UpdateManifest,
    agent_id: &AgentId,
    subscribed: UpdateChannel,
    current_version: &Version,
    now: DateTime<Utc>,
) -> bool {
    if manifest.channel != subscribed {
        return false;
    }
    if manifest.rollout.staged {
        if now < manifest.rollout.start_time || now > manifest.rollout.end_time {
            return false;
        }
        if rollout_bucket(agent_id, &manifest.id) >= manifest.rollout.batch_percent {
            return false;
        }
    }
    if manifest.version > *current_version {
        true
    } else if manifest.version < *current_version {
        manifest.downgrade_allowed
    } else {
        false
    }
}

pub struct RolloutController {
    agent_id: AgentId,
    channel: UpdateChannel,
    settings: UpdateSettings,
    source: Arc<dyn ArtifactSource>,
    store: Arc<dyn ArtifactStore>,
    bus: EventBus,
    /// Hex-decoded release public key; when present, manifests must carry a
    /// valid detached signature.
    release_key: Option<Vec<u8>>,
    attempt: Mutex<()>,
    cancel_requested: AtomicBool,
}

impl RolloutController {
    pub fn new(
        agent_id: AgentId,
        channel: UpdateChannel,
        settings: UpdateSettings,
        source: Arc<dyn ArtifactSource>,
        store: Arc<dyn ArtifactStore>,
        bus: EventBus,
    ) -> Result<Self, UpdateError> {
        let release_key = match &settings.release_key {
            Some(hex_key) => Some(
                hex::decode(hex_key)
                    .map_err(|e| UpdateError::SignatureInvalid(format!("bad release key: {e}")))?,
            ),
            None => None,
        };
        Ok(Self {
            agent_id,
            channel,
            settings,
            source,
            store,
            bus,
            release_key,
            attempt: Mutex::new(()),
            cancel_requested: AtomicBool::new(false),
        })
    }

    /// Request cooperative cancellation of the in-flight attempt. Honored
    /// only before the backup is taken.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_eligible(
        &self,
        manifest: &UpdateManifest,
        current_version: &Version,
        now: DateTime<Utc>,
    ) -> bool {
        check_eligible(manifest, &self.agent_id, self.channel, current_version, now)
    }

    /// Poll the configured release endpoint and apply the advertised update
    /// when eligible. Returns `Ok(None)` when there is nothing to do: no
    /// endpoint configured, not eligible, or deferred. `defer` expresses the
    /// user's wish to postpone — `mandatory` manifests override it,
    /// verification is unaffected either way.
    pub async fn fetch_and_apply(
        &self,
        current_version: &Version,
        defer: bool,
    ) -> Result<Option<UpdateReport>, UpdateError> {
        let Some(url) = &self.settings.manifest_url else {
            return Ok(None);
        };
        let manifest = self.source.fetch_manifest(url).await?;
        manifest.validate()?;

        if !self.is_eligible(&manifest, current_version, Utc::now()) {
            info!(manifest_id = %manifest.id, version = %manifest.version, "update not eligible");
            return Ok(None);
        }
        if defer && !manifest.mandatory {
            info!(manifest_id = %manifest.id, "update deferred by user");
            return Ok(None);
        }
        self.apply(&manifest, current_version).await.map(Some)
    }

    /// Apply one manifest. See the module docs for the phase machine and
    /// rollback contract.
    pub async fn apply(
        &self,
        manifest: &UpdateManifest,
        current_version: &Version,
    ) -> Result<UpdateReport, UpdateError> {
        let _attempt = self.attempt.try_lock().map_err(|_| UpdateError::AttemptInProgress)?;
        self.cancel_requested.store(false, Ordering::SeqCst);

        // Validation precedes any network or disk action.
        manifest.validate()?;
        self.bus.publish_update_event(UpdateEvent::UpdateStarted {
            manifest_id: manifest.id.clone(),
            version: manifest.version.clone(),
            started_at: Utc::now(),
        });
        self.phase_reached(manifest, UpdatePhase::Fetched);

        self.verify_manifest_signature(manifest)?;
        self.phase_reached(manifest, UpdatePhase::SignatureVerified);

        if self.cancel_requested.swap(false, Ordering::SeqCst) {
            info!(manifest_id = %manifest.id, "update cancelled before backup");
            return Err(UpdateError::Cancelled);
        }

        // Backup precedes the download: from here on every failure rolls
        // back, and the attempt no longer observes cancellation.
        let backup = self.store.snapshot().map_err(|e| UpdateError::Failed {
            phase: UpdatePhase::BackedUp,
            reason: e.to_string(),
        })?;
        self.phase_reached(manifest, UpdatePhase::BackedUp);

        let report = match self.install_phases(manifest, current_version, &backup).await {
            Ok(report) => report,
            Err((phase, reason)) => {
                warn!(manifest_id = %manifest.id, %phase, "update failed: {reason}; rolling back");
                return Err(self.rollback(manifest, &backup, phase, reason));
            }
        };

        // Commit: only now is the prior state unrecoverable.
        if let Err(e) = self.store.discard(backup) {
            // The update itself is installed and verified; a leaked backup
            // file is worth a warning, not a rollback.
            warn!(manifest_id = %manifest.id, "failed to discard backup: {e}");
        }
        self.phase_reached(manifest, UpdatePhase::Committed);
        self.bus.publish_update_event(UpdateEvent::UpdateCommitted {
            manifest_id: manifest.id.clone(),
            version: manifest.version.clone(),
            committed_at: report.committed_at,
        });
        counter!("klp_updates_committed_total").increment(1);
        info!(manifest_id = %manifest.id, version = %manifest.version, "update committed");
        Ok(report)
    }

    /// Download → stage-verify → install → integrity-verify. Returns the
    /// failing phase and reason instead of an `UpdateError` so `apply` can
    /// pair it with the rollback attempt.
    async fn install_phases(
        &self,
        manifest: &UpdateManifest,
        current_version: &Version,
        _backup: &BackupHandle,
    ) -> Result<UpdateReport, (UpdatePhase, String)> {
        let artifact = self
            .source
            .fetch_artifact(&manifest.url)
            .await
            .map_err(|e| (UpdatePhase::Downloaded, e.to_string()))?;

        // The staged bytes must already match the manifest hash; installing
        // a mismatch would let a corrupted download overwrite good state.
        let staged_hash = hex::encode(Sha256::digest(&artifact));
        if !staged_hash.eq_ignore_ascii_case(&manifest.sha256) {
            return Err((
                UpdatePhase::Downloaded,
                format!("staged artifact hash {staged_hash} != manifest {}", manifest.sha256),
            ));
        }
        self.store
            .stage(&artifact)
            .map_err(|e| (UpdatePhase::Downloaded, e.to_string()))?;
        self.phase_reached(manifest, UpdatePhase::Downloaded);

        self.store
            .promote()
            .map_err(|e| (UpdatePhase::Installed, e.to_string()))?;
        self.phase_reached(manifest, UpdatePhase::Installed);

        // Post-install integrity check: recompute from disk, never trust
        // the in-memory copy.
        let installed_hash = self
            .store
            .installed_sha256()
            .map_err(|e| (UpdatePhase::IntegrityVerified, e.to_string()))?;
        if !installed_hash.eq_ignore_ascii_case(&manifest.sha256) {
            return Err((
                UpdatePhase::IntegrityVerified,
                format!("installed artifact hash {installed_hash} != manifest {}", manifest.sha256),
            ));
        }
        self.phase_reached(manifest, UpdatePhase::IntegrityVerified);

        Ok(UpdateReport {
            manifest_id: manifest.id.clone(),
            previous_version: current_version.clone(),
            new_version: manifest.version.clone(),
            committed_at: Utc::now(),
        })
    }

    fn rollback(
        &self,
        manifest: &UpdateManifest,
        backup: &BackupHandle,
        phase: UpdatePhase,
        reason: String,
    ) -> UpdateError {
        counter!("klp_updates_failed_total").increment(1);
        match self.store.restore(backup) {
            Ok(()) => {
                self.phase_reached(manifest, UpdatePhase::RolledBack);
                self.bus.publish_update_event(UpdateEvent::UpdateRolledBack {
                    manifest_id: manifest.id.clone(),
                    failed_phase: phase,
                    rolled_back_at: Utc::now(),
                });
                UpdateError::Failed { phase, reason }
            }
            Err(restore_err) => UpdateError::RollbackFailed {
                phase,
                reason: format!("{reason}; restore failed: {restore_err}"),
            },
        }
    }

    fn verify_manifest_signature(&self, manifest: &UpdateManifest) -> Result<(), UpdateError> {
        let Some(release_key) = &self.release_key else {
            if manifest.signature.is_some() {
                warn!(manifest_id = %manifest.id, "manifest is signed but no release key is configured; skipping check");
            }
            return Ok(());
        };
        let signature_b64 = manifest
            .signature
            .as_deref()
            .ok_or_else(|| UpdateError::SignatureInvalid("manifest is unsigned".into()))?;
        let signature = {
            use base64::Engine as _;
            base64::engine::general_purpose::STANDARD
                .decode(signature_b64)
                .map_err(|e| UpdateError::SignatureInvalid(format!("bad base64: {e}")))?
        };
        signing::verify_detached(release_key, &manifest.canonical_bytes(), &signature)
            .map_err(|e| UpdateError::SignatureInvalid(e.to_string()))
    }

    fn phase_reached(&self, manifest: &UpdateManifest, phase: UpdatePhase) {
        self.bus.publish_update_event(UpdateEvent::PhaseReached {
            manifest_id: manifest.id.clone(),
            phase,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn manifest(channel: UpdateChannel, staged: bool, batch_percent: u8) -> UpdateManifest {
        let now = Utc::now();
        UpdateManifest {
            id: "rel-1".into(),
            version: Version::parse("1.4.0").unwrap(),
            channel,
            sha256: "a".repeat(64),
            url: "https://releases.kind.example/1.4.0.bin".into(),
            mandatory: false,
            downgrade_allowed: false,
            rollout: crate::domain::update::RolloutWindow {
                staged,
                batch_percent,
                start_time: now - Duration::hours(1),
                end_time: now + Duration::hours(1),
            },
            signature: None,
        }
    }

    #[test]
    fn test_bucket_is_deterministic() {
        let agent = AgentId::from("worker-eu-3");
        let first = rollout_bucket(&agent, "rel-1");
        for _ in 0..100 {
            assert_eq!(rollout_bucket(&agent, "rel-1"), first);
        }
        assert!(first < 100);
    }

    #[test]
    fn test_eligibility_is_stable_across_calls() {
        let m = manifest(UpdateChannel::Stable, true, 50);
        let agent = AgentId::from("worker-eu-3");
        let current = Version::parse("1.3.0").unwrap();
        let now = Utc::now();
        let first = check_eligible(&m, &agent, UpdateChannel::Stable, &current, now);
        for _ in 0..50 {
            assert_eq!(check_eligible(&m, &agent, UpdateChannel::Stable, &current, now), first);
        }
    }

    #[test]
    fn test_channel_mismatch_not_eligible() {
        let m = manifest(UpdateChannel::Beta, false, 100);
        let current = Version::parse("1.0.0").unwrap();
        assert!(!check_eligible(&m, &AgentId::from("a"), UpdateChannel::Stable, &current, Utc::now()));
    }

    #[test]
    fn test_window_is_a_hard_deadline() {
        let m = manifest(UpdateChannel::Stable, true, 100);
        let current = Version::parse("1.0.0").unwrap();
        let agent = AgentId::from("a");
        assert!(check_eligible(&m, &agent, UpdateChannel::Stable, &current, Utc::now()));
        assert!(!check_eligible(
            &m,
            &agent,
            UpdateChannel::Stable,
            &current,
            m.rollout.end_time + Duration::seconds(1)
        ));
        assert!(!check_eligible(
            &m,
            &agent,
            UpdateChannel::Stable,
            &current,
            m.rollout.start_time - Duration::seconds(1)
        ));
    }

    #[test]
    fn test_batch_percent_extremes() {
        let current = Version::parse("1.0.0").unwrap();
        let agent = AgentId::from("worker-1");

        let m = manifest(UpdateChannel::Stable, true, 0);
        assert!(!check_eligible(&m, &agent, UpdateChannel::Stable, &current, Utc::now()));

        let m = manifest(UpdateChannel::Stable, true, 100);
        assert!(check_eligible(&m, &agent, UpdateChannel::Stable, &current, Utc::now()));
    }

    #[test]
    fn test_downgrade_gate() {
        let mut m = manifest(UpdateChannel::Stable, false, 100);
        let current = Version::parse("2.0.0").unwrap();
        let agent = AgentId::from("a");

        assert!(!check_eligible(&m, &agent, UpdateChannel::Stable, &current, Utc::now()));
        m.downgrade_allowed = true;
        assert!(check_eligible(&m, &agent, UpdateChannel::Stable, &current, Utc::now()));
    }

    #[test]
    fn test_same_version_not_eligible() {
        let m = manifest(UpdateChannel::Stable, false, 100);
        let current = Version::parse("1.4.0").unwrap();
        assert!(!check_eligible(&m, &AgentId::from("a"), UpdateChannel::Stable, &current, Utc::now()));
    }
}
