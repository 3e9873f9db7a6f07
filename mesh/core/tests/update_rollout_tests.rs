// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

//! Update rollout integration tests: a mock release endpoint, a real
//! filesystem artifact store, and the full phase machine including rollback
//! and manifest signature verification.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use kindlink_core::application::updater::{RolloutController, UpdateError};
use kindlink_core::domain::identity::AgentId;
use kindlink_core::domain::node_config::UpdateSettings;
use kindlink_core::domain::update::{
    ArtifactStore, BackupHandle, RolloutWindow, StoreError, UpdateChannel, UpdateManifest,
    UpdatePhase, Version,
};
use kindlink_core::infrastructure::artifact_store::FsArtifactStore;
use kindlink_core::infrastructure::event_bus::EventBus;
use kindlink_core::infrastructure::fetcher::{sha256_hex, HttpArtifactSource};
use kindlink_core::infrastructure::signing::Keypair;
use tempfile::TempDir;

const V1_BYTES: &[u8] = b"agent binary v1.3.0";
const V2_BYTES: &[u8] = b"agent binary v1.4.0";

struct Fixture {
    _root: TempDir,
    install_path: PathBuf,
    store: Arc<FsArtifactStore>,
    settings: UpdateSettings,
}

fn fixture() -> Fixture {
    let root = TempDir::new().unwrap();
    let install_path = root.path().join("agent.bin");
    let settings = UpdateSettings {
        manifest_url: None,
        install_path: install_path.clone(),
        staging_dir: root.path().join("staging"),
        backup_dir: root.path().join("backups"),
        release_key: None,
    };
    let store = Arc::new(
        FsArtifactStore::new(&settings.install_path, &settings.staging_dir, &settings.backup_dir)
            .unwrap(),
    );
    // Seed the currently installed version.
    store.stage(V1_BYTES).unwrap();
    store.promote().unwrap();
    Fixture { _root: root, install_path, store, settings }
}

fn manifest(artifact_url: &str, sha256: String) -> UpdateManifest {
    let now = Utc::now();
    UpdateManifest {
        id: "rel-140".into(),
        version: Version::parse("1.4.0").unwrap(),
        channel: UpdateChannel::Stable,
        sha256,
        url: artifact_url.to_string(),
        mandatory: false,
        downgrade_allowed: false,
        rollout: RolloutWindow {
            staged: false,
            batch_percent: 100,
            start_time: now - Duration::hours(1),
            end_time: now + Duration::hours(1),
        },
        signature: None,
    }
}

fn controller(fixture: &Fixture, settings: UpdateSettings) -> RolloutController {
    RolloutController::new(
        AgentId::from("worker-eu-3"),
        UpdateChannel::Stable,
        settings,
        Arc::new(HttpArtifactSource::new()),
        fixture.store.clone(),
        EventBus::new(256),
    )
    .unwrap()
}

fn current_version() -> Version {
    Version::parse("1.3.0").unwrap()
}

#[tokio::test]
async fn test_apply_commits_and_discards_backup() {
    let mut server = mockito::Server::new_async().await;
    let _artifact = server
        .mock("GET", "/1.4.0.bin")
        .with_status(200)
        .with_body(V2_BYTES)
        .create_async()
        .await;

    let fx = fixture();
    let ctrl = controller(&fx, fx.settings.clone());
    let m = manifest(&format!("{}/1.4.0.bin", server.url()), sha256_hex(V2_BYTES));

    let report = ctrl.apply(&m, &current_version()).await.unwrap();
    assert_eq!(report.new_version, Version::parse("1.4.0").unwrap());
    assert_eq!(report.previous_version, current_version());

    assert_eq!(std::fs::read(&fx.install_path).unwrap(), V2_BYTES);
    // Backup discarded on commit.
    let leftovers: Vec<_> = std::fs::read_dir(&fx.settings.backup_dir).unwrap().collect();
    assert!(leftovers.is_empty());
    // The backup slot is free for the next attempt.
    let handle = fx.store.snapshot().unwrap();
    fx.store.discard(handle).unwrap();
}

#[tokio::test]
async fn test_corrupted_download_rolls_back() {
    let mut server = mockito::Server::new_async().await;
    let _artifact = server
        .mock("GET", "/1.4.0.bin")
        .with_status(200)
        .with_body(&b"tampered artifact"[..])
        .create_async()
        .await;

    let fx = fixture();
    let ctrl = controller(&fx, fx.settings.clone());
    let m = manifest(&format!("{}/1.4.0.bin", server.url()), sha256_hex(V2_BYTES));

    let err = ctrl.apply(&m, &current_version()).await.unwrap_err();
    assert!(matches!(err, UpdateError::Failed { phase: UpdatePhase::Downloaded, .. }));
    // Atomicity: the installed artifact is exactly the pre-attempt one.
    assert_eq!(std::fs::read(&fx.install_path).unwrap(), V1_BYTES);
}

#[tokio::test]
async fn test_download_failure_rolls_back_and_is_reportable() {
    let mut server = mockito::Server::new_async().await;
    let _artifact = server
        .mock("GET", "/1.4.0.bin")
        .with_status(500)
        .create_async()
        .await;

    let fx = fixture();
    let ctrl = controller(&fx, fx.settings.clone());
    let m = manifest(&format!("{}/1.4.0.bin", server.url()), sha256_hex(V2_BYTES));

    let err = ctrl.apply(&m, &current_version()).await.unwrap_err();
    assert!(matches!(err, UpdateError::Failed { phase: UpdatePhase::Downloaded, .. }));
    assert_eq!(std::fs::read(&fx.install_path).unwrap(), V1_BYTES);
}

/// Store wrapper whose install step corrupts the artifact, so the
/// post-install integrity check is the one that trips.
struct CorruptingStore {
    inner: Arc<FsArtifactStore>,
    install_path: PathBuf,
}

impl ArtifactStore for CorruptingStore {
    fn snapshot(&self) -> Result<BackupHandle, StoreError> {
        self.inner.snapshot()
    }
    fn restore(&self, handle: &BackupHandle) -> Result<(), StoreError> {
        self.inner.restore(handle)
    }
    fn discard(&self, handle: BackupHandle) -> Result<(), StoreError> {
        self.inner.discard(handle)
    }
    fn stage(&self, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        self.inner.stage(bytes)
    }
    fn promote(&self) -> Result<(), StoreError> {
        self.inner.promote()?;
        std::fs::write(&self.install_path, b"bitrot during install")
            .map_err(|e| StoreError::Io(e.to_string()))
    }
    fn installed_sha256(&self) -> Result<String, StoreError> {
        self.inner.installed_sha256()
    }
}

#[tokio::test]
async fn test_post_install_integrity_failure_restores_previous_version() {
    let mut server = mockito::Server::new_async().await;
    let _artifact = server
        .mock("GET", "/1.4.0.bin")
        .with_status(200)
        .with_body(V2_BYTES)
        .create_async()
        .await;

    let fx = fixture();
    let store = Arc::new(CorruptingStore {
        inner: fx.store.clone(),
        install_path: fx.install_path.clone(),
    });
    let ctrl = RolloutController::new(
        AgentId::from("worker-eu-3"),
        UpdateChannel::Stable,
        fx.settings.clone(),
        Arc::new(HttpArtifactSource::new()),
        store,
        EventBus::new(256),
    )
    .unwrap();
    let m = manifest(&format!("{}/1.4.0.bin", server.url()), sha256_hex(V2_BYTES));

    let err = ctrl.apply(&m, &current_version()).await.unwrap_err();
    assert!(matches!(err, UpdateError::Failed { phase: UpdatePhase::IntegrityVerified, .. }));
    assert_eq!(std::fs::read(&fx.install_path).unwrap(), V1_BYTES);
}

#[tokio::test]
async fn test_signed_manifest_is_enforced_when_key_configured() {
    let mut server = mockito::Server::new_async().await;
    let artifact = server
        .mock("GET", "/1.4.0.bin")
        .with_status(200)
        .with_body(V2_BYTES)
        .expect(1)
        .create_async()
        .await;

    let release_keys = Keypair::generate();
    let fx = fixture();
    let mut settings = fx.settings.clone();
    settings.release_key = Some(release_keys.public_key_hex());
    let ctrl = controller(&fx, settings);

    let mut m = manifest(&format!("{}/1.4.0.bin", server.url()), sha256_hex(V2_BYTES));

    // Unsigned manifest: rejected before any download or backup.
    let err = ctrl.apply(&m, &current_version()).await.unwrap_err();
    assert!(matches!(err, UpdateError::SignatureInvalid(_)));

    // Properly signed manifest: applies.
    use base64::Engine as _;
    let signature = release_keys.sign(&m.canonical_bytes());
    m.signature = Some(base64::engine::general_purpose::STANDARD.encode(signature));
    ctrl.apply(&m, &current_version()).await.unwrap();
    assert_eq!(std::fs::read(&fx.install_path).unwrap(), V2_BYTES);

    // A tampered field invalidates the signature.
    m.mandatory = true;
    let err = ctrl.apply(&m, &Version::parse("1.3.9").unwrap()).await.unwrap_err();
    assert!(matches!(err, UpdateError::SignatureInvalid(_)));

    artifact.assert_async().await;
}

#[tokio::test]
async fn test_cancel_is_honored_only_before_backup() {
    let mut server = mockito::Server::new_async().await;
    let artifact = server
        .mock("GET", "/1.4.0.bin")
        .with_status(200)
        .with_body(V2_BYTES)
        .expect(0)
        .create_async()
        .await;

    let fx = fixture();
    let ctrl = controller(&fx, fx.settings.clone());
    let m = manifest(&format!("{}/1.4.0.bin", server.url()), sha256_hex(V2_BYTES));

    ctrl.request_cancel();
    let err = ctrl.apply(&m, &current_version()).await.unwrap_err();
    assert!(matches!(err, UpdateError::Cancelled));
    // Nothing was downloaded, nothing changed.
    artifact.assert_async().await;
    assert_eq!(std::fs::read(&fx.install_path).unwrap(), V1_BYTES);
}

#[tokio::test]
async fn test_fetch_and_apply_respects_deferral_and_mandatory() {
    let mut server = mockito::Server::new_async().await;
    let artifact_url = format!("{}/1.4.0.bin", server.url());

    let mut deferred_manifest = manifest(&artifact_url, sha256_hex(V2_BYTES));
    let _manifest_mock = server
        .mock("GET", "/manifest.json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(serde_json::to_string(&deferred_manifest).unwrap())
        .create_async()
        .await;
    let _artifact = server
        .mock("GET", "/1.4.0.bin")
        .with_status(200)
        .with_body(V2_BYTES)
        .create_async()
        .await;

    let fx = fixture();
    let mut settings = fx.settings.clone();
    settings.manifest_url = Some(format!("{}/manifest.json", server.url()));
    let ctrl = controller(&fx, settings.clone());

    // Deferred non-mandatory update: nothing happens.
    let outcome = ctrl.fetch_and_apply(&current_version(), true).await.unwrap();
    assert!(outcome.is_none());
    assert_eq!(std::fs::read(&fx.install_path).unwrap(), V1_BYTES);

    // The same manifest marked mandatory overrides the deferral.
    deferred_manifest.mandatory = true;
    let _manifest_mock = server
        .mock("GET", "/manifest.json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(serde_json::to_string(&deferred_manifest).unwrap())
        .create_async()
        .await;

    let report = ctrl.fetch_and_apply(&current_version(), true).await.unwrap().unwrap();
    assert_eq!(report.new_version, Version::parse("1.4.0").unwrap());
    assert_eq!(std::fs::read(&fx.install_path).unwrap(), V2_BYTES);
}

#[tokio::test]
async fn test_not_eligible_is_a_clean_no_op() {
    let mut server = mockito::Server::new_async().await;
    // Beta manifest while the agent subscribes to stable.
    let mut m = manifest("https://releases.kind.example/x.bin", sha256_hex(V2_BYTES));
    m.channel = UpdateChannel::Beta;
    let _manifest_mock = server
        .mock("GET", "/manifest.json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(serde_json::to_string(&m).unwrap())
        .create_async()
        .await;

    let fx = fixture();
    let mut settings = fx.settings.clone();
    settings.manifest_url = Some(format!("{}/manifest.json", server.url()));
    let ctrl = controller(&fx, settings);

    let outcome = ctrl.fetch_and_apply(&current_version(), false).await.unwrap();
    assert!(outcome.is_none());
    assert_eq!(std::fs::read(&fx.install_path).unwrap(), V1_BYTES);
}
