// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0
//! # Filesystem Artifact Store
//!
//! Local [`ArtifactStore`] implementation: one installed artifact file, a
//! staging directory for downloads in flight, and a backup directory holding
//! at most one snapshot at a time. Suitable for single-node agents; a
//! clustered deployment would put the backup area on shared storage.
//!
//! The one-backup-at-a-time slot is load-bearing: the rollout controller
//! relies on `snapshot` failing with [`StoreError::BackupInProgress`] when a
//! previous attempt has not released its backup, so two update attempts can
//! never interleave their destructive steps.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use crate::domain::update::{ArtifactStore, BackupHandle, StoreError};
use crate::infrastructure::fetcher::sha256_hex;

pub struct FsArtifactStore {
    install_path: PathBuf,
    staging_dir: PathBuf,
    backup_dir: PathBuf,
    backup_in_progress: AtomicBool,
}

impl FsArtifactStore {
    /// Create the store, making sure the staging/backup directories exist
    /// and are writable.
    pub fn new(
        install_path: impl Into<PathBuf>,
        staging_dir: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        let install_path = install_path.into();
        let staging_dir = staging_dir.into();
        let backup_dir = backup_dir.into();

        for dir in [&staging_dir, &backup_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                StoreError::Io(format!("failed to create directory {}: {e}", dir.display()))
            })?;
            Self::check_writable(dir)?;
        }
        if let Some(parent) = install_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Io(format!("failed to create directory {}: {e}", parent.display()))
            })?;
        }

        Ok(Self {
            install_path,
            staging_dir,
            backup_dir,
            backup_in_progress: AtomicBool::new(false),
        })
    }

    fn check_writable(dir: &Path) -> Result<(), StoreError> {
        let probe = dir.join(".kindlink-store-probe");
        std::fs::write(&probe, b"probe")
            .map_err(|e| StoreError::Io(format!("{} is not writable: {e}", dir.display())))?;
        std::fs::remove_file(&probe)
            .map_err(|e| StoreError::Io(format!("failed to remove probe file: {e}")))?;
        Ok(())
    }

    fn staged_path(&self) -> PathBuf {
        self.staging_dir.join("artifact.partial")
    }

    fn release_slot(&self) {
        self.backup_in_progress.store(false, Ordering::SeqCst);
    }
}

impl ArtifactStore for FsArtifactStore {
    fn snapshot(&self) -> Result<BackupHandle, StoreError> {
        if self.backup_in_progress.swap(true, Ordering::SeqCst) {
            return Err(StoreError::BackupInProgress);
        }

        let id = Uuid::new_v4();
        let result = if self.install_path.exists() {
            let dest = self.backup_dir.join(format!("{id}.bak"));
            std::fs::copy(&self.install_path, &dest)
                .map(|_| BackupHandle { id, previous: Some(dest), taken_at: Utc::now() })
                .map_err(|e| StoreError::Io(format!("backup copy failed: {e}")))
        } else {
            // First install: nothing to snapshot, restore will remove the artifact.
            Ok(BackupHandle { id, previous: None, taken_at: Utc::now() })
        };

        if result.is_err() {
            self.release_slot();
        }
        result
    }

    fn restore(&self, handle: &BackupHandle) -> Result<(), StoreError> {
        let result = match &handle.previous {
            Some(backup) => std::fs::copy(backup, &self.install_path)
                .map(|_| ())
                .map_err(|e| StoreError::Io(format!("restore copy failed: {e}"))),
            None => {
                if self.install_path.exists() {
                    std::fs::remove_file(&self.install_path)
                        .map_err(|e| StoreError::Io(format!("restore removal failed: {e}")))
                } else {
                    Ok(())
                }
            }
        };
        if result.is_ok() {
            if let Some(backup) = &handle.previous {
                let _ = std::fs::remove_file(backup);
            }
            self.release_slot();
        }
        result
    }

    fn discard(&self, handle: BackupHandle) -> Result<(), StoreError> {
        if let Some(backup) = &handle.previous {
            std::fs::remove_file(backup)
                .map_err(|e| StoreError::Io(format!("failed to discard backup: {e}")))?;
        }
        self.release_slot();
        Ok(())
    }

    fn stage(&self, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let staged = self.staged_path();
        std::fs::write(&staged, bytes)
            .map_err(|e| StoreError::Io(format!("failed to stage artifact: {e}")))?;
        Ok(staged)
    }

    fn promote(&self) -> Result<(), StoreError> {
        let staged = self.staged_path();
        if !staged.exists() {
            return Err(StoreError::NoStagedArtifact);
        }
        std::fs::copy(&staged, &self.install_path)
            .map_err(|e| StoreError::Io(format!("install copy failed: {e}")))?;
        std::fs::remove_file(&staged)
            .map_err(|e| StoreError::Io(format!("failed to clear staging: {e}")))?;
        Ok(())
    }

    fn installed_sha256(&self) -> Result<String, StoreError> {
        let bytes = std::fs::read(&self.install_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NothingInstalled
            } else {
                StoreError::Io(e.to_string())
            }
        })?;
        Ok(sha256_hex(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(root: &TempDir) -> FsArtifactStore {
        FsArtifactStore::new(
            root.path().join("agent.bin"),
            root.path().join("staging"),
            root.path().join("backups"),
        )
        .unwrap()
    }

    #[test]
    fn test_stage_promote_hash() {
        let root = TempDir::new().unwrap();
        let s = store(&root);

        s.stage(b"v2 bytes").unwrap();
        s.promote().unwrap();
        assert_eq!(s.installed_sha256().unwrap(), sha256_hex(b"v2 bytes"));
        assert!(!s.staged_path().exists());
    }

    #[test]
    fn test_promote_without_stage_fails() {
        let root = TempDir::new().unwrap();
        let s = store(&root);
        assert_eq!(s.promote().unwrap_err(), StoreError::NoStagedArtifact);
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let root = TempDir::new().unwrap();
        let s = store(&root);

        s.stage(b"v1").unwrap();
        s.promote().unwrap();
        let handle = s.snapshot().unwrap();

        s.stage(b"v2 broken").unwrap();
        s.promote().unwrap();
        assert_eq!(s.installed_sha256().unwrap(), sha256_hex(b"v2 broken"));

        s.restore(&handle).unwrap();
        assert_eq!(s.installed_sha256().unwrap(), sha256_hex(b"v1"));
    }

    #[test]
    fn test_first_install_snapshot_restores_to_nothing() {
        let root = TempDir::new().unwrap();
        let s = store(&root);

        let handle = s.snapshot().unwrap();
        assert!(handle.previous.is_none());

        s.stage(b"v1").unwrap();
        s.promote().unwrap();
        s.restore(&handle).unwrap();
        assert_eq!(s.installed_sha256().unwrap_err(), StoreError::NothingInstalled);
    }

    #[test]
    fn test_single_backup_slot() {
        let root = TempDir::new().unwrap();
        let s = store(&root);

        s.stage(b"v1").unwrap();
        s.promote().unwrap();

        let handle = s.snapshot().unwrap();
        assert_eq!(s.snapshot().unwrap_err(), StoreError::BackupInProgress);

        s.discard(handle).unwrap();
        let handle = s.snapshot().unwrap();
        s.discard(handle).unwrap();
    }

    #[test]
    fn test_discard_removes_backup_file() {
        let root = TempDir::new().unwrap();
        let s = store(&root);

        s.stage(b"v1").unwrap();
        s.promote().unwrap();
        let handle = s.snapshot().unwrap();
        let backup_path = handle.previous.clone().unwrap();
        assert!(backup_path.exists());

        s.discard(handle).unwrap();
        assert!(!backup_path.exists());
    }
}
