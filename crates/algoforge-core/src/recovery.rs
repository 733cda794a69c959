// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Raw store file recovery for corrupted stores.
//!
//! Operator tool: run it while the service is stopped. It replaces the store
//! file with the newest raw copy it can find and removes the WAL sidecars of
//! the damaged file, which would otherwise be replayed onto the copy.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};

use crate::backup::{FILE_PREFIX, FINAL_FILE, LATEST_FILE, content_hash};
use crate::destination::{BackupDestination, DestinationKind};
use crate::error::{Result, StoreError};
use crate::provider::sqlite::wal_path;

/// A raw copy written over the store file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredFile {
    /// Destination the copy came from.
    pub kind: DestinationKind,
    /// Object name of the copy.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Hex SHA-256 of the copy.
    pub content_hash: String,
}

/// Replace `target` with the newest raw store copy.
///
/// Looks for `latest.db` then the newest `db-backup-*.db` on the remote
/// destination, then the newest `db-backup-*.db` or `final-backup.db` in the
/// local directory. Returns `None` when no copy exists; `target` is left
/// alone in that case.
#[instrument(skip(remote, local), fields(target = %target.display()))]
pub async fn recover_store_file(
    remote: Option<&dyn BackupDestination>,
    local: &dyn BackupDestination,
    target: &Path,
) -> Result<Option<RecoveredFile>> {
    let mut found = None;
    if let Some(remote) = remote {
        found = newest_raw_copy(remote, true).await;
    }
    if found.is_none() {
        found = newest_raw_copy(local, false).await;
    }

    let Some((kind, name, data)) = found else {
        warn!("No raw store copy found in any destination");
        return Ok(None);
    };

    write_atomically(target, &data).await?;
    for sidecar in [wal_path(target), shm_path(target)] {
        match tokio::fs::remove_file(&sidecar).await {
            Ok(()) => info!(path = %sidecar.display(), "Removed stale sidecar file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io("remove_sidecar", format!("{}: {e}", sidecar.display()))),
        }
    }

    let recovered = RecoveredFile {
        kind,
        size: data.len() as u64,
        content_hash: content_hash(&data),
        name,
    };
    info!(
        source = %recovered.kind,
        name = %recovered.name,
        size = recovered.size,
        content_hash = %recovered.content_hash,
        "Store file recovered from raw copy"
    );
    Ok(Some(recovered))
}

async fn newest_raw_copy(
    dest: &dyn BackupDestination,
    prefer_latest: bool,
) -> Option<(DestinationKind, String, Vec<u8>)> {
    let mut names = Vec::new();
    if prefer_latest {
        names.push(LATEST_FILE.to_string());
    }
    match dest.list(FILE_PREFIX).await {
        Ok(objects) => {
            let mut timestamped: Vec<String> = objects
                .into_iter()
                .map(|o| o.name)
                .filter(|n| n.ends_with(".db"))
                .collect();
            timestamped.sort();
            names.extend(timestamped.into_iter().rev());
        }
        Err(e) => warn!(destination = %dest.kind(), error = %e, "Failed to list raw copies"),
    }
    names.push(FINAL_FILE.to_string());

    for name in names {
        match dest.get(&name).await {
            Ok(Some(data)) if !data.is_empty() => return Some((dest.kind(), name, data)),
            Ok(_) => {}
            Err(e) => warn!(destination = %dest.kind(), name = %name, error = %e, "Failed to read raw copy"),
        }
    }
    None
}

async fn write_atomically(target: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io("create_dir", format!("{}: {e}", parent.display())))?;
    }

    let mut staging = target.as_os_str().to_owned();
    staging.push(".recover");
    let staging = PathBuf::from(staging);

    tokio::fs::write(&staging, data)
        .await
        .map_err(|e| StoreError::io("write", format!("{}: {e}", staging.display())))?;
    tokio::fs::rename(&staging, target)
        .await
        .map_err(|e| StoreError::io("rename", format!("{}: {e}", target.display())))?;
    Ok(())
}

fn shm_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push("-shm");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::LocalDirDestination;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_picks_newest_local_copy_and_clears_sidecars() {
        let dir = TempDir::new().unwrap();
        let local = LocalDirDestination::new(dir.path().join("backups"));
        local
            .put("db-backup-20250101-000000.db", b"old", "application/octet-stream")
            .await
            .unwrap();
        local
            .put("db-backup-20250102-000000.db", b"new", "application/octet-stream")
            .await
            .unwrap();

        let target = dir.path().join("store.db");
        tokio::fs::write(&target, b"garbage").await.unwrap();
        tokio::fs::write(wal_path(&target), b"stale").await.unwrap();

        let recovered = recover_store_file(None, &local, &target).await.unwrap().unwrap();
        assert_eq!(recovered.name, "db-backup-20250102-000000.db");
        assert_eq!(recovered.kind, DestinationKind::LocalFallback);
        assert_eq!(recovered.content_hash, content_hash(b"new"));
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"new");
        assert!(!wal_path(&target).exists());
    }

    #[tokio::test]
    async fn test_no_copy_leaves_target_alone() {
        let dir = TempDir::new().unwrap();
        let local = LocalDirDestination::new(dir.path().join("backups"));
        let target = dir.path().join("store.db");
        tokio::fs::write(&target, b"keep").await.unwrap();

        assert!(recover_store_file(None, &local, &target).await.unwrap().is_none());
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"keep");
    }

    #[tokio::test]
    async fn test_final_copy_used_as_last_resort() {
        let dir = TempDir::new().unwrap();
        let local = LocalDirDestination::new(dir.path().join("backups"));
        local
            .put(FINAL_FILE, b"final", "application/octet-stream")
            .await
            .unwrap();

        let target = dir.path().join("nested").join("store.db");
        let recovered = recover_store_file(None, &local, &target).await.unwrap().unwrap();
        assert_eq!(recovered.name, FINAL_FILE);
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"final");
    }
}
