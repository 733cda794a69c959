// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup publishing.
//!
//! Each run produces two artifacts from the same instant:
//!
//! | Artifact           | Remote names                            | Local fallback names            |
//! |--------------------|-----------------------------------------|---------------------------------|
//! | Snapshot document  | `backup-<ts>.json`, `latest.json`       | `backup-<ts>.json`, `latest.json` |
//! | Raw store copy     | `db-backup-<ts>.db`, `latest.db`        | `db-backup-<ts>.db`             |
//!
//! The remote destination is always tried first; any failure there sends the
//! artifact to the local directory instead. After every run old timestamped
//! artifacts are pruned in the background. `latest.*` and `final-backup.db`
//! are never pruned.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::RetentionPolicy;
use crate::destination::{BackupDestination, DestinationKind};
use crate::error::{Result, StoreError};
use crate::provider::SqliteProvider;
use crate::snapshot::SnapshotSerializer;

/// Well-known name of the newest snapshot document.
pub const LATEST_SNAPSHOT: &str = "latest.json";
/// Well-known name of the newest raw store copy.
pub const LATEST_FILE: &str = "latest.db";
/// One-off raw copy written at shutdown.
pub const FINAL_FILE: &str = "final-backup.db";
/// Prefix of timestamped snapshot documents.
pub const SNAPSHOT_PREFIX: &str = "backup-";
/// Prefix of timestamped raw store copies.
pub const FILE_PREFIX: &str = "db-backup-";

const JSON_CONTENT_TYPE: &str = "application/json";
const FILE_CONTENT_TYPE: &str = "application/octet-stream";

/// `YYYYMMDD-HHMMSS`, sorts chronologically as a string.
pub fn backup_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d-%H%M%S").to_string()
}

/// Name of the timestamped snapshot document.
pub fn snapshot_name(timestamp: &str) -> String {
    format!("{SNAPSHOT_PREFIX}{timestamp}.json")
}

/// Name of the timestamped raw store copy.
pub fn file_name(timestamp: &str) -> String {
    format!("{FILE_PREFIX}{timestamp}.db")
}

/// Hex SHA-256 of `data`.
pub fn content_hash(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

fn is_prunable(name: &str) -> bool {
    !matches!(name, LATEST_SNAPSHOT | LATEST_FILE | FINAL_FILE)
}

/// Provenance of one published artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    /// Which destination received it.
    pub kind: DestinationKind,
    /// Where it was written.
    pub path: String,
    /// When the run started.
    pub timestamp: DateTime<Utc>,
    /// Hex SHA-256 of the content.
    pub content_hash: String,
}

/// Result of one publish run.
#[derive(Debug, Clone, Default)]
pub struct PublishOutcome {
    /// Ledger version captured by the snapshot.
    pub version: i64,
    /// Snapshot document reached the remote destination.
    pub published_remote: bool,
    /// Snapshot document was written to the local fallback.
    pub published_local: bool,
    /// Raw copy reached the remote destination.
    pub file_published_remote: bool,
    /// Raw copy was written to the local fallback.
    pub file_published_local: bool,
    /// Every artifact written by the run.
    pub records: Vec<BackupRecord>,
}

/// Objects removed by one prune pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Remote snapshot documents deleted.
    pub remote_snapshots: usize,
    /// Remote raw copies deleted.
    pub remote_files: usize,
    /// Local snapshot documents deleted.
    pub local_snapshots: usize,
    /// Local raw copies deleted.
    pub local_files: usize,
}

/// Publishes snapshots and raw copies to the remote and local destinations.
pub struct BackupPublisher {
    provider: Arc<SqliteProvider>,
    serializer: SnapshotSerializer,
    remote: Option<Arc<dyn BackupDestination>>,
    local: Arc<dyn BackupDestination>,
    retention: RetentionPolicy,
    run_lock: Mutex<()>,
    prune_task: Mutex<Option<JoinHandle<PruneReport>>>,
}

impl std::fmt::Debug for BackupPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupPublisher")
            .field("remote", &self.remote.is_some())
            .field("retention", &self.retention)
            .finish()
    }
}

impl BackupPublisher {
    /// Publisher for the store behind `provider`.
    pub fn new(
        provider: Arc<SqliteProvider>,
        remote: Option<Arc<dyn BackupDestination>>,
        local: Arc<dyn BackupDestination>,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            serializer: SnapshotSerializer::new(provider.pool().clone()),
            provider,
            remote,
            local,
            retention,
            run_lock: Mutex::new(()),
            prune_task: Mutex::new(None),
        }
    }

    /// Publish one snapshot document and one raw copy, then prune in the
    /// background.
    ///
    /// Destination failures are absorbed: the outcome flags say where each
    /// artifact ended up. Only a failure to read the store is an error.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<PublishOutcome> {
        let _run = self.run_lock.lock().await;

        let started_at = Utc::now();
        let timestamp = backup_timestamp(started_at);

        let snapshot = self.serializer.serialize().await?;
        let document = snapshot.encode()?;
        let document_hash = content_hash(&document);

        let mut outcome = PublishOutcome {
            version: snapshot.metadata.version,
            ..PublishOutcome::default()
        };

        let document_name = snapshot_name(&timestamp);
        match self
            .publish(
                &[document_name.as_str(), LATEST_SNAPSHOT],
                &[document_name.as_str(), LATEST_SNAPSHOT],
                &document,
                JSON_CONTENT_TYPE,
            )
            .await
        {
            Some(dest) => {
                match dest.kind() {
                    DestinationKind::RemotePrimary => outcome.published_remote = true,
                    DestinationKind::LocalFallback => outcome.published_local = true,
                }
                outcome.records.push(BackupRecord {
                    kind: dest.kind(),
                    path: dest.location(&document_name),
                    timestamp: started_at,
                    content_hash: document_hash,
                });
            }
            None => error!("Snapshot document could not be written to any destination"),
        }

        match self.copy_store_file().await {
            Ok(file) => {
                let name = file_name(&timestamp);
                match self
                    .publish(
                        &[name.as_str(), LATEST_FILE],
                        &[name.as_str()],
                        &file,
                        FILE_CONTENT_TYPE,
                    )
                    .await
                {
                    Some(dest) => {
                        match dest.kind() {
                            DestinationKind::RemotePrimary => outcome.file_published_remote = true,
                            DestinationKind::LocalFallback => outcome.file_published_local = true,
                        }
                        outcome.records.push(BackupRecord {
                            kind: dest.kind(),
                            path: dest.location(&name),
                            timestamp: started_at,
                            content_hash: content_hash(&file),
                        });
                    }
                    None => error!("Raw store copy could not be written to any destination"),
                }
            }
            Err(e) => warn!(error = %e, "Failed to produce raw store copy"),
        }

        self.spawn_prune().await;

        info!(
            version = outcome.version,
            published_remote = outcome.published_remote,
            published_local = outcome.published_local,
            file_published_remote = outcome.file_published_remote,
            file_published_local = outcome.file_published_local,
            "Backup run complete"
        );
        Ok(outcome)
    }

    /// Write the one-off shutdown copy `final-backup.db`.
    #[instrument(skip(self))]
    pub async fn publish_final_file(&self) -> Result<Option<BackupRecord>> {
        let _run = self.run_lock.lock().await;

        let file = self.copy_store_file().await?;
        let record = self
            .publish(&[FINAL_FILE], &[FINAL_FILE], &file, FILE_CONTENT_TYPE)
            .await
            .map(|dest| BackupRecord {
                kind: dest.kind(),
                path: dest.location(FINAL_FILE),
                timestamp: Utc::now(),
                content_hash: content_hash(&file),
            });

        if let Some(record) = &record {
            info!(path = %record.path, "Final store copy written");
        }
        Ok(record)
    }

    /// Delete timestamped artifacts beyond the retention counts.
    ///
    /// Listing or deletion failures are logged and skipped.
    #[instrument(skip(self))]
    pub async fn prune(&self) -> PruneReport {
        prune_all(self.remote.clone(), self.local.clone(), self.retention).await
    }

    /// Wait for the most recent background prune, if one is running.
    pub async fn wait_for_prune(&self) -> Option<PruneReport> {
        let handle = self.prune_task.lock().await.take()?;
        match handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "Prune task ended abnormally");
                None
            }
        }
    }

    async fn spawn_prune(&self) {
        let handle = tokio::spawn(prune_all(
            self.remote.clone(),
            self.local.clone(),
            self.retention,
        ));
        let previous = self.prune_task.lock().await.replace(handle);
        if let Some(previous) = previous
            && !previous.is_finished()
        {
            debug!("Previous prune still running");
        }
    }

    /// Try the remote destination, then the local one. Returns the
    /// destination that accepted every name, if any.
    async fn publish(
        &self,
        remote_names: &[&str],
        local_names: &[&str],
        data: &[u8],
        content_type: &str,
    ) -> Option<Arc<dyn BackupDestination>> {
        if let Some(remote) = &self.remote {
            match put_all(remote.as_ref(), remote_names, data, content_type).await {
                Ok(()) => return Some(remote.clone()),
                Err(e) => warn!(
                    error = %e,
                    name = remote_names[0],
                    "Remote backup failed, falling back to local"
                ),
            }
        }

        match put_all(self.local.as_ref(), local_names, data, content_type).await {
            Ok(()) => Some(self.local.clone()),
            Err(e) => {
                error!(error = %e, name = local_names[0], "Local backup failed");
                None
            }
        }
    }

    /// Consistent copy of the store file, read into memory.
    async fn copy_store_file(&self) -> Result<Vec<u8>> {
        let dir = self
            .provider
            .path()
            .parent()
            .map(PathBuf::from)
            .unwrap_or_default();
        let staging = dir.join(format!(".copy-{}.db", uuid::Uuid::new_v4()));

        let result = async {
            self.provider.vacuum_into(&staging).await?;
            Ok::<_, StoreError>(tokio::fs::read(&staging).await?)
        }
        .await;

        if let Err(e) = tokio::fs::remove_file(&staging).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(error = %e, path = %staging.display(), "Failed to remove staging copy");
        }
        result
    }
}

async fn put_all(
    dest: &dyn BackupDestination,
    names: &[&str],
    data: &[u8],
    content_type: &str,
) -> Result<()> {
    for name in names {
        dest.put(name, data, content_type).await?;
    }
    Ok(())
}

async fn prune_all(
    remote: Option<Arc<dyn BackupDestination>>,
    local: Arc<dyn BackupDestination>,
    retention: RetentionPolicy,
) -> PruneReport {
    let mut report = PruneReport::default();

    if let Some(remote) = remote {
        report.remote_snapshots =
            prune_kind(remote.as_ref(), SNAPSHOT_PREFIX, ".json", retention.remote_snapshots).await;
        report.remote_files =
            prune_kind(remote.as_ref(), FILE_PREFIX, ".db", retention.remote_files).await;
    }
    report.local_snapshots =
        prune_kind(local.as_ref(), SNAPSHOT_PREFIX, ".json", retention.local_snapshots).await;
    report.local_files = prune_kind(local.as_ref(), FILE_PREFIX, ".db", retention.local_files).await;

    debug!(?report, "Prune pass complete");
    report
}

/// Keep the newest `keep` objects named `<prefix>...<suffix>`, delete the rest.
async fn prune_kind(dest: &dyn BackupDestination, prefix: &str, suffix: &str, keep: usize) -> usize {
    let objects = match dest.list(prefix).await {
        Ok(objects) => objects,
        Err(e) => {
            warn!(destination = %dest.kind(), error = %e, "Failed to list backups for pruning");
            return 0;
        }
    };

    let mut names: Vec<String> = objects
        .into_iter()
        .map(|o| o.name)
        .filter(|name| name.ends_with(suffix) && is_prunable(name))
        .collect();
    if names.len() <= keep {
        return 0;
    }

    // Timestamps sort chronologically, oldest first.
    names.sort();
    let excess = names.len() - keep;

    let mut deleted = 0;
    for name in &names[..excess] {
        match dest.delete(name).await {
            Ok(()) => {
                deleted += 1;
                debug!(destination = %dest.kind(), name = %name, "Pruned old backup");
            }
            Err(e) => warn!(destination = %dest.kind(), name = %name, error = %e, "Failed to prune backup"),
        }
    }
    deleted
}

/// Background worker that runs [`BackupPublisher::run_once`] on an interval.
pub struct BackupScheduler {
    publisher: Arc<BackupPublisher>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl BackupScheduler {
    /// Scheduler publishing every `interval`.
    pub fn new(publisher: Arc<BackupPublisher>, interval: Duration) -> Self {
        Self {
            publisher,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle used to stop [`BackupScheduler::run`].
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until the shutdown handle is notified.
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs(), "Backup scheduler started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Backup scheduler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.publisher.run_once().await {
                        error!(error = %e, "Scheduled backup failed");
                    }
                }
            }
        }

        info!("Backup scheduler stopped");
    }
}
