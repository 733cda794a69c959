// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Startup reconciliation.
//!
//! Decides, once per process start, whether the current store or one of the
//! backups holds the newest data, and restores the winner if it is not the
//! current store.
//!
//! ```text
//!                 ┌─────────────────┐
//!                 │ INSPECT_CURRENT │
//!                 └────────┬────────┘
//!          ┌───────────────┼─────────────────────┐
//!          ▼               ▼                     ▼
//!   UNINITIALIZED   HAS_METADATA(0 rows)   HAS_METADATA(n rows)
//!          │               │                     │
//!   any backup?     backup not older?      max(current, remote, local)
//!          │               │                     │
//!          └───────────────┴──────┬──────────────┘
//!                                 ▼
//!                  RESTORE + ledger entry (one tx) ──► verify
//! ```
//!
//! Every phase runs against one deadline. When it passes, the restore
//! transaction is rolled back and startup continues on the untouched store.
//! The only startup-blocking result is a corrupted store with nothing to
//! restore from.
//!
//! The restored rows and the `restore` ledger entry commit in the same
//! transaction. Verification runs after the commit and only reports.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tokio::time::{Instant, timeout_at};
use tracing::{error, info, instrument, warn};

use crate::backup::{LATEST_SNAPSHOT, SNAPSHOT_PREFIX, content_hash};
use crate::destination::{BackupDestination, DestinationKind};
use crate::error::{Result, StoreError};
use crate::ledger::{LedgerState, VersionLedger};
use crate::managed::{MANAGED_TABLES, ManagedTable};
use crate::provider::SqliteProvider;
use crate::retry::RetryPolicy;
use crate::snapshot::Snapshot;

/// A decoded backup that could be restored.
#[derive(Debug, Clone)]
pub struct BackupCandidate {
    /// Destination it was read from.
    pub kind: DestinationKind,
    /// Object name within the destination.
    pub name: String,
    /// Hex SHA-256 of the raw document.
    pub content_hash: String,
    /// The decoded snapshot.
    pub snapshot: Snapshot,
}

impl BackupCandidate {
    /// Reconciliation tuple of the snapshot.
    pub fn state(&self) -> LedgerState {
        self.snapshot.state()
    }
}

/// What INSPECT_CURRENT found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCondition {
    /// The ledger or managed tables do not exist.
    Uninitialized,
    /// The ledger was readable.
    HasMetadata(LedgerState),
    /// The store could not be read.
    Corrupted(String),
}

/// Rows written per table during a restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableRestoreStats {
    /// Table name.
    pub table: String,
    /// Rows inserted.
    pub restored: usize,
    /// Rows skipped because their insert failed.
    pub failed: usize,
}

/// A table whose post-restore count differs from the snapshot's declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountMismatch {
    /// Table name.
    pub table: String,
    /// Count declared by the snapshot.
    pub expected: i64,
    /// Count found after commit.
    pub actual: i64,
}

impl From<&CountMismatch> for StoreError {
    fn from(m: &CountMismatch) -> Self {
        StoreError::Consistency {
            table: m.table.clone(),
            expected: m.expected,
            actual: m.actual,
        }
    }
}

/// Report of a committed restore.
#[derive(Debug, Clone)]
pub struct RestoreSummary {
    /// Destination the snapshot came from.
    pub source: DestinationKind,
    /// Object name of the snapshot.
    pub name: String,
    /// Version now recorded in the ledger.
    pub version: i64,
    /// Record count now recorded in the ledger.
    pub record_count: i64,
    /// Per-table insert results.
    pub tables: Vec<TableRestoreStats>,
    /// Verification failures.
    pub mismatches: Vec<CountMismatch>,
    /// Wall time of the restore.
    pub elapsed: Duration,
}

impl RestoreSummary {
    /// Rows skipped across all tables.
    pub fn failed_rows(&self) -> usize {
        self.tables.iter().map(|t| t.failed).sum()
    }

    /// True when every table matched its declared count.
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Decision taken by [`Reconciler::reconcile`].
#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    /// Never-written store and no backup anywhere: start empty.
    FirstRun,
    /// Initialized but empty store, nothing newer to restore.
    EmptyStore(LedgerState),
    /// The current store is at least as new as every backup.
    CurrentIsNewest(LedgerState),
    /// A backup was restored.
    Restored(RestoreSummary),
    /// The restore failed and was rolled back; the current store is kept.
    RestoreFailed {
        /// Destination of the snapshot that failed.
        source: DestinationKind,
        /// Why it failed.
        reason: String,
    },
    /// The deadline passed; the current store is kept.
    TimedOut {
        /// The deadline that elapsed.
        deadline: Duration,
    },
}

impl ReconcileOutcome {
    /// True when a backup was restored.
    pub fn restored(&self) -> bool {
        matches!(self, Self::Restored(_))
    }
}

/// One-shot startup reconciler.
pub struct Reconciler {
    pool: SqlitePool,
    store_path: PathBuf,
    ledger: Arc<VersionLedger>,
    remote: Option<Arc<dyn BackupDestination>>,
    local: Arc<dyn BackupDestination>,
    maintenance: Arc<RwLock<()>>,
    deadline: Duration,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("store_path", &self.store_path)
            .field("remote", &self.remote.is_some())
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Marker for a phase that ran past the deadline.
struct DeadlineExceeded;

impl Reconciler {
    /// Reconciler for the store behind `provider`.
    pub fn new(
        provider: &SqliteProvider,
        ledger: Arc<VersionLedger>,
        remote: Option<Arc<dyn BackupDestination>>,
        local: Arc<dyn BackupDestination>,
        deadline: Duration,
    ) -> Self {
        Self {
            pool: provider.pool().clone(),
            store_path: provider.path().to_path_buf(),
            ledger,
            remote,
            local,
            maintenance: provider.maintenance_gate(),
            deadline,
            retry: RetryPolicy::default(),
        }
    }

    /// Run the state machine once.
    ///
    /// Returns `Err` only for [`StoreError::Corruption`]: the current store
    /// is unreadable and no backup could be restored.
    #[instrument(skip(self), fields(store = %self.store_path.display()))]
    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        let deadline = Instant::now() + self.deadline;

        let condition = match timeout_at(deadline, self.inspect()).await {
            Ok(condition) => condition,
            Err(_) => return Ok(self.timed_out("inspect")),
        };

        match condition {
            StoreCondition::Uninitialized => {
                info!(phase = "inspect", state = "uninitialized", "Store has no ledger yet");
                let Ok(backup) = self.newest_backup(deadline).await else {
                    return Ok(self.timed_out("compare"));
                };
                match backup {
                    None => {
                        info!(phase = "compare", "No backup found, starting with an empty store");
                        Ok(ReconcileOutcome::FirstRun)
                    }
                    Some(candidate) => Ok(self.restore_absorbing(candidate, deadline).await),
                }
            }

            StoreCondition::HasMetadata(current) if current.record_count == 0 => {
                info!(
                    phase = "inspect",
                    state = "empty",
                    version = current.version,
                    "Store is initialized but empty"
                );
                let Ok(backup) = self.newest_backup(deadline).await else {
                    return Ok(self.timed_out("compare"));
                };
                match backup {
                    Some(candidate) if candidate.state().version >= current.version => {
                        Ok(self.restore_absorbing(candidate, deadline).await)
                    }
                    Some(candidate) => {
                        info!(
                            phase = "compare",
                            current_version = current.version,
                            backup_version = candidate.state().version,
                            "Backup is older than the empty store, keeping current"
                        );
                        Ok(ReconcileOutcome::EmptyStore(current))
                    }
                    None if current.version == 0 => {
                        info!(phase = "compare", "No backup found, starting with an empty store");
                        Ok(ReconcileOutcome::FirstRun)
                    }
                    None => {
                        info!(phase = "compare", "No backup found, keeping empty store");
                        Ok(ReconcileOutcome::EmptyStore(current))
                    }
                }
            }

            StoreCondition::HasMetadata(current) => {
                info!(
                    phase = "inspect",
                    state = "has_metadata",
                    version = current.version,
                    record_count = current.record_count,
                    "Current store inspected"
                );
                let Ok((remote, local)) = self.fetch_candidates(deadline).await else {
                    return Ok(self.timed_out("compare"));
                };

                let mut winner: Option<BackupCandidate> = None;
                let mut best = current;
                for candidate in [remote, local].into_iter().flatten() {
                    if candidate.state().is_newer_than(&best) {
                        best = candidate.state();
                        winner = Some(candidate);
                    }
                }

                match winner {
                    None => {
                        info!(
                            phase = "compare",
                            winner = "current",
                            version = current.version,
                            "Current store is the newest, no restore needed"
                        );
                        Ok(ReconcileOutcome::CurrentIsNewest(current))
                    }
                    Some(candidate) => {
                        info!(
                            phase = "compare",
                            winner = %candidate.kind,
                            current_version = current.version,
                            winner_version = best.version,
                            winner_record_count = best.record_count,
                            "Backup is newer than the current store"
                        );
                        Ok(self.restore_absorbing(candidate, deadline).await)
                    }
                }
            }

            StoreCondition::Corrupted(details) => {
                error!(phase = "inspect", error = %details, "Current store is unreadable");
                let backup = self.newest_backup(deadline).await.ok().flatten();
                let Some(candidate) = backup else {
                    return Err(self.corruption(&details, "no backup was found"));
                };
                match self.restore_absorbing(candidate, deadline).await {
                    outcome @ ReconcileOutcome::Restored(_) => Ok(outcome),
                    _ => Err(self.corruption(&details, "restoring the newest backup did not succeed")),
                }
            }
        }
    }

    /// INSPECT_CURRENT.
    pub async fn inspect(&self) -> StoreCondition {
        match self.retry.run("inspect", || self.ledger.current()).await {
            Ok(state) => StoreCondition::HasMetadata(state),
            Err(StoreError::MissingRelation { .. }) => StoreCondition::Uninitialized,
            Err(e) => StoreCondition::Corrupted(e.to_string()),
        }
    }

    /// Restore `candidate`, bounded by this reconciler's deadline from now.
    ///
    /// Returns `Ok(None)` when the deadline passed; nothing was changed.
    pub async fn restore(&self, candidate: &BackupCandidate) -> Result<Option<RestoreSummary>> {
        let deadline = Instant::now() + self.deadline;
        match self.restore_until(candidate, deadline).await? {
            Ok(summary) => Ok(Some(summary)),
            Err(DeadlineExceeded) => Ok(None),
        }
    }

    async fn restore_absorbing(
        &self,
        candidate: BackupCandidate,
        deadline: Instant,
    ) -> ReconcileOutcome {
        let source = candidate.kind;
        match self.restore_until(&candidate, deadline).await {
            Ok(Ok(summary)) => ReconcileOutcome::Restored(summary),
            Ok(Err(DeadlineExceeded)) => self.timed_out("restore"),
            Err(e) => {
                error!(
                    phase = "restore",
                    source = %source,
                    error = %e,
                    "Restore failed and was rolled back, keeping current store"
                );
                ReconcileOutcome::RestoreFailed {
                    source,
                    reason: e.to_string(),
                }
            }
        }
    }

    #[instrument(skip(self, candidate, deadline), fields(source = %candidate.kind, name = %candidate.name))]
    async fn restore_until(
        &self,
        candidate: &BackupCandidate,
        deadline: Instant,
    ) -> Result<std::result::Result<RestoreSummary, DeadlineExceeded>> {
        let started = Instant::now();
        let snapshot = &candidate.snapshot;

        info!(
            phase = "restore",
            version = snapshot.metadata.version,
            rows = snapshot.total_rows(),
            "Starting restore"
        );

        let Ok(_exclusive) = timeout_at(deadline, self.maintenance.write()).await else {
            return Ok(Err(DeadlineExceeded));
        };

        let mut tx = match timeout_at(deadline, self.pool.begin()).await {
            Ok(tx) => tx?,
            Err(_) => return Ok(Err(DeadlineExceeded)),
        };

        let metadata = &snapshot.metadata;
        let staged = timeout_at(deadline, async {
            let tables = stage_restore(&mut tx, snapshot).await?;
            self.ledger
                .record_restored_in(
                    &mut *tx,
                    metadata.version,
                    metadata.record_count,
                    metadata.last_updated_at,
                )
                .await?;
            Ok::<_, StoreError>(tables)
        })
        .await;
        let tables = match staged {
            Ok(Ok(tables)) if Instant::now() < deadline => tables,
            Ok(Err(e)) => {
                rollback(tx).await;
                return Err(e);
            }
            _ => {
                rollback(tx).await;
                return Ok(Err(DeadlineExceeded));
            }
        };

        tx.commit().await?;

        for stats in &tables {
            info!(
                phase = "restore",
                table = %stats.table,
                restored = stats.restored,
                failed = stats.failed,
                "Table restored"
            );
        }

        // Committed from here on; verification only reports.
        let mismatches = match self.verify(snapshot).await {
            Ok(mismatches) => mismatches,
            Err(e) => {
                warn!(phase = "verify", error = %e, "Could not verify restored tables");
                Vec::new()
            }
        };

        let summary = RestoreSummary {
            source: candidate.kind,
            name: candidate.name.clone(),
            version: snapshot.metadata.version,
            record_count: snapshot.metadata.record_count,
            tables,
            mismatches,
            elapsed: started.elapsed(),
        };

        info!(
            phase = "restore",
            source = %summary.source,
            version = summary.version,
            record_count = summary.record_count,
            failed_rows = summary.failed_rows(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Restore committed"
        );
        Ok(Ok(summary))
    }

    /// Re-count every managed table against the snapshot's declared counts.
    async fn verify(&self, snapshot: &Snapshot) -> Result<Vec<CountMismatch>> {
        let mut mismatches = Vec::new();
        for table in MANAGED_TABLES {
            let sql = format!("SELECT COUNT(*) FROM \"{}\"", table.name);
            let actual: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
            let expected = snapshot.declared_count(table.name);
            if actual != expected {
                let mismatch = CountMismatch {
                    table: table.name.to_string(),
                    expected,
                    actual,
                };
                warn!(phase = "verify", error = %StoreError::from(&mismatch), "Row count mismatch after restore");
                mismatches.push(mismatch);
            }
        }

        if mismatches.is_empty() {
            info!(phase = "verify", "All table counts match the snapshot");
        }
        Ok(mismatches)
    }

    /// Newest of the remote and local backups; ties prefer remote.
    async fn newest_backup(
        &self,
        deadline: Instant,
    ) -> std::result::Result<Option<BackupCandidate>, DeadlineExceeded> {
        let (remote, local) = self.fetch_candidates(deadline).await?;
        Ok(match (remote, local) {
            (Some(r), Some(l)) if l.state().is_newer_than(&r.state()) => Some(l),
            (Some(r), _) => Some(r),
            (None, l) => l,
        })
    }

    async fn fetch_candidates(
        &self,
        deadline: Instant,
    ) -> std::result::Result<(Option<BackupCandidate>, Option<BackupCandidate>), DeadlineExceeded>
    {
        let remote = match &self.remote {
            Some(remote) => timeout_at(deadline, fetch_latest(remote.as_ref()))
                .await
                .map_err(|_| DeadlineExceeded)?,
            None => None,
        };
        let local = timeout_at(deadline, fetch_latest(self.local.as_ref()))
            .await
            .map_err(|_| DeadlineExceeded)?;

        for candidate in [&remote, &local].into_iter().flatten() {
            let state = candidate.state();
            info!(
                phase = "compare",
                source = %candidate.kind,
                name = %candidate.name,
                version = state.version,
                record_count = state.record_count,
                content_hash = %candidate.content_hash,
                "Backup candidate found"
            );
        }
        Ok((remote, local))
    }

    fn timed_out(&self, phase: &'static str) -> ReconcileOutcome {
        let error = StoreError::Timeout {
            operation: format!("reconcile/{phase}"),
            deadline: self.deadline,
        };
        warn!(phase, error = %error, "Keeping current store");
        ReconcileOutcome::TimedOut {
            deadline: self.deadline,
        }
    }

    fn corruption(&self, details: &str, reason: &str) -> StoreError {
        let guidance = format!(
            "{details}; {reason}. To recover: stop the service, move '{}' aside, then either \
             recover a raw copy (latest.db or the newest db-backup-*.db) into its place with \
             recover_store_file, or start again with an empty store",
            self.store_path.display()
        );
        error!(remediation = %guidance, "Cannot start: store is corrupted and unrecoverable");
        StoreError::Corruption { details: guidance }
    }
}

/// Read the newest snapshot a destination holds.
///
/// `latest.json` is preferred. When it is missing, unreadable or does not
/// decode, the timestamped documents are tried newest first. Documents that
/// fail are logged and skipped.
pub async fn fetch_latest(dest: &dyn BackupDestination) -> Option<BackupCandidate> {
    match dest.get(LATEST_SNAPSHOT).await {
        Ok(Some(bytes)) => {
            if let Some(candidate) = decode_candidate(dest, LATEST_SNAPSHOT, &bytes) {
                return Some(candidate);
            }
        }
        Ok(None) => {}
        Err(e) => {
            warn!(phase = "compare", source = %dest.kind(), error = %e, "Failed to read latest backup");
        }
    }

    let mut names: Vec<String> = match dest.list(SNAPSHOT_PREFIX).await {
        Ok(objects) => objects
            .into_iter()
            .map(|o| o.name)
            .filter(|n| n.ends_with(".json"))
            .collect(),
        Err(e) => {
            warn!(phase = "compare", source = %dest.kind(), error = %e, "Failed to list backups");
            return None;
        }
    };
    names.sort_unstable_by(|a, b| b.cmp(a));

    for name in names {
        match dest.get(&name).await {
            Ok(Some(bytes)) => {
                if let Some(candidate) = decode_candidate(dest, &name, &bytes) {
                    return Some(candidate);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    phase = "compare",
                    source = %dest.kind(),
                    name = %name,
                    error = %e,
                    "Failed to read backup"
                );
            }
        }
    }
    None
}

fn decode_candidate(
    dest: &dyn BackupDestination,
    name: &str,
    bytes: &[u8],
) -> Option<BackupCandidate> {
    match Snapshot::decode(bytes) {
        Ok(snapshot) => Some(BackupCandidate {
            kind: dest.kind(),
            content_hash: content_hash(bytes),
            name: name.to_string(),
            snapshot,
        }),
        Err(e) => {
            warn!(
                phase = "compare",
                source = %dest.kind(),
                name = %name,
                error = %e,
                "Ignoring backup that could not be decoded"
            );
            None
        }
    }
}

/// `INSERT INTO t (c1, ...) SELECT json_extract(doc, '$.c1'), ... FROM (SELECT json(?) AS doc)`.
fn insert_sql(table: &ManagedTable) -> String {
    let columns: Vec<String> = table.columns.iter().map(|c| format!("\"{c}\"")).collect();
    let values: Vec<String> = table
        .columns
        .iter()
        .map(|c| format!("json_extract(src.doc, '$.{c}')"))
        .collect();
    format!(
        "INSERT INTO \"{}\" ({}) SELECT {} FROM (SELECT json(?) AS doc) AS src",
        table.name,
        columns.join(", "),
        values.join(", ")
    )
}

/// Delete children first, then insert parents first.
async fn stage_restore(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    snapshot: &Snapshot,
) -> Result<Vec<TableRestoreStats>> {
    for table in MANAGED_TABLES.iter().rev() {
        let sql = format!("DELETE FROM \"{}\"", table.name);
        sqlx::query(&sql).execute(&mut **tx).await?;
    }

    let mut results = Vec::with_capacity(MANAGED_TABLES.len());
    for table in MANAGED_TABLES {
        let sql = insert_sql(table);
        let mut stats = TableRestoreStats {
            table: table.name.to_string(),
            ..TableRestoreStats::default()
        };

        for (index, row) in snapshot.rows(table.name).iter().enumerate() {
            let doc = serde_json::to_string(row)?;
            match sqlx::query(&sql).bind(doc).execute(&mut **tx).await {
                Ok(_) => stats.restored += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(
                        phase = "restore",
                        table = table.name,
                        row = index,
                        id = ?row.get(table.primary_key()),
                        error = %e,
                        "Skipping row that could not be restored"
                    );
                }
            }
        }
        results.push(stats);
    }
    Ok(results)
}

async fn rollback(tx: sqlx::Transaction<'_, sqlx::Sqlite>) {
    match tx.rollback().await {
        Ok(()) => info!(phase = "restore", "Restore transaction rolled back"),
        Err(e) => warn!(phase = "restore", error = %e, "Rollback failed, connection discarded"),
    }
}
