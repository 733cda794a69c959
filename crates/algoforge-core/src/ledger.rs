// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Append-only version ledger.
//!
//! Every committed mutation of a managed table appends one entry whose
//! version is the previous maximum plus one. A restore appends one entry
//! carrying the restored snapshot's version. The highest version wins.
//!
//! Writes go through a single async mutex and a single `INSERT ... SELECT`
//! statement, so two writers can never read the same maximum.

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::Result;
use crate::managed::PRIMARY_TABLE;
use crate::models::{LedgerEntry, UpdatedBy};
use crate::retry::RetryPolicy;

/// The reconciliation tuple of a store or snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerState {
    /// Highest recorded version, 0 when the ledger is empty.
    pub version: i64,
    /// Rows in the primary managed table.
    pub record_count: i64,
    /// When the data last changed, if ever.
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl LedgerState {
    /// State of a store that was never written to.
    pub const EMPTY: Self = Self {
        version: 0,
        record_count: 0,
        last_updated_at: None,
    };

    /// True when `self` is strictly newer than `other`: higher version, or
    /// equal version with a later update timestamp.
    pub fn is_newer_than(&self, other: &LedgerState) -> bool {
        (self.version, self.last_updated_at) > (other.version, other.last_updated_at)
    }
}

/// Serialized writer for the `database_metadata` table.
#[derive(Debug)]
pub struct VersionLedger {
    pool: SqlitePool,
    writer: Mutex<()>,
    retry: RetryPolicy,
}

impl VersionLedger {
    /// Ledger over the store behind `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            writer: Mutex::new(()),
            retry: RetryPolicy::default(),
        }
    }

    /// Append `max(version) + 1` and return it.
    #[instrument(skip(self))]
    pub async fn record_version(&self, updated_by: UpdatedBy) -> Result<i64> {
        let _writer = self.writer.lock().await;

        let version = self
            .retry
            .run("record_version", || self.append_next(updated_by))
            .await?;

        debug!(version, %updated_by, "Ledger version recorded");
        Ok(version)
    }

    /// Append an entry carrying an externally decided version, as after a
    /// restore. The version is written as given, not incremented.
    #[instrument(skip(self))]
    pub async fn record_restored(
        &self,
        version: i64,
        record_count: i64,
        last_updated_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let _writer = self.writer.lock().await;

        self.retry
            .run("record_restored", || {
                insert_restored(&self.pool, version, record_count, last_updated_at)
            })
            .await?;

        info!(version, record_count, "Ledger updated from restored snapshot");
        Ok(())
    }

    /// Like [`record_restored`](Self::record_restored), but inside the
    /// caller's transaction so the entry commits together with the data.
    ///
    /// The open write transaction excludes every other ledger writer until
    /// it ends.
    pub async fn record_restored_in(
        &self,
        conn: &mut SqliteConnection,
        version: i64,
        record_count: i64,
        last_updated_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        insert_restored(conn, version, record_count, last_updated_at).await?;
        debug!(version, record_count, "Restore entry staged");
        Ok(())
    }

    /// Current `(version, record_count, last_updated_at)`.
    ///
    /// Fails with [`crate::error::StoreError::MissingRelation`] when the
    /// ledger or the primary table does not exist.
    pub async fn current(&self) -> Result<LedgerState> {
        let latest = self.latest_entry().await?;

        let count_sql = format!("SELECT COUNT(*) FROM {}", PRIMARY_TABLE.name);
        let record_count: i64 = sqlx::query_scalar(&count_sql)
            .fetch_one(&self.pool)
            .await?;

        Ok(LedgerState {
            version: latest.as_ref().map_or(0, |e| e.version),
            record_count,
            last_updated_at: latest.map(|e| e.last_updated_at),
        })
    }

    /// The authoritative ledger entry, if any.
    pub async fn latest_entry(&self) -> Result<Option<LedgerEntry>> {
        let entry = sqlx::query_as::<_, LedgerEntry>(
            r#"
            SELECT id, version, last_updated_at, updated_by, checkpoint_at, record_count
            FROM database_metadata
            ORDER BY version DESC, id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }

    /// All entries, oldest first.
    pub async fn history(&self) -> Result<Vec<LedgerEntry>> {
        let entries = sqlx::query_as::<_, LedgerEntry>(
            r#"
            SELECT id, version, last_updated_at, updated_by, checkpoint_at, record_count
            FROM database_metadata
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn append_next(&self, updated_by: UpdatedBy) -> Result<i64> {
        let now = Utc::now();
        let sql = format!(
            r#"
            INSERT INTO database_metadata
                (version, last_updated_at, updated_by, checkpoint_at, record_count)
            SELECT COALESCE(MAX(version), 0) + 1, ?, ?, ?, (SELECT COUNT(*) FROM {})
            FROM database_metadata
            RETURNING version
            "#,
            PRIMARY_TABLE.name
        );

        let version: i64 = sqlx::query_scalar(&sql)
            .bind(now)
            .bind(updated_by.as_str())
            .bind(now)
            .fetch_one(&self.pool)
            .await?;

        Ok(version)
    }
}

async fn insert_restored<'e, E>(
    executor: E,
    version: i64,
    record_count: i64,
    last_updated_at: Option<DateTime<Utc>>,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO database_metadata
            (version, last_updated_at, updated_by, checkpoint_at, record_count)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(version)
    .bind(last_updated_at.unwrap_or(now))
    .bind(UpdatedBy::Restore.as_str())
    .bind(now)
    .bind(record_count)
    .execute(executor)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SqliteConfig;
    use crate::provider::{SqliteProvider, StoreProvider};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn test_store(dir: &TempDir) -> SqliteProvider {
        let provider = SqliteProvider::open(SqliteConfig::new(dir.path().join("ledger.db")))
            .await
            .unwrap();
        provider.configure().await.unwrap();
        provider.migrate().await.unwrap();
        provider
    }

    #[tokio::test]
    async fn test_empty_ledger_is_version_zero() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir).await;
        let ledger = VersionLedger::new(store.pool().clone());

        assert_eq!(ledger.current().await.unwrap(), LedgerState::EMPTY);
        assert!(ledger.latest_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_version_increments_by_one() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir).await;
        let ledger = VersionLedger::new(store.pool().clone());

        assert_eq!(ledger.record_version(UpdatedBy::Api).await.unwrap(), 1);
        assert_eq!(ledger.record_version(UpdatedBy::Api).await.unwrap(), 2);
        assert_eq!(ledger.record_version(UpdatedBy::System).await.unwrap(), 3);

        let entry = ledger.latest_entry().await.unwrap().unwrap();
        assert_eq!(entry.version, 3);
        assert_eq!(entry.updated_by, "system");
    }

    #[tokio::test]
    async fn test_record_count_tracks_primary_table() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir).await;
        let ledger = VersionLedger::new(store.pool().clone());

        for i in 0..3 {
            sqlx::query("INSERT INTO algorithms (id, name, created_at, updated_at) VALUES (?, 'a', '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z')")
                .bind(format!("alg-{i}"))
                .execute(store.pool())
                .await
                .unwrap();
        }
        ledger.record_version(UpdatedBy::Api).await.unwrap();

        let entry = ledger.latest_entry().await.unwrap().unwrap();
        assert_eq!(entry.record_count, 3);
        assert_eq!(ledger.current().await.unwrap().record_count, 3);
    }

    #[tokio::test]
    async fn test_concurrent_writers_get_distinct_consecutive_versions() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir).await;
        let ledger = Arc::new(VersionLedger::new(store.pool().clone()));

        let handles: Vec<_> = (0..25)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.record_version(UpdatedBy::Api).await.unwrap() })
            })
            .collect();

        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap());
        }
        versions.sort_unstable();

        assert_eq!(versions, (1..=25).collect::<Vec<i64>>());
        assert_eq!(ledger.current().await.unwrap().version, 25);
    }

    #[tokio::test]
    async fn test_record_restored_keeps_snapshot_version() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir).await;
        let ledger = VersionLedger::new(store.pool().clone());

        ledger.record_version(UpdatedBy::Api).await.unwrap();
        let restored_at = "2025-03-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        ledger.record_restored(7, 15, Some(restored_at)).await.unwrap();

        let entry = ledger.latest_entry().await.unwrap().unwrap();
        assert_eq!(entry.version, 7);
        assert_eq!(entry.record_count, 15);
        assert_eq!(entry.updated_by, "restore");
        assert_eq!(entry.last_updated_at, restored_at);

        // The next mutation continues from the restored version.
        assert_eq!(ledger.record_version(UpdatedBy::Api).await.unwrap(), 8);
        assert_eq!(ledger.history().await.unwrap().len(), 3);
    }

    #[test]
    fn test_newer_than_breaks_ties_by_timestamp() {
        let earlier = "2025-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let later = "2025-01-02T00:00:00Z".parse::<DateTime<Utc>>().unwrap();

        let a = LedgerState {
            version: 5,
            record_count: 1,
            last_updated_at: Some(later),
        };
        let b = LedgerState {
            version: 5,
            record_count: 9,
            last_updated_at: Some(earlier),
        };
        let c = LedgerState {
            version: 6,
            record_count: 0,
            last_updated_at: None,
        };

        assert!(a.is_newer_than(&b));
        assert!(!b.is_newer_than(&a));
        assert!(c.is_newer_than(&a));
        assert!(!a.is_newer_than(&a));
    }
}
