// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for algoforge-core integration tests.
//!
//! Provides temp-dir stores, in-memory/failing/hanging backup destinations
//! and snapshot builders.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};
use tempfile::TempDir;

use algoforge_core::config::SqliteConfig;
use algoforge_core::destination::{BackupDestination, DestinationKind, ObjectInfo};
use algoforge_core::error::{Result, StoreError};
use algoforge_core::ledger::VersionLedger;
use algoforge_core::provider::{SqliteProvider, StoreProvider};
use algoforge_core::reconcile::Reconciler;
use algoforge_core::repository::EntityRepository;
use algoforge_core::snapshot::{Row, SNAPSHOT_FORMAT_VERSION, Snapshot, SnapshotMetadata};

// ============================================================================
// Stores
// ============================================================================

/// An opened, configured and migrated store in its own temp directory.
pub struct TestStore {
    pub dir: TempDir,
    pub provider: Arc<SqliteProvider>,
    pub ledger: Arc<VersionLedger>,
    pub repository: EntityRepository,
}

impl TestStore {
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        Self::open_in(dir).await
    }

    pub async fn open_in(dir: TempDir) -> Self {
        let provider = SqliteProvider::open(SqliteConfig::new(dir.path().join("store.db")))
            .await
            .expect("open store");
        provider.configure().await.expect("configure store");
        provider.migrate().await.expect("migrate store");

        let provider = Arc::new(provider);
        let ledger = Arc::new(VersionLedger::new(provider.pool().clone()));
        let repository = EntityRepository::new(provider.pool().clone(), ledger.clone());

        Self {
            dir,
            provider,
            ledger,
            repository,
        }
    }

    pub fn reconciler(
        &self,
        remote: Option<Arc<dyn BackupDestination>>,
        local: Arc<dyn BackupDestination>,
        deadline: Duration,
    ) -> Reconciler {
        Reconciler::new(&self.provider, self.ledger.clone(), remote, local, deadline)
    }

    /// Insert `count` algorithms directly, bypassing the ledger.
    pub async fn seed_algorithms(&self, count: usize) {
        for i in 0..count {
            sqlx::query(
                "INSERT INTO algorithms (id, name, created_at, updated_at) VALUES (?, ?, ?, ?)",
            )
            .bind(format!("seed-{i}"))
            .bind(format!("seeded algorithm {i}"))
            .bind(at(0))
            .bind(at(0))
            .execute(self.provider.pool())
            .await
            .expect("seed algorithm");
        }
    }

    /// Rows of `table` as JSON, ordered by primary key.
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        let snapshot = algoforge_core::snapshot::SnapshotSerializer::new(self.provider.pool().clone())
            .serialize()
            .await
            .expect("serialize");
        let mut rows = snapshot.rows(table).to_vec();
        rows.sort_by_key(|r| r.get("id").and_then(Value::as_str).map(str::to_owned));
        rows
    }

    pub async fn count(&self, table: &str) -> i64 {
        let sql = format!("SELECT COUNT(*) FROM {table}");
        sqlx::query_scalar(&sql)
            .fetch_one(self.provider.pool())
            .await
            .expect("count")
    }
}

/// Fixed test clock: 2025-06-01T10:00:00Z plus `minutes`.
pub fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
}

// ============================================================================
// Snapshots
// ============================================================================

/// Builds snapshot documents with consistent rows across the managed tables.
pub struct SnapshotBuilder {
    version: i64,
    last_updated_at: Option<DateTime<Utc>>,
    tables: BTreeMap<String, Vec<Row>>,
}

impl SnapshotBuilder {
    pub fn new(version: i64) -> Self {
        let tables = ["preset_data", "algorithms", "versions", "jobs"]
            .into_iter()
            .map(|t| (t.to_string(), Vec::new()))
            .collect();
        Self {
            version,
            last_updated_at: Some(at(version)),
            tables,
        }
    }

    pub fn updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_updated_at = Some(at);
        self
    }

    /// Add `count` algorithms, each with one version and one job.
    pub fn algorithms(mut self, count: usize, tag: &str) -> Self {
        for i in 0..count {
            let id = format!("{tag}-algo-{i}");
            self.push("algorithms", algorithm_row(&id, &format!("{tag} algorithm {i}")));
            self.push(
                "versions",
                row(json!({
                    "id": format!("{id}-v1"),
                    "algorithm_id": id,
                    "version_number": 1,
                    "minio_path": format!("algorithms/{id}/v1.zip"),
                    "source_code_file": "main.py",
                    "commit_message": "initial",
                    "created_at": at(0).to_rfc3339(),
                })),
            );
            self.push(
                "jobs",
                row(json!({
                    "id": format!("{id}-job"),
                    "algorithm_id": id,
                    "algorithm_name": format!("{tag} algorithm {i}"),
                    "mode": "batch",
                    "status": "completed",
                    "input_params": "{\"n\":10}",
                    "input_url": null,
                    "output_url": null,
                    "log_url": null,
                    "started_at": at(1).to_rfc3339(),
                    "finished_at": at(2).to_rfc3339(),
                    "cost_time_ms": 60000,
                    "worker_id": "worker-1",
                    "created_at": at(0).to_rfc3339(),
                })),
            );
        }
        self
    }

    /// Add a raw row to `table`.
    pub fn push(&mut self, table: &str, row: Row) {
        self.tables.entry(table.to_string()).or_default().push(row);
    }

    pub fn with_row(mut self, table: &str, row: Row) -> Self {
        self.push(table, row);
        self
    }

    pub fn build(self) -> Snapshot {
        let table_counts = self
            .tables
            .iter()
            .map(|(t, rows)| (t.clone(), rows.len() as i64))
            .collect();
        Snapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            metadata: SnapshotMetadata {
                version: self.version,
                record_count: self.tables.get("algorithms").map_or(0, |r| r.len() as i64),
                last_updated_at: self.last_updated_at,
                table_counts,
            },
            tables: self.tables,
            produced_at: self.last_updated_at.unwrap_or_else(|| at(0)),
        }
    }
}

pub fn algorithm_row(id: &str, name: &str) -> Row {
    row(json!({
        "id": id,
        "name": name,
        "description": "sorts things",
        "language": "python",
        "platform": "linux",
        "category": "sorting",
        "entrypoint": "main.py",
        "tags": "[\"fast\",\"stable\"]",
        "preset_data_id": null,
        "current_version_id": format!("{id}-v1"),
        "created_at": at(0).to_rfc3339(),
        "updated_at": at(0).to_rfc3339(),
    }))
}

pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("row must be a JSON object, got {other}"),
    }
}

/// Store `snapshot` as `latest.json` in `dest`.
pub async fn publish_latest(dest: &dyn BackupDestination, snapshot: &Snapshot) {
    dest.put("latest.json", &snapshot.encode().unwrap(), "application/json")
        .await
        .expect("put latest.json");
}

// ============================================================================
// Destinations
// ============================================================================

/// Destination keeping objects in memory.
pub struct InMemoryDestination {
    kind: DestinationKind,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    puts: AtomicUsize,
}

impl InMemoryDestination {
    pub fn remote() -> Arc<Self> {
        Arc::new(Self::new(DestinationKind::RemotePrimary))
    }

    pub fn local() -> Arc<Self> {
        Arc::new(Self::new(DestinationKind::LocalFallback))
    }

    fn new(kind: DestinationKind) -> Self {
        Self {
            kind,
            objects: Mutex::new(BTreeMap::new()),
            puts: AtomicUsize::new(0),
        }
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn object(&self, name: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(name).cloned()
    }

    pub fn insert(&self, name: &str, data: &[u8]) {
        self.objects.lock().unwrap().insert(name.to_string(), data.to_vec());
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackupDestination for InMemoryDestination {
    fn kind(&self) -> DestinationKind {
        self.kind
    }

    fn location(&self, name: &str) -> String {
        format!("memory://{}/{name}", self.kind)
    }

    async fn put(&self, name: &str, data: &[u8], _content_type: &str) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.insert(name, data);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.object(name))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, data)| ObjectInfo {
                name: name.clone(),
                size: data.len() as u64,
                last_modified: None,
            })
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(name);
        Ok(())
    }
}

/// Destination whose every call fails, like an unreachable object store.
pub struct FailingDestination {
    kind: DestinationKind,
}

impl FailingDestination {
    pub fn remote() -> Arc<Self> {
        Arc::new(Self {
            kind: DestinationKind::RemotePrimary,
        })
    }

    fn unavailable(&self, operation: &str) -> StoreError {
        StoreError::io(operation, "connection refused")
    }
}

#[async_trait]
impl BackupDestination for FailingDestination {
    fn kind(&self) -> DestinationKind {
        self.kind
    }

    fn location(&self, name: &str) -> String {
        format!("unreachable://{name}")
    }

    async fn put(&self, _name: &str, _data: &[u8], _content_type: &str) -> Result<()> {
        Err(self.unavailable("put"))
    }

    async fn get(&self, _name: &str) -> Result<Option<Vec<u8>>> {
        Err(self.unavailable("get"))
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<ObjectInfo>> {
        Err(self.unavailable("list"))
    }

    async fn delete(&self, _name: &str) -> Result<()> {
        Err(self.unavailable("delete"))
    }
}

/// Destination whose every call never completes.
pub struct HangingDestination;

impl HangingDestination {
    pub fn remote() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl BackupDestination for HangingDestination {
    fn kind(&self) -> DestinationKind {
        DestinationKind::RemotePrimary
    }

    fn location(&self, name: &str) -> String {
        format!("hanging://{name}")
    }

    async fn put(&self, _name: &str, _data: &[u8], _content_type: &str) -> Result<()> {
        std::future::pending().await
    }

    async fn get(&self, _name: &str) -> Result<Option<Vec<u8>>> {
        std::future::pending().await
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<ObjectInfo>> {
        std::future::pending().await
    }

    async fn delete(&self, _name: &str) -> Result<()> {
        std::future::pending().await
    }
}
