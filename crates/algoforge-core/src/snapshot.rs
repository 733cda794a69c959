// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Snapshot documents.
//!
//! A snapshot is a full export of every managed table plus the ledger state
//! at the moment of export:
//!
//! ```json
//! {
//!   "format_version": 1,
//!   "preset_data": [...], "algorithms": [...], "versions": [...], "jobs": [...],
//!   "backed_up_at": "2025-06-01T10:00:00Z",
//!   "metadata": { "version": 7, "record_count": 15, "last_updated_at": "...",
//!                 "table_counts": { "algorithms": 15, ... } }
//! }
//! ```
//!
//! Rows are plain JSON objects keyed by column name, so the document does not
//! depend on the Rust entity types. Documents written before `format_version`
//! existed are recognised by the missing tag and upgraded on decode; any other
//! unknown version is rejected instead of being guessed at.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use tracing::{debug, instrument, warn};

use crate::error::{Result, StoreError};
use crate::ledger::LedgerState;
use crate::managed::{MANAGED_TABLES, ManagedTable, PRIMARY_TABLE, VERSIONS};

/// One table row, keyed by column name.
pub type Row = Map<String, Value>;

/// Format version written by this build.
pub const SNAPSHOT_FORMAT_VERSION: u64 = 1;

/// Ledger state embedded in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Ledger version at export time.
    pub version: i64,
    /// Rows in the primary managed table.
    pub record_count: i64,
    /// Last data change recorded by the ledger.
    pub last_updated_at: Option<DateTime<Utc>>,
    /// Rows per managed table at export time.
    #[serde(default)]
    pub table_counts: BTreeMap<String, i64>,
}

/// Which on-disk layout a decoded document used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    /// Untagged documents from releases before format versioning.
    Legacy,
    /// `format_version: 1`.
    V1,
}

/// A full, point-in-time export of the managed tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Document layout version.
    pub format_version: u64,
    /// Rows per managed table name.
    #[serde(flatten)]
    pub tables: BTreeMap<String, Vec<Row>>,
    /// When the snapshot was produced.
    #[serde(rename = "backed_up_at")]
    pub produced_at: DateTime<Utc>,
    /// Ledger state at export time.
    pub metadata: SnapshotMetadata,
}

impl Snapshot {
    /// Reconciliation tuple carried by this snapshot.
    pub fn state(&self) -> LedgerState {
        LedgerState {
            version: self.metadata.version,
            record_count: self.metadata.record_count,
            last_updated_at: self.metadata.last_updated_at,
        }
    }

    /// Rows of `table`, empty when the snapshot does not carry it.
    pub fn rows(&self, table: &str) -> &[Row] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Row count the snapshot declares for `table`.
    pub fn declared_count(&self, table: &str) -> i64 {
        self.metadata
            .table_counts
            .get(table)
            .copied()
            .unwrap_or(self.rows(table).len() as i64)
    }

    /// Total rows across every managed table.
    pub fn total_rows(&self) -> usize {
        MANAGED_TABLES.iter().map(|t| self.rows(t.name).len()).sum()
    }

    /// Pretty-printed JSON document.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Decode a document of any supported format.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::decode_with_format(bytes).map(|(snapshot, _)| snapshot)
    }

    /// Decode a document and report which layout it used.
    pub fn decode_with_format(bytes: &[u8]) -> Result<(Self, SnapshotFormat)> {
        let value: Value = serde_json::from_slice(bytes)?;
        let Value::Object(object) = value else {
            return Err(StoreError::Snapshot(
                "snapshot document is not a JSON object".to_string(),
            ));
        };

        match object.get("format_version") {
            None => Ok((upgrade_legacy(object)?, SnapshotFormat::Legacy)),
            Some(tag) => match tag.as_u64() {
                Some(SNAPSHOT_FORMAT_VERSION) => {
                    let snapshot: Snapshot = serde_json::from_value(Value::Object(object))?;
                    Ok((snapshot, SnapshotFormat::V1))
                }
                Some(other) => Err(StoreError::UnsupportedSnapshotFormat(other)),
                None => Err(StoreError::Snapshot(format!(
                    "format_version must be an unsigned integer, got {tag}"
                ))),
            },
        }
    }
}

/// Upgrade an untagged document.
///
/// Old documents use `backuped_at`, nest versions under their algorithm,
/// key jobs by `job_id` and may lack `metadata`.
fn upgrade_legacy(mut object: Map<String, Value>) -> Result<Snapshot> {
    let mut tables = BTreeMap::new();
    for table in MANAGED_TABLES {
        let rows = match object.remove(table.name) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(row) => Ok(row),
                    other => Err(StoreError::Snapshot(format!(
                        "row in '{}' is not an object: {other}",
                        table.name
                    ))),
                })
                .collect::<Result<Vec<Row>>>()?,
            Some(other) => {
                return Err(StoreError::Snapshot(format!(
                    "'{}' must be an array, got {other}",
                    table.name
                )));
            }
        };
        tables.insert(table.name.to_string(), rows);
    }

    // Versions nested under algorithms become the versions table when the
    // document has no top-level list.
    let mut nested_versions = Vec::new();
    if let Some(algorithms) = tables.get_mut(PRIMARY_TABLE.name) {
        for algorithm in algorithms.iter_mut() {
            if let Some(Value::Array(children)) = algorithm.remove("versions") {
                nested_versions.extend(children.into_iter().filter_map(|child| match child {
                    Value::Object(row) => Some(row),
                    _ => None,
                }));
            }
        }
    }
    if let Some(versions) = tables.get_mut(VERSIONS.name)
        && versions.is_empty()
    {
        *versions = nested_versions;
    }

    if let Some(jobs) = tables.get_mut("jobs") {
        for job in jobs.iter_mut() {
            if !job.contains_key("id")
                && let Some(id) = job.remove("job_id")
            {
                job.insert("id".to_string(), id);
            }
        }
    }

    for table in MANAGED_TABLES {
        if let Some(rows) = tables.get_mut(table.name) {
            for row in rows.iter_mut() {
                row.retain(|column, _| table.columns.contains(&column.as_str()));
            }
        }
    }

    let metadata = match object.remove("metadata") {
        Some(Value::Object(meta)) => legacy_metadata(&meta, &tables),
        _ => SnapshotMetadata {
            version: 0,
            record_count: tables.get(PRIMARY_TABLE.name).map_or(0, |r| r.len() as i64),
            last_updated_at: None,
            table_counts: BTreeMap::new(),
        },
    };

    let produced_at = object
        .remove("backed_up_at")
        .or_else(|| object.remove("backuped_at"))
        .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v).ok())
        .or(metadata.last_updated_at)
        .unwrap_or_default();

    debug!(
        version = metadata.version,
        record_count = metadata.record_count,
        "Upgraded legacy snapshot document"
    );

    Ok(Snapshot {
        format_version: SNAPSHOT_FORMAT_VERSION,
        tables,
        produced_at,
        metadata,
    })
}

fn legacy_metadata(meta: &Map<String, Value>, tables: &BTreeMap<String, Vec<Row>>) -> SnapshotMetadata {
    let primary_rows = tables.get(PRIMARY_TABLE.name).map_or(0, |r| r.len() as i64);
    let record_count = match meta.get("record_count").and_then(Value::as_i64) {
        Some(count) if count > 0 => count,
        _ => primary_rows,
    };

    SnapshotMetadata {
        version: meta.get("version").and_then(Value::as_i64).unwrap_or(0),
        record_count,
        last_updated_at: meta
            .get("last_updated_at")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok()),
        table_counts: BTreeMap::new(),
    }
}

/// Reads the managed tables into a [`Snapshot`].
#[derive(Debug, Clone)]
pub struct SnapshotSerializer {
    pool: SqlitePool,
}

impl SnapshotSerializer {
    /// Serializer over the store behind `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Export every managed table and the ledger state.
    ///
    /// All reads happen in one transaction, so under WAL the result is a
    /// consistent point-in-time view and concurrent writers are not blocked.
    #[instrument(skip(self))]
    pub async fn serialize(&self) -> Result<Snapshot> {
        let mut tx = self.pool.begin().await?;

        let ledger: Option<(i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT version, last_updated_at FROM database_metadata ORDER BY version DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let mut tables = BTreeMap::new();
        let mut table_counts = BTreeMap::new();
        for table in MANAGED_TABLES {
            let rows = read_table(&mut tx, table).await?;
            table_counts.insert(table.name.to_string(), rows.len() as i64);
            tables.insert(table.name.to_string(), rows);
        }

        tx.commit().await?;

        let record_count = table_counts.get(PRIMARY_TABLE.name).copied().unwrap_or(0);
        let (version, last_updated_at) = match ledger {
            Some((version, at)) => (version, Some(at)),
            None => (0, None),
        };

        debug!(version, record_count, "Snapshot serialized");

        Ok(Snapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            tables,
            produced_at: Utc::now(),
            metadata: SnapshotMetadata {
                version,
                record_count,
                last_updated_at,
                table_counts,
            },
        })
    }
}

/// `json_object('id', "id", 'name', "name", ...)` for a table.
pub(crate) fn json_object_expr(table: &ManagedTable) -> String {
    let pairs: Vec<String> = table
        .columns
        .iter()
        .map(|c| format!("'{c}', \"{c}\""))
        .collect();
    format!("json_object({})", pairs.join(", "))
}

async fn read_table(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    table: &ManagedTable,
) -> Result<Vec<Row>> {
    let sql = format!(
        "SELECT {} FROM \"{}\" ORDER BY \"{}\"",
        json_object_expr(table),
        table.name,
        table.primary_key()
    );

    let encoded: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&mut **tx).await?;

    let mut rows = Vec::with_capacity(encoded.len());
    for text in encoded {
        match serde_json::from_str::<Row>(&text) {
            Ok(row) => rows.push(row),
            Err(e) => warn!(table = table.name, error = %e, "Skipping unreadable row"),
        }
    }
    Ok(rows)
}
