// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Descriptors for the tables covered by backup and restore.
//!
//! The snapshot and restore code never names a column on its own; it walks
//! [`MANAGED_TABLES`] instead. Adding a column to a managed table means
//! adding it to the migration and to the descriptor below.

/// A domain table subject to backup and restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagedTable {
    /// Table name, also the key in the snapshot document.
    pub name: &'static str,
    /// Column names, primary key first.
    pub columns: &'static [&'static str],
    /// Tables this one references by foreign key.
    pub references: &'static [&'static str],
}

impl ManagedTable {
    /// Primary key column.
    pub fn primary_key(&self) -> &'static str {
        self.columns[0]
    }
}

/// Preset input files.
pub const PRESET_DATA: ManagedTable = ManagedTable {
    name: "preset_data",
    columns: &[
        "id",
        "filename",
        "category",
        "minio_path",
        "minio_url",
        "created_at",
    ],
    references: &[],
};

/// Registered algorithms. This is the primary table counted as `record_count`.
pub const ALGORITHMS: ManagedTable = ManagedTable {
    name: "algorithms",
    columns: &[
        "id",
        "name",
        "description",
        "language",
        "platform",
        "category",
        "entrypoint",
        "tags",
        "preset_data_id",
        "current_version_id",
        "created_at",
        "updated_at",
    ],
    references: &[],
};

/// Source versions of an algorithm.
pub const VERSIONS: ManagedTable = ManagedTable {
    name: "versions",
    columns: &[
        "id",
        "algorithm_id",
        "version_number",
        "minio_path",
        "source_code_file",
        "commit_message",
        "created_at",
    ],
    references: &["algorithms"],
};

/// Execution jobs.
pub const JOBS: ManagedTable = ManagedTable {
    name: "jobs",
    columns: &[
        "id",
        "algorithm_id",
        "algorithm_name",
        "mode",
        "status",
        "input_params",
        "input_url",
        "output_url",
        "log_url",
        "started_at",
        "finished_at",
        "cost_time_ms",
        "worker_id",
        "created_at",
    ],
    references: &[],
};

/// Every managed table, parents before children.
///
/// Restore inserts in this order and deletes in reverse.
pub const MANAGED_TABLES: &[ManagedTable] = &[PRESET_DATA, ALGORITHMS, VERSIONS, JOBS];

/// The table whose row count is recorded in the ledger.
pub const PRIMARY_TABLE: ManagedTable = ALGORITHMS;

/// Look up a managed table by name.
pub fn find(name: &str) -> Option<&'static ManagedTable> {
    MANAGED_TABLES.iter().find(|t| t.name == name)
}
