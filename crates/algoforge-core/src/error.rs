// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the durable state engine.
//!
//! Every fallible operation in the crate returns [`StoreError`]. The variants
//! follow the recovery policy: I/O problems fall back to the secondary
//! destination, transient lock errors are retried, consistency problems are
//! logged, and only [`StoreError::Corruption`] is allowed to block startup.

use std::time::Duration;

use crate::config::ConfigError;

/// Result type using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the store provider, ledger, snapshot and backup layers.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// File or network resource unavailable.
    #[error("I/O error during '{operation}': {details}")]
    Io {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Post-restore row counts disagree with the snapshot's declared counts.
    #[error("table '{table}' holds {actual} rows after restore, snapshot declared {expected}")]
    Consistency {
        /// The managed table that failed verification.
        table: String,
        /// Row count declared by the snapshot.
        expected: i64,
        /// Row count found after commit.
        actual: i64,
    },

    /// An operation exceeded its deadline.
    #[error("'{operation}' exceeded its deadline of {deadline:?}")]
    Timeout {
        /// The operation that was abandoned.
        operation: String,
        /// The deadline that elapsed.
        deadline: Duration,
    },

    /// The current store is unreadable. Fatal at startup when no backup exists.
    #[error("store is corrupted: {details}")]
    Corruption {
        /// What failed while reading the current store.
        details: String,
    },

    /// The store reported a busy/locked condition.
    #[error("store is busy: {details}")]
    TransientLock {
        /// Error details from the driver.
        details: String,
    },

    /// A table or relation the engine expected does not exist.
    #[error("missing relation: {details}")]
    MissingRelation {
        /// Error details from the driver.
        details: String,
    },

    /// Write-ahead logging could not be enabled on the store file.
    #[error("write-ahead logging is unavailable for '{path}' (journal_mode = {mode})")]
    WalUnavailable {
        /// Path of the store file.
        path: String,
        /// The journal mode the store reported instead.
        mode: String,
    },

    /// Any other database failure.
    #[error("database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A snapshot document could not be encoded or decoded.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// A snapshot document declares a format this build does not understand.
    #[error("unsupported snapshot format version {0}")]
    UnsupportedSnapshotFormat(u64),

    /// The remote object store rejected a request.
    #[error("object store error: {0}")]
    ObjectStore(String),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl StoreError {
    /// Stable error code for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "IO_ERROR",
            Self::Consistency { .. } => "CONSISTENCY_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Corruption { .. } => "CORRUPTION",
            Self::TransientLock { .. } => "TRANSIENT_LOCK",
            Self::MissingRelation { .. } => "MISSING_RELATION",
            Self::WalUnavailable { .. } => "WAL_UNAVAILABLE",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Snapshot(_) => "SNAPSHOT_ERROR",
            Self::UnsupportedSnapshotFormat(_) => "UNSUPPORTED_SNAPSHOT_FORMAT",
            Self::ObjectStore(_) => "OBJECT_STORE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Whether the failed operation may succeed if simply retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientLock { .. })
    }

    /// Shorthand for a [`StoreError::Database`] with an operation label.
    pub fn database(operation: impl Into<String>, details: impl ToString) -> Self {
        Self::Database {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// Shorthand for a [`StoreError::Io`] with an operation label.
    pub fn io(operation: impl Into<String>, details: impl ToString) -> Self {
        Self::Io {
            operation: operation.into(),
            details: details.to_string(),
        }
    }
}

/// SQLite primary result codes.
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;
const SQLITE_CORRUPT: i64 = 11;
const SQLITE_NOTADB: i64 = 26;

/// PostgreSQL `undefined_table`.
const PG_UNDEFINED_TABLE: &str = "42P01";

/// SQLite reports extended codes; the primary code lives in the low byte.
fn sqlite_primary_code(db: &dyn sqlx::error::DatabaseError) -> Option<i64> {
    db.code()?.parse::<i64>().ok().map(|code| code & 0xff)
}

fn is_busy(db: &dyn sqlx::error::DatabaseError) -> bool {
    if matches!(sqlite_primary_code(db), Some(SQLITE_BUSY | SQLITE_LOCKED)) {
        return true;
    }
    let message = db.message();
    message.contains("database is locked") || message.contains("database table is locked")
}

fn is_corrupt(db: &dyn sqlx::error::DatabaseError) -> bool {
    matches!(sqlite_primary_code(db), Some(SQLITE_CORRUPT | SQLITE_NOTADB))
        || db.message().contains("malformed")
}

fn is_missing_relation(db: &dyn sqlx::error::DatabaseError) -> bool {
    if db.code().as_deref() == Some(PG_UNDEFINED_TABLE) {
        return true;
    }
    let message = db.message();
    message.contains("no such table") || message.contains("does not exist")
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if is_busy(db.as_ref()) => Self::TransientLock {
                details: db.message().to_string(),
            },
            sqlx::Error::Database(db) if is_corrupt(db.as_ref()) => Self::Corruption {
                details: db.message().to_string(),
            },
            sqlx::Error::Database(db) if is_missing_relation(db.as_ref()) => {
                Self::MissingRelation {
                    details: db.message().to_string(),
                }
            }
            sqlx::Error::PoolTimedOut => Self::TransientLock {
                details: err.to_string(),
            },
            sqlx::Error::Io(io) => Self::io("database", io),
            _ => Self::database("query", err),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::database("migrate", err)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::io("filesystem", err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Snapshot(err.to_string())
    }
}

impl From<s3::error::S3Error> for StoreError {
    fn from(err: s3::error::S3Error) -> Self {
        Self::ObjectStore(err.to_string())
    }
}

impl From<s3::creds::error::CredentialsError> for StoreError {
    fn from(err: s3::creds::error::CredentialsError) -> Self {
        Self::ObjectStore(format!("invalid credentials: {err}"))
    }
}
