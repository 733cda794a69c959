// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AlgoForge Core - Durable State Engine
//!
//! This crate keeps the algorithm platform's relational state (algorithms,
//! versions, preset data, jobs) alive across crashes, container restarts and
//! volume loss. It owns the embedded store, versions every mutation, publishes
//! backups to an object store with a local fallback, and on startup restores
//! whichever copy of the data is newest.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           API layer                                      │
//! │              (uses StateEngine::handle / EntityRepository)               │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ mutations
//!                                    ▼
//! ┌───────────────────────┐   ┌───────────────────────┐
//! │   SqliteProvider      │◄──│    VersionLedger      │
//! │  WAL + checkpoints    │   │  database_metadata    │
//! └───────────────────────┘   └───────────────────────┘
//!           │ read txn                      ▲ restore entry
//!           ▼                               │
//! ┌───────────────────────┐   ┌───────────────────────┐
//! │  SnapshotSerializer   │   │      Reconciler       │
//! └───────────────────────┘   │  (startup, deadline)  │
//!           │                 └───────────────────────┘
//!           ▼                               ▲
//! ┌───────────────────────┐   fallback  ┌───┴───────────────────┐
//! │   BackupPublisher     │────────────►│  LocalDirDestination  │
//! │  (BackupScheduler)    │             └───────────────────────┘
//! └───────────────────────┘
//!           │ primary
//!           ▼
//! ┌───────────────────────┐
//! │ ObjectStoreDestination│
//! │   (MinIO / S3)        │
//! └───────────────────────┘
//! ```
//!
//! # Startup
//!
//! | Step | What happens |
//! |------|--------------|
//! | Open | Store file created if missing, pool opened |
//! | Configure | WAL verified, `synchronous=FULL`, foreign keys, checkpoint task started |
//! | Migrate | Schema migrations applied |
//! | Reconcile | Current store compared against the remote and local snapshots, newest restored |
//! | Schedule | Backup scheduler started |
//!
//! Reconciliation never blocks startup except when the store is corrupted
//! and nothing can replace it. See [`reconcile`] for the state machine.
//!
//! # Backups
//!
//! | Artifact | Remote | Local fallback |
//! |----------|--------|----------------|
//! | Snapshot document | `backup-<ts>.json`, `latest.json` | `backup-<ts>.json`, `latest.json` |
//! | Raw store copy | `db-backup-<ts>.db`, `latest.db` | `db-backup-<ts>.db` |
//! | Shutdown copy | `final-backup.db` | `final-backup.db` |
//!
//! # Configuration
//!
//! Environment variables are read by [`config::Config::from_env`]; the
//! binary also loads a `.env` file.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `ALGOFORGE_DATABASE_TYPE` | `sqlite` |
//! | `ALGOFORGE_SQLITE_PATH` | `./data/algorithm-platform.db` |
//! | `ALGOFORGE_MINIO_ENDPOINT` | unset (local backups only) |
//! | `ALGOFORGE_BACKUP_INTERVAL_SECS` | `300` |
//! | `ALGOFORGE_BACKUP_DIR` | `./data/backups` |
//! | `ALGOFORGE_RESTORE_DEADLINE_SECS` | `300` |
//!
//! # Modules
//!
//! - [`provider`]: store lifecycle (SQLite and PostgreSQL)
//! - [`ledger`]: monotonic data versions
//! - [`snapshot`]: portable snapshot documents
//! - [`backup`]: publishing, retention and scheduling
//! - [`reconcile`]: startup comparison and restore
//! - [`recovery`]: raw store file recovery
//! - [`repository`]: versioned entity mutations
//! - [`engine`]: everything above, started and stopped as one

#![warn(missing_docs)]

pub mod backup;
pub mod config;
pub mod destination;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod managed;
pub mod migrations;
pub mod models;
pub mod provider;
pub mod reconcile;
pub mod recovery;
pub mod repository;
pub mod retry;
pub mod snapshot;

pub use backup::{BackupPublisher, BackupRecord, BackupScheduler, PublishOutcome, PruneReport};
pub use destination::{
    BackupDestination, DestinationKind, LocalDirDestination, ObjectStoreDestination,
};
pub use engine::{StateEngine, StateEngineBuilder, StateEngineConfig};
pub use error::{Result, StoreError};
pub use ledger::{LedgerState, VersionLedger};
pub use provider::{PostgresProvider, SqliteProvider, StoreProvider};
pub use reconcile::{ReconcileOutcome, Reconciler, RestoreSummary};
pub use recovery::recover_store_file;
pub use repository::EntityRepository;
pub use snapshot::{Snapshot, SnapshotSerializer};
