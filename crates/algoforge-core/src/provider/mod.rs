// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store providers.
//!
//! A provider owns the connection pool for one backend and its lifecycle:
//! open, configure, migrate, ping, close. The backend is picked once from
//! [`crate::config::DatabaseBackend`] when the process starts.
//!
//! Only [`SqliteProvider`] carries the durability machinery (WAL checkpoints,
//! raw file copies). [`PostgresProvider`] leaves durability to the server.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresProvider;
pub use self::sqlite::{CheckpointStats, SqliteProvider, StoreStats};

use async_trait::async_trait;

use crate::error::Result;

/// Lifecycle operations shared by every store backend.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Apply and verify connection settings, start background maintenance.
    async fn configure(&self) -> Result<()>;

    /// Apply pending schema migrations.
    async fn migrate(&self) -> Result<()>;

    /// Round-trip a trivial query.
    async fn ping(&self) -> Result<()>;

    /// Stop background maintenance, flush, release the pool.
    ///
    /// Must be safe to call more than once.
    async fn close(&self) -> Result<()>;
}
