// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL store provider.
//!
//! Crash safety and backups are the server's responsibility, so this provider
//! only manages the pool, migrations and health.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, instrument};

use super::StoreProvider;
use crate::config::PostgresConfig;
use crate::error::{Result, StoreError};
use crate::migrations;

/// PostgreSQL-backed store provider.
#[derive(Clone)]
pub struct PostgresProvider {
    pool: PgPool,
}

impl PostgresProvider {
    /// Connect to the server described by `config`.
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.url)
            .await
            .map_err(|e| StoreError::io("connect", format!("Failed to connect to PostgreSQL: {e}")))?;

        info!("PostgreSQL connection established");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The live connection pool handed to the API layer.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StoreProvider for PostgresProvider {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn configure(&self) -> Result<()> {
        let version: String = sqlx::query_scalar("SHOW server_version")
            .fetch_one(&self.pool)
            .await?;
        info!(server_version = %version, "PostgreSQL store configured");
        Ok(())
    }

    async fn migrate(&self) -> Result<()> {
        migrations::run_postgres(&self.pool).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!("PostgreSQL pool closed");
        }
        Ok(())
    }
}
