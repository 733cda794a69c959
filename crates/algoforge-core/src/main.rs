// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AlgoForge Core - Durable State Engine
//!
//! Standalone service mode: opens the configured store, reconciles it
//! against the backups, keeps publishing backups until Ctrl-C, then shuts
//! down cleanly.

use anyhow::Result;
use tracing::{error, info};

use algoforge_core::config::{Config, DatabaseBackend};
use algoforge_core::engine::StateEngineBuilder;
use algoforge_core::provider::{PostgresProvider, StoreProvider};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("algoforge_core=info".parse()?),
        )
        .init();

    info!("Starting AlgoForge Core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    match &config.database {
        DatabaseBackend::Sqlite(sqlite) => {
            info!(
                path = %sqlite.path.display(),
                remote_backups = config.object_store.is_some(),
                backup_dir = %config.backup.local_dir.display(),
                backup_interval_secs = config.backup.interval.as_secs(),
                restore_deadline_secs = config.restore_deadline.as_secs(),
                "Configuration loaded"
            );

            let engine = StateEngineBuilder::from_config(&config)?
                .build()?
                .start()
                .await?;

            info!("AlgoForge Core initialized successfully");

            // Wait for shutdown signal
            tokio::signal::ctrl_c().await?;
            info!("Shutting down...");

            engine.shutdown().await?;
        }
        DatabaseBackend::Postgres(postgres) => {
            info!(
                max_connections = postgres.max_connections,
                "Configuration loaded (PostgreSQL, backups are left to the server)"
            );

            let provider = PostgresProvider::connect(postgres).await?;
            provider.configure().await?;

            info!("Running database migrations...");
            provider.migrate().await?;
            info!("Migrations completed");

            provider.ping().await?;
            info!("AlgoForge Core initialized successfully");

            tokio::signal::ctrl_c().await?;
            info!("Shutting down...");

            provider.close().await?;
        }
    }

    info!("Shutdown complete");
    Ok(())
}
