// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable durable state engine.
//!
//! [`StateEngine`] wires the store provider, the version ledger, the startup
//! reconciler and the backup scheduler together so an application only has
//! to start it and hand [`StateEngine::handle`] to its API layer.
//!
//! # Example
//!
//! ```rust,ignore
//! use algoforge_core::config::SqliteConfig;
//! use algoforge_core::engine::StateEngine;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = StateEngine::builder()
//!         .sqlite(SqliteConfig::new("./data/algorithm-platform.db"))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let pool = engine.handle();
//!     // ... serve requests ...
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backup::{BackupPublisher, BackupScheduler};
use crate::config::{
    BackupConfig, Config, ConfigError, DEFAULT_RESTORE_DEADLINE, DatabaseBackend, SqliteConfig,
};
use crate::destination::{BackupDestination, LocalDirDestination, ObjectStoreDestination};
use crate::error::{Result, StoreError};
use crate::ledger::VersionLedger;
use crate::provider::{SqliteProvider, StoreProvider};
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::repository::EntityRepository;

/// Builder for creating a [`StateEngine`].
pub struct StateEngineBuilder {
    sqlite: Option<SqliteConfig>,
    backup: BackupConfig,
    remote: Option<Arc<dyn BackupDestination>>,
    local: Option<Arc<dyn BackupDestination>>,
    restore_deadline: Duration,
}

impl std::fmt::Debug for StateEngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateEngineBuilder")
            .field("sqlite", &self.sqlite)
            .field("backup", &self.backup)
            .field("remote", &self.remote.as_ref().map(|_| "..."))
            .field("local", &self.local.as_ref().map(|_| "..."))
            .field("restore_deadline", &self.restore_deadline)
            .finish()
    }
}

impl Default for StateEngineBuilder {
    fn default() -> Self {
        Self {
            sqlite: None,
            backup: BackupConfig::default(),
            remote: None,
            local: None,
            restore_deadline: DEFAULT_RESTORE_DEADLINE,
        }
    }
}

impl StateEngineBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder populated from loaded configuration.
    ///
    /// Creates the object store destination when one is configured. Fails
    /// when the configured backend is not SQLite.
    pub fn from_config(config: &Config) -> Result<Self> {
        let DatabaseBackend::Sqlite(sqlite) = &config.database else {
            return Err(ConfigError::Invalid(
                "ALGOFORGE_DATABASE_TYPE",
                "the durable engine requires 'sqlite'",
            )
            .into());
        };

        let mut builder = Self::new()
            .sqlite(sqlite.clone())
            .backup(config.backup.clone())
            .restore_deadline(config.restore_deadline);

        if let Some(object_store) = &config.object_store {
            builder = builder.remote(Arc::new(ObjectStoreDestination::new(object_store)?));
        }
        Ok(builder)
    }

    /// Set the store file settings (required).
    pub fn sqlite(mut self, config: SqliteConfig) -> Self {
        self.sqlite = Some(config);
        self
    }

    /// Set backup interval, local directory and retention.
    pub fn backup(mut self, config: BackupConfig) -> Self {
        self.backup = config;
        self
    }

    /// Set the remote primary destination.
    ///
    /// Default: none, every artifact goes to the local destination.
    pub fn remote(mut self, destination: Arc<dyn BackupDestination>) -> Self {
        self.remote = Some(destination);
        self
    }

    /// Override the local fallback destination.
    ///
    /// Default: a [`LocalDirDestination`] at the backup config's `local_dir`.
    pub fn local(mut self, destination: Arc<dyn BackupDestination>) -> Self {
        self.local = Some(destination);
        self
    }

    /// Set the hard deadline for startup reconciliation.
    ///
    /// Default: 300 seconds
    pub fn restore_deadline(mut self, deadline: Duration) -> Self {
        self.restore_deadline = deadline;
        self
    }

    /// Build the engine configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<StateEngineConfig> {
        let sqlite = self
            .sqlite
            .ok_or(ConfigError::Missing("ALGOFORGE_SQLITE_PATH"))?;

        let local = self
            .local
            .unwrap_or_else(|| Arc::new(LocalDirDestination::new(self.backup.local_dir.clone())));

        Ok(StateEngineConfig {
            sqlite,
            backup: self.backup,
            remote: self.remote,
            local,
            restore_deadline: self.restore_deadline,
        })
    }
}

/// Configuration for a [`StateEngine`].
pub struct StateEngineConfig {
    sqlite: SqliteConfig,
    backup: BackupConfig,
    remote: Option<Arc<dyn BackupDestination>>,
    local: Arc<dyn BackupDestination>,
    restore_deadline: Duration,
}

impl std::fmt::Debug for StateEngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateEngineConfig")
            .field("sqlite", &self.sqlite)
            .field("backup", &self.backup)
            .field("remote", &self.remote.is_some())
            .field("restore_deadline", &self.restore_deadline)
            .finish()
    }
}

impl StateEngineConfig {
    /// Open, configure and migrate the store, reconcile it against the
    /// backups, then start the backup scheduler.
    ///
    /// Fails only when the store cannot be opened or configured, or when it
    /// is corrupted and no backup could replace it.
    pub async fn start(self) -> Result<StateEngine> {
        let provider = Arc::new(SqliteProvider::open(self.sqlite).await?);
        provider.configure().await?;

        match provider.migrate().await {
            Ok(()) => {}
            Err(e @ StoreError::Corruption { .. }) => {
                warn!(error = %e, "Migrations could not run on a damaged store, reconciling first");
            }
            Err(e) => {
                close_quietly(&provider).await;
                return Err(e);
            }
        }

        let ledger = Arc::new(VersionLedger::new(provider.pool().clone()));
        let reconciler = Reconciler::new(
            &provider,
            ledger.clone(),
            self.remote.clone(),
            self.local.clone(),
            self.restore_deadline,
        );

        let outcome = match reconciler.reconcile().await {
            Ok(outcome) => outcome,
            Err(e) => {
                close_quietly(&provider).await;
                return Err(e);
            }
        };

        let publisher = Arc::new(BackupPublisher::new(
            provider.clone(),
            self.remote,
            self.local,
            self.backup.retention,
        ));
        let scheduler = BackupScheduler::new(publisher.clone(), self.backup.interval);
        let scheduler_shutdown = scheduler.shutdown_handle();
        let scheduler_handle = tokio::spawn(async move { scheduler.run().await });

        let repository = EntityRepository::new(provider.pool().clone(), ledger.clone());

        info!(
            path = %provider.path().display(),
            outcome = outcome_label(&outcome),
            backup_interval_secs = self.backup.interval.as_secs(),
            "StateEngine started"
        );

        Ok(StateEngine {
            provider,
            ledger,
            repository,
            publisher,
            outcome,
            scheduler_shutdown,
            scheduler_handle,
        })
    }
}

/// A running durable state engine.
///
/// The engine manages:
/// - the WAL-backed store and its checkpoint task
/// - the backup scheduler
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct StateEngine {
    provider: Arc<SqliteProvider>,
    ledger: Arc<VersionLedger>,
    repository: EntityRepository,
    publisher: Arc<BackupPublisher>,
    outcome: ReconcileOutcome,
    scheduler_shutdown: Arc<Notify>,
    scheduler_handle: JoinHandle<()>,
}

impl std::fmt::Debug for StateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateEngine")
            .field("provider", &self.provider)
            .field("outcome", &outcome_label(&self.outcome))
            .finish()
    }
}

impl StateEngine {
    /// Create a new builder for configuring the engine.
    pub fn builder() -> StateEngineBuilder {
        StateEngineBuilder::new()
    }

    /// The live connection pool for the API layer.
    pub fn handle(&self) -> &SqlitePool {
        self.provider.pool()
    }

    /// The store provider.
    pub fn provider(&self) -> &Arc<SqliteProvider> {
        &self.provider
    }

    /// Entity mutations that keep the ledger current.
    pub fn repository(&self) -> &EntityRepository {
        &self.repository
    }

    /// The version ledger.
    pub fn ledger(&self) -> &Arc<VersionLedger> {
        &self.ledger
    }

    /// The backup publisher, for on-demand runs.
    pub fn publisher(&self) -> &Arc<BackupPublisher> {
        &self.publisher
    }

    /// What startup reconciliation decided.
    pub fn reconcile_outcome(&self) -> &ReconcileOutcome {
        &self.outcome
    }

    /// Check if the backup scheduler is still running.
    pub fn is_running(&self) -> bool {
        !self.scheduler_handle.is_finished()
    }

    /// Gracefully shut down the engine.
    ///
    /// Stops the scheduler, publishes one last snapshot and the final raw
    /// copy, waits for pruning and closes the store. Backup failures are
    /// logged; only a failure to close the store is returned.
    pub async fn shutdown(self) -> Result<()> {
        info!("StateEngine shutting down...");

        self.scheduler_shutdown.notify_one();
        if let Err(e) = self.scheduler_handle.await {
            error!(error = %e, "Backup scheduler task panicked");
        }

        if let Err(e) = self.publisher.run_once().await {
            error!(error = %e, "Final backup run failed");
        }
        match self.publisher.publish_final_file().await {
            Ok(Some(_)) => {}
            Ok(None) => warn!("Final store copy could not be written to any destination"),
            Err(e) => error!(error = %e, "Final store copy failed"),
        }
        self.publisher.wait_for_prune().await;

        self.provider.close().await?;
        info!("StateEngine shutdown complete");
        Ok(())
    }
}

fn outcome_label(outcome: &ReconcileOutcome) -> &'static str {
    match outcome {
        ReconcileOutcome::FirstRun => "first_run",
        ReconcileOutcome::EmptyStore(_) => "empty_store",
        ReconcileOutcome::CurrentIsNewest(_) => "current_is_newest",
        ReconcileOutcome::Restored(_) => "restored",
        ReconcileOutcome::RestoreFailed { .. } => "restore_failed",
        ReconcileOutcome::TimedOut { .. } => "timed_out",
    }
}

async fn close_quietly(provider: &SqliteProvider) {
    if let Err(e) = provider.close().await {
        warn!(error = %e, "Failed to close store after startup failure");
    }
}
