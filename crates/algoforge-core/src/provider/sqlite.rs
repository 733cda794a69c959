// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded SQLite store with write-ahead logging.
//!
//! Every connection is opened with `journal_mode=WAL`, `synchronous=FULL` and
//! foreign keys enforced. A background task merges the WAL into the main file
//! and truncates it on a fixed interval; [`SqliteProvider::close`] runs one
//! last merge before the pool is released.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::StoreProvider;
use crate::config::SqliteConfig;
use crate::error::{Result, StoreError};
use crate::migrations;

/// Result of one `wal_checkpoint(TRUNCATE)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    /// True when a reader or writer prevented a full checkpoint.
    pub busy: bool,
    /// Frames in the WAL before the checkpoint.
    pub log_frames: i64,
    /// Frames merged into the main file.
    pub checkpointed_frames: i64,
}

/// Page-level statistics of the store file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Pages in the main file.
    pub page_count: i64,
    /// Bytes per page.
    pub page_size: i64,
    /// Unused pages.
    pub freelist_count: i64,
    /// Open connections in the pool.
    pub open_connections: u32,
    /// Idle connections in the pool.
    pub idle_connections: usize,
}

impl StoreStats {
    /// Approximate size of the main file in bytes.
    pub fn file_size(&self) -> i64 {
        self.page_count * self.page_size
    }
}

struct CheckpointTask {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// SQLite-backed store provider.
pub struct SqliteProvider {
    pool: SqlitePool,
    config: SqliteConfig,
    maintenance: Arc<RwLock<()>>,
    checkpoint_task: Mutex<Option<CheckpointTask>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SqliteProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteProvider")
            .field("path", &self.config.path)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl SqliteProvider {
    /// Open (creating if needed) the store file described by `config`.
    ///
    /// Parent directories are created. Nothing runs in the background until
    /// [`StoreProvider::configure`] is called.
    #[instrument(skip(config), fields(path = %config.path.display()))]
    pub async fn open(config: SqliteConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::io(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true)
            .busy_timeout(config.busy_timeout)
            .pragma(
                "cache_size",
                Cow::Owned(format!("-{}", config.cache_size_kib)),
            )
            .pragma("temp_store", Cow::Borrowed("MEMORY"));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| match StoreError::from(e) {
                err @ StoreError::Corruption { .. } => err,
                err => StoreError::io(
                    "open",
                    format!("Failed to open SQLite store at {:?}: {}", config.path, err),
                ),
            })?;

        info!(max_connections = config.max_connections, "SQLite store opened");

        Ok(Self {
            pool,
            config,
            maintenance: Arc::new(RwLock::new(())),
            checkpoint_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// The live connection pool handed to the API layer.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Path of the store file.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Lock that serializes restore against checkpoint ticks.
    ///
    /// Checkpoint ticks take it shared and skip the tick when it is held
    /// exclusively; a restore holds it exclusively for its whole transaction.
    pub fn maintenance_gate(&self) -> Arc<RwLock<()>> {
        self.maintenance.clone()
    }

    /// Merge the WAL into the main file and truncate it.
    pub async fn checkpoint(&self) -> Result<CheckpointStats> {
        checkpoint(&self.pool).await
    }

    /// Run `PRAGMA integrity_check`. Any answer other than `ok` is corruption.
    #[instrument(skip(self))]
    pub async fn integrity_check(&self) -> Result<()> {
        let problems: Vec<String> = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_all(&self.pool)
            .await?;

        match problems.as_slice() {
            [only] if only == "ok" => Ok(()),
            _ => {
                warn!(problems = problems.len(), "Integrity check failed");
                Err(StoreError::Corruption {
                    details: problems.join("; "),
                })
            }
        }
    }

    /// Page-level statistics plus pool usage.
    pub async fn stats(&self) -> Result<StoreStats> {
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;
        let freelist_count: i64 = sqlx::query_scalar("PRAGMA freelist_count")
            .fetch_one(&self.pool)
            .await?;

        Ok(StoreStats {
            page_count,
            page_size,
            freelist_count,
            open_connections: self.pool.size(),
            idle_connections: self.pool.num_idle(),
        })
    }

    /// Rebuild the store file, reclaiming free pages.
    #[instrument(skip(self))]
    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        info!("Store vacuumed");
        Ok(())
    }

    /// Write a transactionally consistent copy of the store to `dest`.
    ///
    /// `dest` must not exist. Concurrent writers are not blocked.
    #[instrument(skip(self, dest), fields(dest = %dest.display()))]
    pub async fn vacuum_into(&self, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        sqlx::query("VACUUM INTO ?")
            .bind(dest.to_string_lossy().into_owned())
            .execute(&self.pool)
            .await?;

        debug!("Consistent store copy written");
        Ok(())
    }

    async fn verify_pragmas(&self) -> Result<()> {
        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;
        if !mode.eq_ignore_ascii_case("wal") {
            return Err(StoreError::WalUnavailable {
                path: self.config.path.display().to_string(),
                mode,
            });
        }

        // 2 = FULL
        let synchronous: i64 = sqlx::query_scalar("PRAGMA synchronous")
            .fetch_one(&self.pool)
            .await?;
        if synchronous != 2 {
            return Err(StoreError::database(
                "configure",
                format!("synchronous is {synchronous}, expected FULL (2)"),
            ));
        }

        let foreign_keys: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&self.pool)
            .await?;
        if foreign_keys != 1 {
            return Err(StoreError::database(
                "configure",
                "foreign key enforcement is disabled",
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl StoreProvider for SqliteProvider {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    #[instrument(skip(self))]
    async fn configure(&self) -> Result<()> {
        self.verify_pragmas().await?;

        let mut task = self.checkpoint_task.lock().await;
        if task.is_none() {
            let shutdown = Arc::new(Notify::new());
            let handle = tokio::spawn(run_checkpoints(
                self.pool.clone(),
                self.maintenance.clone(),
                self.config.checkpoint_interval,
                shutdown.clone(),
            ));
            *task = Some(CheckpointTask { shutdown, handle });
        }

        info!(
            journal_mode = "wal",
            synchronous = "full",
            checkpoint_interval_secs = self.config.checkpoint_interval.as_secs(),
            "SQLite store configured"
        );
        Ok(())
    }

    async fn migrate(&self) -> Result<()> {
        migrations::run_sqlite(&self.pool).await?;
        debug!("SQLite migrations applied");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(task) = self.checkpoint_task.lock().await.take() {
            task.shutdown.notify_one();
            if let Err(e) = task.handle.await
                && !e.is_cancelled()
            {
                warn!(error = %e, "WAL checkpoint task ended abnormally");
            }
        }

        match checkpoint(&self.pool).await {
            Ok(stats) => info!(
                checkpointed_frames = stats.checkpointed_frames,
                busy = stats.busy,
                "Final WAL checkpoint complete"
            ),
            Err(e) => warn!(error = %e, "Final WAL checkpoint failed"),
        }

        if let Err(e) = sqlx::query("PRAGMA optimize").execute(&self.pool).await {
            warn!(error = %e, "PRAGMA optimize failed");
        }

        self.pool.close().await;
        info!("SQLite store closed");
        Ok(())
    }
}

async fn checkpoint(pool: &SqlitePool) -> Result<CheckpointStats> {
    let (busy, log_frames, checkpointed_frames): (i64, i64, i64) =
        sqlx::query_as("PRAGMA wal_checkpoint(TRUNCATE)")
            .fetch_one(pool)
            .await?;

    Ok(CheckpointStats {
        busy: busy != 0,
        log_frames,
        checkpointed_frames,
    })
}

/// Periodic WAL checkpoint loop.
async fn run_checkpoints(
    pool: SqlitePool,
    maintenance: Arc<RwLock<()>>,
    interval: Duration,
    shutdown: Arc<Notify>,
) {
    debug!(interval_secs = interval.as_secs(), "WAL checkpoint task started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => {
                debug!("WAL checkpoint task stopping");
                break;
            }

            _ = tokio::time::sleep(interval) => {
                let Ok(_guard) = maintenance.try_read() else {
                    debug!("Restore in progress, skipping WAL checkpoint");
                    continue;
                };

                match checkpoint(&pool).await {
                    Ok(stats) if stats.busy => {
                        debug!(log_frames = stats.log_frames, "WAL checkpoint could not complete, store busy");
                    }
                    Ok(stats) => {
                        debug!(checkpointed_frames = stats.checkpointed_frames, "WAL checkpoint complete");
                    }
                    Err(e) => warn!(error = %e, "WAL checkpoint failed"),
                }
            }
        }
    }
}

/// Path of the `-wal` sidecar file for a store at `path`.
pub fn wal_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push("-wal");
    PathBuf::from(name)
}
