// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entity mutations used by the API layer.
//!
//! Every mutation that changes a row is followed by a ledger entry, so the
//! ledger version moves exactly once per committed change. Mutations that
//! match nothing (unknown id) leave the ledger untouched.

use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::ledger::VersionLedger;
use crate::managed::ManagedTable;
use crate::models::{
    Algorithm, AlgorithmVersion, Job, JobStatus, NewAlgorithm, NewJob, NewPresetData, NewVersion,
    PresetData, UpdatedBy,
};
use crate::retry::RetryPolicy;

/// CRUD over the managed tables, versioned through the ledger.
#[derive(Debug, Clone)]
pub struct EntityRepository {
    pool: SqlitePool,
    ledger: Arc<VersionLedger>,
    retry: RetryPolicy,
}

impl EntityRepository {
    /// Repository writing through `pool` and versioning through `ledger`.
    pub fn new(pool: SqlitePool, ledger: Arc<VersionLedger>) -> Self {
        Self {
            pool,
            ledger,
            retry: RetryPolicy::default(),
        }
    }

    /// The ledger this repository reports to.
    pub fn ledger(&self) -> &Arc<VersionLedger> {
        &self.ledger
    }

    async fn committed(&self, operation: &str) -> Result<i64> {
        let version = self.ledger.record_version(UpdatedBy::Api).await?;
        debug!(operation, version, "Mutation committed");
        Ok(version)
    }

    // ---------------------------------------------------------------------
    // Algorithms
    // ---------------------------------------------------------------------

    /// Register a new algorithm.
    #[instrument(skip(self, new), fields(name = %new.name))]
    pub async fn create_algorithm(&self, new: NewAlgorithm) -> Result<Algorithm> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let algorithm = self
            .retry
            .run("create_algorithm", || async {
                let row = sqlx::query_as::<_, Algorithm>(
                    r#"
                    INSERT INTO algorithms
                        (id, name, description, language, platform, category, entrypoint,
                         tags, preset_data_id, current_version_id, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
                    RETURNING *
                    "#,
                )
                .bind(&id)
                .bind(&new.name)
                .bind(&new.description)
                .bind(&new.language)
                .bind(&new.platform)
                .bind(&new.category)
                .bind(&new.entrypoint)
                .bind(&new.tags)
                .bind(&new.preset_data_id)
                .bind(now)
                .bind(now)
                .fetch_one(&self.pool)
                .await?;
                Ok::<_, StoreError>(row)
            })
            .await?;

        self.committed("create_algorithm").await?;
        Ok(algorithm)
    }

    /// Replace the descriptive fields of an algorithm.
    ///
    /// Returns `None` when no algorithm has this id.
    #[instrument(skip(self, changes))]
    pub async fn update_algorithm(
        &self,
        id: &str,
        changes: NewAlgorithm,
    ) -> Result<Option<Algorithm>> {
        let now = Utc::now();

        let updated = self
            .retry
            .run("update_algorithm", || async {
                let row = sqlx::query_as::<_, Algorithm>(
                    r#"
                    UPDATE algorithms
                    SET name = ?, description = ?, language = ?, platform = ?, category = ?,
                        entrypoint = ?, tags = ?, preset_data_id = ?, updated_at = ?
                    WHERE id = ?
                    RETURNING *
                    "#,
                )
                .bind(&changes.name)
                .bind(&changes.description)
                .bind(&changes.language)
                .bind(&changes.platform)
                .bind(&changes.category)
                .bind(&changes.entrypoint)
                .bind(&changes.tags)
                .bind(&changes.preset_data_id)
                .bind(now)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
                Ok::<_, StoreError>(row)
            })
            .await?;

        if updated.is_some() {
            self.committed("update_algorithm").await?;
        }
        Ok(updated)
    }

    /// Delete an algorithm and, by cascade, its versions.
    #[instrument(skip(self))]
    pub async fn delete_algorithm(&self, id: &str) -> Result<bool> {
        let deleted = self
            .retry
            .run("delete_algorithm", || async {
                let result = sqlx::query("DELETE FROM algorithms WHERE id = ?")
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                Ok::<_, StoreError>(result.rows_affected() > 0)
            })
            .await?;

        if deleted {
            self.committed("delete_algorithm").await?;
        }
        Ok(deleted)
    }

    /// Fetch one algorithm.
    pub async fn get_algorithm(&self, id: &str) -> Result<Option<Algorithm>> {
        let algorithm = sqlx::query_as::<_, Algorithm>("SELECT * FROM algorithms WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(algorithm)
    }

    /// Algorithms, optionally filtered by category, newest first.
    pub async fn list_algorithms(&self, category: Option<&str>) -> Result<Vec<Algorithm>> {
        let algorithms = sqlx::query_as::<_, Algorithm>(
            r#"
            SELECT * FROM algorithms
            WHERE (?1 IS NULL OR category = ?1)
            ORDER BY created_at DESC, id
            "#,
        )
        .bind(category)
        .fetch_all(&self.pool)
        .await?;

        Ok(algorithms)
    }

    // ---------------------------------------------------------------------
    // Versions
    // ---------------------------------------------------------------------

    /// Add the next version of an algorithm and make it current.
    ///
    /// Returns `None` when the algorithm does not exist.
    #[instrument(skip(self, new))]
    pub async fn add_version(
        &self,
        algorithm_id: &str,
        new: NewVersion,
    ) -> Result<Option<AlgorithmVersion>> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let version = self
            .retry
            .run("add_version", || async {
                let mut tx = self.pool.begin().await?;

                let exists: Option<i64> =
                    sqlx::query_scalar("SELECT 1 FROM algorithms WHERE id = ?")
                        .bind(algorithm_id)
                        .fetch_optional(&mut *tx)
                        .await?;
                if exists.is_none() {
                    return Ok(None);
                }

                let row = sqlx::query_as::<_, AlgorithmVersion>(
                    r#"
                    INSERT INTO versions
                        (id, algorithm_id, version_number, minio_path, source_code_file,
                         commit_message, created_at)
                    SELECT ?1, ?2, COALESCE(MAX(version_number), 0) + 1, ?3, ?4, ?5, ?6
                    FROM versions WHERE algorithm_id = ?2
                    RETURNING *
                    "#,
                )
                .bind(&id)
                .bind(algorithm_id)
                .bind(&new.minio_path)
                .bind(&new.source_code_file)
                .bind(&new.commit_message)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;

                sqlx::query(
                    "UPDATE algorithms SET current_version_id = ?, updated_at = ? WHERE id = ?",
                )
                .bind(&id)
                .bind(now)
                .bind(algorithm_id)
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok::<_, StoreError>(Some(row))
            })
            .await?;

        if version.is_some() {
            self.committed("add_version").await?;
        }
        Ok(version)
    }

    /// Versions of an algorithm, oldest first.
    pub async fn list_versions(&self, algorithm_id: &str) -> Result<Vec<AlgorithmVersion>> {
        let versions = sqlx::query_as::<_, AlgorithmVersion>(
            "SELECT * FROM versions WHERE algorithm_id = ? ORDER BY version_number",
        )
        .bind(algorithm_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(versions)
    }

    // ---------------------------------------------------------------------
    // Preset data
    // ---------------------------------------------------------------------

    /// Register a preset input file.
    #[instrument(skip(self, new), fields(filename = %new.filename))]
    pub async fn create_preset_data(&self, new: NewPresetData) -> Result<PresetData> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let preset = self
            .retry
            .run("create_preset_data", || async {
                let row = sqlx::query_as::<_, PresetData>(
                    r#"
                    INSERT INTO preset_data (id, filename, category, minio_path, minio_url, created_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    RETURNING *
                    "#,
                )
                .bind(&id)
                .bind(&new.filename)
                .bind(&new.category)
                .bind(&new.minio_path)
                .bind(&new.minio_url)
                .bind(now)
                .fetch_one(&self.pool)
                .await?;
                Ok::<_, StoreError>(row)
            })
            .await?;

        self.committed("create_preset_data").await?;
        Ok(preset)
    }

    // ---------------------------------------------------------------------
    // Jobs
    // ---------------------------------------------------------------------

    /// Submit a job in the `pending` state.
    #[instrument(skip(self, new))]
    pub async fn create_job(&self, new: NewJob) -> Result<Job> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let job = self
            .retry
            .run("create_job", || async {
                let row = sqlx::query_as::<_, Job>(
                    r#"
                    INSERT INTO jobs
                        (id, algorithm_id, algorithm_name, mode, status, input_params,
                         input_url, created_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    RETURNING *
                    "#,
                )
                .bind(&id)
                .bind(&new.algorithm_id)
                .bind(&new.algorithm_name)
                .bind(&new.mode)
                .bind(JobStatus::Pending.as_str())
                .bind(&new.input_params)
                .bind(&new.input_url)
                .bind(now)
                .fetch_one(&self.pool)
                .await?;
                Ok::<_, StoreError>(row)
            })
            .await?;

        self.committed("create_job").await?;
        Ok(job)
    }

    /// Move a job to `status`.
    ///
    /// Entering `running` stamps `started_at`; entering a terminal state
    /// stamps `finished_at` and the elapsed `cost_time_ms`.
    #[instrument(skip(self), fields(status = %status))]
    pub async fn update_job_status(&self, id: &str, status: JobStatus) -> Result<Option<Job>> {
        let updated = self
            .retry
            .run("update_job_status", || async {
                let mut tx = self.pool.begin().await?;

                let Some(mut job) = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?
                else {
                    return Ok(None);
                };

                let now = Utc::now();
                job.status = status.as_str().to_string();
                if status == JobStatus::Running {
                    job.started_at = Some(now);
                }
                if status.is_terminal() {
                    job.finished_at = Some(now);
                    job.cost_time_ms = job
                        .started_at
                        .map_or(0, |started| (now - started).num_milliseconds().max(0));
                }

                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = ?, started_at = ?, finished_at = ?, cost_time_ms = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&job.status)
                .bind(job.started_at)
                .bind(job.finished_at)
                .bind(job.cost_time_ms)
                .bind(id)
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok::<_, StoreError>(Some(job))
            })
            .await?;

        if updated.is_some() {
            self.committed("update_job_status").await?;
        }
        Ok(updated)
    }

    /// Fetch one job.
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    /// Rows currently in `table`.
    pub async fn count(&self, table: &ManagedTable) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM \"{}\"", table.name);
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }
}
