// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Row types for the managed tables and the version ledger.

#![allow(missing_docs)] // Entity fields mirror their column names

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who wrote a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatedBy {
    /// A mutation through the API layer.
    Api,
    /// A startup restore from a backup.
    Restore,
    /// The engine itself (initialisation, maintenance).
    System,
}

impl UpdatedBy {
    /// Value stored in the `updated_by` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Restore => "restore",
            Self::System => "system",
        }
    }
}

impl fmt::Display for UpdatedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdatedBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(Self::Api),
            "restore" => Ok(Self::Restore),
            "system" => Ok(Self::System),
            other => Err(format!("unknown ledger writer '{other}'")),
        }
    }
}

/// One row of the `database_metadata` ledger.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LedgerEntry {
    /// Row id.
    pub id: i64,
    /// Data version this entry records.
    pub version: i64,
    /// When the data was last changed.
    pub last_updated_at: DateTime<Utc>,
    /// Writer, see [`UpdatedBy`].
    pub updated_by: String,
    /// When this entry was written.
    pub checkpoint_at: DateTime<Utc>,
    /// Rows in the primary managed table at that moment.
    pub record_count: i64,
}

/// A registered algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Algorithm {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub language: Option<String>,
    pub platform: Option<String>,
    pub category: Option<String>,
    pub entrypoint: Option<String>,
    pub tags: Option<String>,
    pub preset_data_id: Option<String>,
    pub current_version_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when registering an algorithm.
#[derive(Debug, Clone, Default)]
pub struct NewAlgorithm {
    pub name: String,
    pub description: Option<String>,
    pub language: Option<String>,
    pub platform: Option<String>,
    pub category: Option<String>,
    pub entrypoint: Option<String>,
    pub tags: Option<String>,
    pub preset_data_id: Option<String>,
}

/// A source version of an algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlgorithmVersion {
    pub id: String,
    pub algorithm_id: String,
    pub version_number: i64,
    pub minio_path: Option<String>,
    pub source_code_file: Option<String>,
    pub commit_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when uploading a new algorithm version.
#[derive(Debug, Clone, Default)]
pub struct NewVersion {
    pub minio_path: Option<String>,
    pub source_code_file: Option<String>,
    pub commit_message: Option<String>,
}

/// A preset input file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PresetData {
    pub id: String,
    pub filename: String,
    pub category: Option<String>,
    pub minio_path: Option<String>,
    pub minio_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when registering a preset file.
#[derive(Debug, Clone, Default)]
pub struct NewPresetData {
    pub filename: String,
    pub category: Option<String>,
    pub minio_path: Option<String>,
    pub minio_url: Option<String>,
}

/// An algorithm execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: String,
    pub algorithm_id: Option<String>,
    pub algorithm_name: Option<String>,
    pub mode: Option<String>,
    pub status: String,
    pub input_params: Option<String>,
    pub input_url: Option<String>,
    pub output_url: Option<String>,
    pub log_url: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cost_time_ms: i64,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when submitting a job.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub algorithm_id: Option<String>,
    pub algorithm_name: Option<String>,
    pub mode: Option<String>,
    pub input_params: Option<String>,
    pub input_url: Option<String>,
}

/// Lifecycle states a job moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Value stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// True for states a job never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
