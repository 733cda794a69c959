// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Platform storage configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Which store backend to open
    pub database: DatabaseBackend,
    /// MinIO / S3 remote backup destination, if configured
    pub object_store: Option<ObjectStoreConfig>,
    /// Backup scheduling, local fallback and retention
    pub backup: BackupConfig,
    /// Hard deadline for startup reconciliation
    pub restore_deadline: Duration,
}

/// Store backend selected at construction time.
#[derive(Debug, Clone)]
pub enum DatabaseBackend {
    /// Embedded SQLite store with the full durability engine.
    Sqlite(SqliteConfig),
    /// External PostgreSQL server (durability is the server's concern).
    Postgres(PostgresConfig),
}

/// Embedded store settings.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path of the store file
    pub path: PathBuf,
    /// Connection pool size
    pub max_connections: u32,
    /// Interval between WAL checkpoint ticks
    pub checkpoint_interval: Duration,
    /// Page cache size in KiB
    pub cache_size_kib: i64,
    /// How long a connection waits on a locked store before reporting busy
    pub busy_timeout: Duration,
}

impl SqliteConfig {
    /// Settings for a store file at `path`, everything else defaulted.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/algorithm-platform.db"),
            max_connections: 5,
            checkpoint_interval: Duration::from_secs(30),
            cache_size_kib: 64 * 1024,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// External PostgreSQL settings.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Connection URL
    pub url: String,
    /// Connection pool size
    pub max_connections: u32,
}

/// Remote object-store settings.
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    /// Host and port, without scheme (e.g. `minio:9000`)
    pub endpoint: String,
    /// Access key
    pub access_key: String,
    /// Secret key
    pub secret_key: String,
    /// Bucket holding the backups
    pub bucket: String,
    /// Region name passed to the S3 client
    pub region: String,
    /// Use https instead of http
    pub use_ssl: bool,
    /// Key prefix under which every backup object lives
    pub prefix: String,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl ObjectStoreConfig {
    /// Endpoint URL including the scheme.
    pub fn endpoint_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}", scheme, self.endpoint)
    }
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "localhost:9000".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            bucket: "algorithm-platform".to_string(),
            region: "us-east-1".to_string(),
            use_ssl: false,
            prefix: "database-backup/".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// How many artifacts of each kind survive pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Timestamped snapshot documents kept remotely
    pub remote_snapshots: usize,
    /// Timestamped raw store copies kept remotely
    pub remote_files: usize,
    /// Timestamped snapshot documents kept locally
    pub local_snapshots: usize,
    /// Timestamped raw store copies kept locally
    pub local_files: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            remote_snapshots: 10,
            remote_files: 5,
            local_snapshots: 5,
            local_files: 3,
        }
    }
}

/// Backup publisher settings.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Interval between scheduled publish runs
    pub interval: Duration,
    /// Local fallback directory
    pub local_dir: PathBuf,
    /// Retention counts
    pub retention: RetentionPolicy,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            local_dir: PathBuf::from("./data/backups"),
            retention: RetentionPolicy::default(),
        }
    }
}

/// Default restore deadline.
pub const DEFAULT_RESTORE_DEADLINE: Duration = Duration::from_secs(300);

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `ALGOFORGE_DATABASE_TYPE`: `sqlite` or `postgres` (default: sqlite)
    /// - `ALGOFORGE_SQLITE_PATH`: store file (default: ./data/algorithm-platform.db)
    /// - `ALGOFORGE_SQLITE_MAX_CONNECTIONS`: pool size (default: 5)
    /// - `ALGOFORGE_WAL_CHECKPOINT_INTERVAL_SECS`: checkpoint tick (default: 30)
    /// - `ALGOFORGE_POSTGRES_MAX_CONNECTIONS`: pool size (default: 25)
    /// - `ALGOFORGE_MINIO_ENDPOINT`: enables the remote destination when set
    /// - `ALGOFORGE_MINIO_ACCESS_KEY` / `ALGOFORGE_MINIO_SECRET_KEY` (default: minioadmin)
    /// - `ALGOFORGE_MINIO_BUCKET` (default: algorithm-platform)
    /// - `ALGOFORGE_MINIO_REGION` (default: us-east-1)
    /// - `ALGOFORGE_MINIO_USE_SSL` (default: false)
    /// - `ALGOFORGE_LOCAL_MODE`: point the MinIO endpoint at localhost:9000
    /// - `ALGOFORGE_BACKUP_INTERVAL_SECS` (default: 300)
    /// - `ALGOFORGE_BACKUP_DIR` (default: ./data/backups)
    /// - `ALGOFORGE_RESTORE_DEADLINE_SECS` (default: 300)
    /// - `ALGOFORGE_RETAIN_REMOTE_SNAPSHOTS` / `_REMOTE_FILES` / `_LOCAL_SNAPSHOTS` / `_LOCAL_FILES`
    ///   (defaults: 10 / 5 / 5 / 3)
    ///
    /// Required when `ALGOFORGE_DATABASE_TYPE=postgres`:
    /// - `ALGOFORGE_DATABASE_URL`: PostgreSQL connection string
    pub fn from_env() -> Result<Self, ConfigError> {
        let database = match env_or("ALGOFORGE_DATABASE_TYPE", "sqlite")
            .to_ascii_lowercase()
            .as_str()
        {
            "sqlite" => DatabaseBackend::Sqlite(SqliteConfig {
                path: PathBuf::from(env_or(
                    "ALGOFORGE_SQLITE_PATH",
                    "./data/algorithm-platform.db",
                )),
                max_connections: parse_env(
                    "ALGOFORGE_SQLITE_MAX_CONNECTIONS",
                    5,
                    "must be a positive integer",
                )?,
                checkpoint_interval: Duration::from_secs(parse_env(
                    "ALGOFORGE_WAL_CHECKPOINT_INTERVAL_SECS",
                    30,
                    "must be a number of seconds",
                )?),
                ..SqliteConfig::default()
            }),
            "postgres" | "postgresql" => DatabaseBackend::Postgres(PostgresConfig {
                url: std::env::var("ALGOFORGE_DATABASE_URL")
                    .map_err(|_| ConfigError::Missing("ALGOFORGE_DATABASE_URL"))?,
                max_connections: parse_env(
                    "ALGOFORGE_POSTGRES_MAX_CONNECTIONS",
                    25,
                    "must be a positive integer",
                )?,
            }),
            _ => {
                return Err(ConfigError::Invalid(
                    "ALGOFORGE_DATABASE_TYPE",
                    "must be 'sqlite' or 'postgres'",
                ));
            }
        };

        let object_store = match std::env::var("ALGOFORGE_MINIO_ENDPOINT") {
            Ok(endpoint) if !endpoint.trim().is_empty() => {
                let defaults = ObjectStoreConfig::default();
                let local_mode = parse_bool("ALGOFORGE_LOCAL_MODE")?;
                Some(ObjectStoreConfig {
                    endpoint: if local_mode {
                        "localhost:9000".to_string()
                    } else {
                        endpoint.trim().to_string()
                    },
                    access_key: env_or("ALGOFORGE_MINIO_ACCESS_KEY", &defaults.access_key),
                    secret_key: env_or("ALGOFORGE_MINIO_SECRET_KEY", &defaults.secret_key),
                    bucket: env_or("ALGOFORGE_MINIO_BUCKET", &defaults.bucket),
                    region: env_or("ALGOFORGE_MINIO_REGION", &defaults.region),
                    use_ssl: parse_bool("ALGOFORGE_MINIO_USE_SSL")?,
                    ..defaults
                })
            }
            _ => None,
        };

        let defaults = RetentionPolicy::default();
        let retention = RetentionPolicy {
            remote_snapshots: parse_env(
                "ALGOFORGE_RETAIN_REMOTE_SNAPSHOTS",
                defaults.remote_snapshots,
                "must be a non-negative integer",
            )?,
            remote_files: parse_env(
                "ALGOFORGE_RETAIN_REMOTE_FILES",
                defaults.remote_files,
                "must be a non-negative integer",
            )?,
            local_snapshots: parse_env(
                "ALGOFORGE_RETAIN_LOCAL_SNAPSHOTS",
                defaults.local_snapshots,
                "must be a non-negative integer",
            )?,
            local_files: parse_env(
                "ALGOFORGE_RETAIN_LOCAL_FILES",
                defaults.local_files,
                "must be a non-negative integer",
            )?,
        };

        let backup = BackupConfig {
            interval: Duration::from_secs(parse_env(
                "ALGOFORGE_BACKUP_INTERVAL_SECS",
                300,
                "must be a number of seconds",
            )?),
            local_dir: PathBuf::from(env_or("ALGOFORGE_BACKUP_DIR", "./data/backups")),
            retention,
        };

        let restore_deadline = Duration::from_secs(parse_env(
            "ALGOFORGE_RESTORE_DEADLINE_SECS",
            DEFAULT_RESTORE_DEADLINE.as_secs(),
            "must be a number of seconds",
        )?);

        Ok(Self {
            database,
            object_store,
            backup,
            restore_deadline,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(
    key: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, reason)),
        Err(_) => Ok(default),
    }
}

fn parse_bool(key: &'static str) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" | "" => Ok(false),
            _ => Err(ConfigError::Invalid(key, "must be true or false")),
        },
        Err(_) => Ok(false),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
