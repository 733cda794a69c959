// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup destinations.
//!
//! The publisher and the reconciler only need to put, get, list and delete
//! named objects. Names are flat (`latest.json`, `backup-20250601-100000.json`,
//! ...); each destination decides where they physically live.

pub mod local;
pub mod object_store;

pub use self::local::LocalDirDestination;
pub use self::object_store::ObjectStoreDestination;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Role of a destination in the fallback cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    /// Object store, tried first.
    RemotePrimary,
    /// Local directory, used when the remote fails or is not configured.
    LocalFallback,
}

impl DestinationKind {
    /// Label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RemotePrimary => "remote",
            Self::LocalFallback => "local",
        }
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored object as reported by `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object name relative to the destination.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time, when the destination reports one.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Narrow object interface shared by the remote and local destinations.
#[async_trait]
pub trait BackupDestination: Send + Sync {
    /// Role of this destination.
    fn kind(&self) -> DestinationKind;

    /// Human-readable location, for logs and provenance records.
    fn location(&self, name: &str) -> String;

    /// Store `data` under `name`, replacing any existing object.
    async fn put(&self, name: &str, data: &[u8], content_type: &str) -> Result<()>;

    /// Fetch `name`, or `None` when it does not exist.
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Objects whose name starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Remove `name`. Removing a missing object is not an error.
    async fn delete(&self, name: &str) -> Result<()>;
}
