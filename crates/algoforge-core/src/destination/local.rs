// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local directory destination.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{BackupDestination, DestinationKind, ObjectInfo};
use crate::error::{Result, StoreError};

/// Stores each object as a file directly under `root`.
#[derive(Debug, Clone)]
pub struct LocalDirDestination {
    root: PathBuf,
}

impl LocalDirDestination {
    /// Destination rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the objects.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(StoreError::io(
                "local_destination",
                format!("invalid object name '{name}'"),
            ));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl BackupDestination for LocalDirDestination {
    fn kind(&self) -> DestinationKind {
        DestinationKind::LocalFallback
    }

    fn location(&self, name: &str) -> String {
        self.root.join(name).display().to_string()
    }

    async fn put(&self, name: &str, data: &[u8], _content_type: &str) -> Result<()> {
        let path = self.path_for(name)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::io("create_dir", format!("{}: {e}", self.root.display())))?;

        // Write next to the target and rename so readers never see a torn file.
        let staging = self.root.join(format!(".{name}.partial"));
        tokio::fs::write(&staging, data)
            .await
            .map_err(|e| StoreError::io("write", format!("{}: {e}", staging.display())))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| StoreError::io("rename", format!("{}: {e}", path.display())))?;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(name)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io("read", format!("{}: {e}", path.display()))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::io(
                    "list",
                    format!("{}: {e}", self.root.display()),
                ));
            }
        };

        let mut objects = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !name.starts_with(prefix) || name.starts_with('.') {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            objects.push(ObjectInfo {
                name,
                size: metadata.len(),
                last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io("delete", format!("{}: {e}", path.display()))),
        }
    }
}
