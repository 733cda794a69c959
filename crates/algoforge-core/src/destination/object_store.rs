// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! MinIO / S3-compatible destination.
//!
//! Objects live under a key prefix (`database-backup/` by default) in one
//! bucket. The bucket is checked, and created if missing, on the first write
//! rather than at construction, so an unreachable object store never blocks
//! startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use s3::BucketConfiguration;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{BackupDestination, DestinationKind, ObjectInfo};
use crate::config::ObjectStoreConfig;
use crate::error::{Result, StoreError};

/// Backup destination backed by an S3-compatible bucket.
pub struct ObjectStoreDestination {
    bucket: Box<Bucket>,
    bucket_name: String,
    region: Region,
    credentials: Credentials,
    prefix: String,
    bucket_ready: OnceCell<()>,
}

impl std::fmt::Debug for ObjectStoreDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreDestination")
            .field("bucket", &self.bucket_name)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl ObjectStoreDestination {
    /// Build the client. No network traffic happens here.
    pub fn new(config: &ObjectStoreConfig) -> Result<Self> {
        let region = Region::Custom {
            region: config.region.clone(),
            endpoint: config.endpoint_url(),
        };
        let credentials = Credentials::new(
            Some(config.access_key.as_str()),
            Some(config.secret_key.as_str()),
            None,
            None,
            None,
        )?;

        let mut bucket =
            Bucket::new(&config.bucket, region.clone(), credentials.clone())?.with_path_style();
        bucket.set_request_timeout(Some(config.request_timeout));

        Ok(Self {
            bucket,
            bucket_name: config.bucket.clone(),
            region,
            credentials,
            prefix: config.prefix.clone(),
            bucket_ready: OnceCell::new(),
        })
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    async fn ensure_bucket(&self) -> Result<()> {
        self.bucket_ready
            .get_or_try_init(|| async {
                if !self.bucket.exists().await? {
                    Bucket::create_with_path_style(
                        &self.bucket_name,
                        self.region.clone(),
                        self.credentials.clone(),
                        BucketConfiguration::default(),
                    )
                    .await?;
                    info!(bucket = %self.bucket_name, "Created backup bucket");
                }
                Ok::<(), StoreError>(())
            })
            .await?;
        Ok(())
    }
}

fn is_not_found(err: &S3Error) -> bool {
    matches!(err, S3Error::HttpFailWithBody(404, _))
}

#[async_trait]
impl BackupDestination for ObjectStoreDestination {
    fn kind(&self) -> DestinationKind {
        DestinationKind::RemotePrimary
    }

    fn location(&self, name: &str) -> String {
        format!("s3://{}/{}", self.bucket_name, self.key(name))
    }

    async fn put(&self, name: &str, data: &[u8], content_type: &str) -> Result<()> {
        self.ensure_bucket().await?;
        self.bucket
            .put_object_with_content_type(self.key(name), data, content_type)
            .await?;
        debug!(key = %self.key(name), bytes = data.len(), "Uploaded object");
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match self.bucket.get_object(self.key(name)).await {
            Ok(response) => Ok(Some(response.bytes().to_vec())),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let pages = match self.bucket.list(self.key(prefix), None).await {
            Ok(pages) => pages,
            Err(e) if is_not_found(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut objects: Vec<ObjectInfo> = pages
            .into_iter()
            .flat_map(|page| page.contents)
            .filter_map(|object| {
                let name = object.key.strip_prefix(&self.prefix)?.to_string();
                // Only direct children of the prefix.
                if name.contains('/') {
                    return None;
                }
                Some(ObjectInfo {
                    name,
                    size: object.size,
                    last_modified: DateTime::parse_from_rfc3339(&object.last_modified)
                        .ok()
                        .map(|t| t.with_timezone(&Utc)),
                })
            })
            .collect();

        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.bucket.delete_object(self.key(name)).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
