//! Backup bucket lifecycle
//!
//! Every vendor manages its bucket through an [`ObjectStorage`] transport,
//! so creation, purge and deletion semantics are shared. Vendors differ only
//! in transport setup and in the configuration handed to the backup agent.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use canopy_common::{Error, Result};

use crate::storage::{ObjectStorage, StorageError};
use crate::types::{BackupConfig, BucketParams, ProviderType};

/// Environment variable naming the bucket for the backup agent
pub const STORAGE_CONTAINER_ENV: &str = "STORAGE_CONTAINER";

/// Backup bucket operations for one vendor and one bucket
#[async_trait]
pub trait BackupProvider: Send + Sync {
    /// Vendor this provider targets
    fn provider_type(&self) -> ProviderType;

    /// The bucket being managed
    fn bucket(&self) -> &BucketParams;

    /// Create the bucket; an existing bucket we can reach is success
    async fn create_bucket(&self) -> Result<()>;

    /// Purge every object and delete the bucket; a missing bucket is success
    async fn delete_bucket(&self) -> Result<()>;

    /// Whether the bucket exists
    async fn bucket_exists(&self) -> Result<bool>;

    /// Agent configuration with credentials mounted at `mount_path`
    fn compute_backup_config(&self, mount_path: &str) -> Result<BackupConfig>;
}

/// Shared bucket lifecycle over an object storage transport
#[derive(Clone)]
pub struct BucketLifecycle {
    storage: Arc<dyn ObjectStorage>,
    bucket: BucketParams,
}

impl BucketLifecycle {
    /// Manage `bucket` through `storage`
    pub fn new(storage: Arc<dyn ObjectStorage>, bucket: BucketParams) -> Self {
        Self { storage, bucket }
    }

    /// The bucket being managed
    pub fn bucket(&self) -> &BucketParams {
        &self.bucket
    }

    /// Create the bucket, tolerating one that already exists
    ///
    /// Some vendors report `BucketAlreadyExists` even to the owner, so an
    /// existing bucket counts as ours when it answers a head request.
    pub async fn create(&self) -> Result<()> {
        let name = &self.bucket.name;
        match self.storage.create_bucket(name, &self.bucket.region).await {
            Ok(()) => {
                info!(bucket = %name, region = %self.bucket.region, "created backup bucket");
                Ok(())
            }
            Err(StorageError::BucketAlreadyExists { .. }) => {
                if self.storage.head_bucket(name).await? {
                    debug!(bucket = %name, "backup bucket already exists");
                    Ok(())
                } else {
                    Err(Error::conflict_for(
                        "bucket",
                        name.clone(),
                        "name is taken by another account",
                    ))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Purge all objects page by page, then delete the bucket
    pub async fn delete(&self) -> Result<()> {
        let name = &self.bucket.name;
        let purged = match self.purge().await {
            Ok(purged) => purged,
            Err(StorageError::BucketNotFound { .. }) => {
                debug!(bucket = %name, "backup bucket already absent");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match self.storage.delete_bucket(name).await {
            Ok(()) => {
                info!(bucket = %name, purged, "deleted backup bucket");
                Ok(())
            }
            Err(StorageError::BucketNotFound { .. }) => {
                debug!(bucket = %name, "backup bucket vanished during delete");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the bucket exists
    pub async fn exists(&self) -> Result<bool> {
        Ok(self.storage.head_bucket(&self.bucket.name).await?)
    }

    async fn purge(&self) -> std::result::Result<usize, StorageError> {
        let name = &self.bucket.name;
        let mut continuation = None;
        let mut purged = 0;
        loop {
            let page = self.storage.list_objects(name, continuation).await?;
            for key in &page.keys {
                self.storage.delete_object(name, key).await?;
            }
            purged += page.keys.len();
            debug!(bucket = %name, purged, "purged object page");
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => return Ok(purged),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryObjectStorage, MockObjectStorage, ObjectPage};

    fn params() -> BucketParams {
        BucketParams::new("canopy-backups", "us-east-1")
    }

    #[tokio::test]
    async fn story_bucket_lifecycle() {
        let storage = Arc::new(MemoryObjectStorage::with_page_size(3));
        let lifecycle = BucketLifecycle::new(storage.clone(), params());

        assert!(!lifecycle.exists().await.unwrap());
        lifecycle.create().await.unwrap();
        lifecycle.create().await.unwrap();
        assert!(lifecycle.exists().await.unwrap());

        for i in 0..10 {
            storage
                .put_object("canopy-backups", &format!("snapshots/{i:02}"))
                .unwrap();
        }

        lifecycle.delete().await.unwrap();
        assert!(!lifecycle.exists().await.unwrap());

        lifecycle.delete().await.unwrap();
        lifecycle.delete().await.unwrap();
    }

    #[tokio::test]
    async fn taken_bucket_name_is_a_conflict() {
        let mut storage = MockObjectStorage::new();
        storage.expect_create_bucket().returning(|bucket, _| {
            Err(StorageError::BucketAlreadyExists {
                bucket: bucket.to_string(),
            })
        });
        storage.expect_head_bucket().returning(|_| Ok(false));

        let lifecycle = BucketLifecycle::new(Arc::new(storage), params());
        assert!(lifecycle.create().await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn purge_follows_continuation_markers() {
        let mut storage = MockObjectStorage::new();
        storage
            .expect_list_objects()
            .withf(|_, continuation| continuation.is_none())
            .times(1)
            .returning(|_, _| {
                Ok(ObjectPage {
                    keys: vec!["a".into(), "b".into()],
                    continuation: Some("token-1".into()),
                })
            });
        storage
            .expect_list_objects()
            .withf(|_, continuation| continuation.as_deref() == Some("token-1"))
            .times(1)
            .returning(|_, _| {
                Ok(ObjectPage {
                    keys: vec!["c".into()],
                    continuation: None,
                })
            });
        storage.expect_delete_object().times(3).returning(|_, _| Ok(()));
        storage.expect_delete_bucket().times(1).returning(|_| Ok(()));

        let lifecycle = BucketLifecycle::new(Arc::new(storage), params());
        lifecycle.delete().await.unwrap();
    }

    #[tokio::test]
    async fn purge_failures_stop_deletion() {
        let mut storage = MockObjectStorage::new();
        storage.expect_list_objects().returning(|_, _| {
            Ok(ObjectPage {
                keys: vec!["a".into()],
                continuation: None,
            })
        });
        storage.expect_delete_object().returning(|_, _| {
            Err(StorageError::Transport {
                operation: "DeleteObject".into(),
                message: "connection reset".into(),
            })
        });
        storage.expect_delete_bucket().never();

        let lifecycle = BucketLifecycle::new(Arc::new(storage), params());
        let err = lifecycle.delete().await.unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }
}
