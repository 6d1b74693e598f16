//! In-memory object storage

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ObjectPage, ObjectStorage, StorageError};

/// Default number of keys per listing page
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Buckets and object keys held in process memory
///
/// Listing pages are ordered by key and the continuation marker is the last
/// key returned, so deleting objects between pages never skips any.
#[derive(Debug)]
pub struct MemoryObjectStorage {
    buckets: Mutex<BTreeMap<String, BTreeSet<String>>>,
    page_size: usize,
}

impl Default for MemoryObjectStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStorage {
    /// Empty storage with the default page size
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Empty storage returning at most `page_size` keys per listing
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            buckets: Mutex::new(BTreeMap::new()),
            page_size: page_size.max(1),
        }
    }

    /// Store an object key in an existing bucket
    pub fn put_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let mut buckets = self.buckets.lock();
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::BucketNotFound {
                bucket: bucket.to_string(),
            })?;
        objects.insert(key.to_string());
        Ok(())
    }

    /// Number of objects in a bucket, `None` if it doesn't exist
    pub fn object_count(&self, bucket: &str) -> Option<usize> {
        self.buckets.lock().get(bucket).map(BTreeSet::len)
    }

    /// Names of all buckets
    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn create_bucket(&self, bucket: &str, _region: &str) -> Result<(), StorageError> {
        let mut buckets = self.buckets.lock();
        if buckets.contains_key(bucket) {
            return Err(StorageError::BucketAlreadyExists {
                bucket: bucket.to_string(),
            });
        }
        buckets.insert(bucket.to_string(), BTreeSet::new());
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let mut buckets = self.buckets.lock();
        match buckets.get(bucket) {
            None => Err(StorageError::BucketNotFound {
                bucket: bucket.to_string(),
            }),
            Some(objects) if !objects.is_empty() => Err(StorageError::BucketNotEmpty {
                bucket: bucket.to_string(),
            }),
            Some(_) => {
                buckets.remove(bucket);
                Ok(())
            }
        }
    }

    async fn head_bucket(&self, bucket: &str) -> Result<bool, StorageError> {
        Ok(self.buckets.lock().contains_key(bucket))
    }

    async fn list_objects(
        &self,
        bucket: &str,
        continuation: Option<String>,
    ) -> Result<ObjectPage, StorageError> {
        let buckets = self.buckets.lock();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| StorageError::BucketNotFound {
                bucket: bucket.to_string(),
            })?;

        let mut remaining = objects
            .iter()
            .filter(|key| continuation.as_ref().map_or(true, |after| *key > after));
        let keys: Vec<String> = remaining.by_ref().take(self.page_size).cloned().collect();
        let continuation = match remaining.next() {
            Some(_) => keys.last().cloned(),
            None => None,
        };

        Ok(ObjectPage { keys, continuation })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let mut buckets = self.buckets.lock();
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::BucketNotFound {
                bucket: bucket.to_string(),
            })?;
        objects.remove(key);
        Ok(())
    }
}
