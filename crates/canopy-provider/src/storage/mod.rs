//! Object storage wire seam
//!
//! Backup providers manage bucket lifecycles through [`ObjectStorage`].
//! The S3-compatible REST client serves every cloud vendor. The in-memory
//! implementation backs the fake provider and tests.

mod memory;
mod s3;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use canopy_common::Error;

pub use self::memory::MemoryObjectStorage;
pub use self::s3::{S3Client, S3Config};

/// Failures from an object storage backend
#[derive(Debug, Error)]
pub enum StorageError {
    /// Bucket does not exist
    #[error("bucket {bucket} does not exist")]
    BucketNotFound {
        /// Bucket name
        bucket: String,
    },

    /// Bucket name is taken
    #[error("bucket {bucket} already exists")]
    BucketAlreadyExists {
        /// Bucket name
        bucket: String,
    },

    /// Bucket still has objects
    #[error("bucket {bucket} is not empty")]
    BucketNotEmpty {
        /// Bucket name
        bucket: String,
    },

    /// Backend rejected the request
    #[error("{operation} failed with status {status} ({code}): {message}")]
    Service {
        /// Operation name
        operation: String,
        /// HTTP status
        status: u16,
        /// Vendor error code
        code: String,
        /// Vendor error message
        message: String,
    },

    /// Request never got a response
    #[error("{operation} transport failure: {message}")]
    Transport {
        /// Operation name
        operation: String,
        /// Underlying error
        message: String,
    },

    /// Response could not be understood
    #[error("invalid response to {operation}: {message}")]
    InvalidResponse {
        /// Operation name
        operation: String,
        /// What was wrong
        message: String,
    },
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::BucketNotFound { bucket } => Error::not_found("bucket", bucket),
            StorageError::BucketAlreadyExists { ref bucket }
            | StorageError::BucketNotEmpty { ref bucket } => {
                Error::conflict_for("bucket", bucket.clone(), err.to_string())
            }
            StorageError::Transport { operation, message } => {
                Error::transport(format!("object storage {operation}"), message)
            }
            other => Error::provider("object storage", other.to_string()),
        }
    }
}

/// One page of an object listing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectPage {
    /// Object keys on this page
    pub keys: Vec<String>,
    /// Marker for the next page, `None` on the last page
    pub continuation: Option<String>,
}

/// Bucket and object operations of an S3-style store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Create a bucket in `region`
    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<(), StorageError>;

    /// Delete an empty bucket
    async fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError>;

    /// Whether the bucket exists and is reachable with these credentials
    async fn head_bucket(&self, bucket: &str) -> Result<bool, StorageError>;

    /// List object keys, resuming after `continuation`
    async fn list_objects(
        &self,
        bucket: &str,
        continuation: Option<String>,
    ) -> Result<ObjectPage, StorageError>;

    /// Delete one object; deleting a missing object succeeds
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError>;
}
