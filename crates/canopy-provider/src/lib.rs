//! Multi-vendor providers for Canopy
//!
//! A vendor tag resolves through the [`ProviderRegistry`] to two capability
//! sets: [`InfrastructureProvider`] (storage classes, front-end endpoints,
//! load balancer addresses) and [`BackupProvider`] (backup bucket lifecycle
//! and agent configuration). Callers never branch on the concrete vendor.

#![deny(missing_docs)]

pub mod alicloud;
pub mod aws;
pub mod backup;
pub mod fake;
pub mod gcp;
pub mod infrastructure;
pub mod registry;
pub mod storage;
pub mod types;

pub use backup::{BackupProvider, BucketLifecycle};
pub use infrastructure::InfrastructureProvider;
pub use registry::ProviderRegistry;
pub use storage::{MemoryObjectStorage, ObjectStorage, StorageError};
pub use types::{BackupConfig, BucketParams, Credentials, ProviderType};
