//! In-process provider for local clusters and tests
//!
//! Buckets live in the registry's [`MemoryObjectStorage`]. Services without
//! a load balancer resolve to their in-cluster DNS name.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;

use canopy_common::Result;

use crate::backup::{BackupProvider, BucketLifecycle, STORAGE_CONTAINER_ENV};
use crate::infrastructure::{first_hostname, first_ip, InfrastructureProvider};
use crate::storage::MemoryObjectStorage;
use crate::types::{BackupConfig, BucketParams, ProviderType};

/// Fake infrastructure shape
#[derive(Debug, Default, Clone, Copy)]
pub struct FakeInfrastructure;

impl InfrastructureProvider for FakeInfrastructure {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Fake
    }

    fn storage_provisioner(&self) -> &'static str {
        "rancher.io/local-path"
    }

    fn storage_class_parameters(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn load_balancer_address(&self, service: &Service) -> Option<String> {
        first_hostname(service)
            .or_else(|| first_ip(service))
            .or_else(|| {
                let name = service.metadata.name.as_deref()?;
                let namespace = service.metadata.namespace.as_deref()?;
                Some(format!("{name}.{namespace}.svc"))
            })
    }
}

/// Bucket in process memory
pub struct FakeBackup {
    lifecycle: BucketLifecycle,
}

impl FakeBackup {
    /// Backup provider over shared in-memory storage
    pub fn new(storage: Arc<MemoryObjectStorage>, bucket: &BucketParams) -> Self {
        Self {
            lifecycle: BucketLifecycle::new(storage, bucket.clone()),
        }
    }
}

#[async_trait]
impl BackupProvider for FakeBackup {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Fake
    }

    fn bucket(&self) -> &BucketParams {
        self.lifecycle.bucket()
    }

    async fn create_bucket(&self) -> Result<()> {
        self.lifecycle.create().await
    }

    async fn delete_bucket(&self) -> Result<()> {
        self.lifecycle.delete().await
    }

    async fn bucket_exists(&self) -> Result<bool> {
        self.lifecycle.exists().await
    }

    fn compute_backup_config(&self, mount_path: &str) -> Result<BackupConfig> {
        Ok(BackupConfig {
            provider_name: "local".to_string(),
            secret_data: BTreeMap::new(),
            env: BTreeMap::from([
                ("LOCAL_STORAGE_PATH".to_string(), mount_path.to_string()),
                (
                    STORAGE_CONTAINER_ENV.to_string(),
                    self.lifecycle.bucket().name.clone(),
                ),
            ]),
        })
    }
}
