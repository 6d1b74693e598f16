//! Alibaba Cloud provider
//!
//! Volumes are ESSD cloud disks. Backups go to OSS through its
//! S3-compatible API at the regional endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;

use canopy_common::Result;

use crate::backup::{BackupProvider, BucketLifecycle, STORAGE_CONTAINER_ENV};
use crate::infrastructure::{first_hostname, first_ip, parameters, InfrastructureProvider};
use crate::storage::{ObjectStorage, S3Client, S3Config};
use crate::types::{BackupConfig, BucketParams, Credentials, ProviderType};

/// Credential key for the access key id
pub const ACCESS_KEY_ID: &str = "accessKeyID";
/// Credential key for the access key secret
pub const ACCESS_KEY_SECRET: &str = "accessKeySecret";
/// Secret key carrying the OSS endpoint for the backup agent
pub const STORAGE_ENDPOINT: &str = "storageEndpoint";

/// Regional OSS endpoint host
pub fn oss_endpoint(region: &str) -> String {
    format!("oss-{region}.aliyuncs.com")
}

/// Alibaba Cloud infrastructure shape
#[derive(Debug, Default, Clone, Copy)]
pub struct AlicloudInfrastructure;

impl InfrastructureProvider for AlicloudInfrastructure {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Alicloud
    }

    fn storage_provisioner(&self) -> &'static str {
        "diskplugin.csi.alibabacloud.com"
    }

    fn storage_class_parameters(&self) -> BTreeMap<String, String> {
        parameters([
            ("type", "cloud_essd"),
            ("encrypted", "true"),
            ("fsType", "ext4"),
        ])
    }

    fn load_balancer_address(&self, service: &Service) -> Option<String> {
        first_ip(service).or_else(|| first_hostname(service))
    }
}

/// OSS backup bucket
pub struct AlicloudBackup {
    lifecycle: BucketLifecycle,
    access_key_id: String,
    access_key_secret: String,
}

impl AlicloudBackup {
    /// Backup provider talking to OSS in the bucket's region
    pub fn new(credentials: &Credentials, bucket: &BucketParams) -> Result<Self> {
        let storage = S3Client::new(S3Config {
            endpoint: oss_endpoint(&bucket.region),
            region: format!("oss-{}", bucket.region),
            access_key_id: credentials.require(ACCESS_KEY_ID)?.to_string(),
            secret_access_key: credentials.require(ACCESS_KEY_SECRET)?.to_string(),
            location_constraint: false,
            path_style: false,
            insecure: false,
        })?;
        Self::with_storage(credentials, bucket, Arc::new(storage))
    }

    /// Backup provider over an explicit transport
    pub fn with_storage(
        credentials: &Credentials,
        bucket: &BucketParams,
        storage: Arc<dyn ObjectStorage>,
    ) -> Result<Self> {
        Ok(Self {
            lifecycle: BucketLifecycle::new(storage, bucket.clone()),
            access_key_id: credentials.require(ACCESS_KEY_ID)?.to_string(),
            access_key_secret: credentials.require(ACCESS_KEY_SECRET)?.to_string(),
        })
    }
}

#[async_trait]
impl BackupProvider for AlicloudBackup {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Alicloud
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
        let bucket = self.lifecycle.bucket();
        Ok(BackupConfig {
            provider_name: "OSS".to_string(),
            secret_data: BTreeMap::from([
                (ACCESS_KEY_ID.to_string(), self.access_key_id.clone()),
                (ACCESS_KEY_SECRET.to_string(), self.access_key_secret.clone()),
                (STORAGE_ENDPOINT.to_string(), oss_endpoint(&bucket.region)),
            ]),
            env: BTreeMap::from([
                (
                    "ALICLOUD_APPLICATION_CREDENTIALS".to_string(),
                    mount_path.to_string(),
                ),
                (STORAGE_CONTAINER_ENV.to_string(), bucket.name.clone()),
            ]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::test_support::service_with_ingress;
    use crate::storage::MemoryObjectStorage;

    #[test]
    fn backup_config_carries_regional_endpoint() {
        let creds = Credentials::new(ProviderType::Alicloud)
            .with(ACCESS_KEY_ID, "LTAI")
            .with(ACCESS_KEY_SECRET, "secret");
        let backup = AlicloudBackup::with_storage(
            &creds,
            &BucketParams::new("canopy-backups", "cn-hangzhou"),
            Arc::new(MemoryObjectStorage::new()),
        )
        .unwrap();
        let config = backup.compute_backup_config("/var/run/backup").unwrap();
        assert_eq!(config.provider_name, "OSS");
        assert_eq!(
            config.secret_data[STORAGE_ENDPOINT],
            "oss-cn-hangzhou.aliyuncs.com"
        );
        assert_eq!(config.env["ALICLOUD_APPLICATION_CREDENTIALS"], "/var/run/backup");
    }

    #[test]
    fn load_balancer_falls_back_to_hostname() {
        let service = service_with_ingress(&[(Some("slb.aliyuncs.com"), None)]);
        assert_eq!(
            AlicloudInfrastructure
                .load_balancer_address(&service)
                .as_deref(),
            Some("slb.aliyuncs.com")
        );
    }
}
