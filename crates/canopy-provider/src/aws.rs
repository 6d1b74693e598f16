//! AWS provider
//!
//! Volumes are EBS gp3 through the EBS CSI driver. Backups go to S3 in the
//! bucket's region. AWS load balancers publish a DNS name rather than an IP.

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
/// Credential key for the secret access key
pub const SECRET_ACCESS_KEY: &str = "secretAccessKey";

/// AWS infrastructure shape
#[derive(Debug, Default, Clone, Copy)]
pub struct AwsInfrastructure;

impl InfrastructureProvider for AwsInfrastructure {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Aws
    }

    fn storage_provisioner(&self) -> &'static str {
        "ebs.csi.aws.com"
    }

    fn storage_class_parameters(&self) -> BTreeMap<String, String> {
        parameters([
            ("type", "gp3"),
            ("encrypted", "true"),
            ("csi.storage.k8s.io/fstype", "ext4"),
        ])
    }

    fn load_balancer_address(&self, service: &Service) -> Option<String> {
        first_hostname(service).or_else(|| first_ip(service))
    }
}

/// S3 backup bucket
pub struct AwsBackup {
    lifecycle: BucketLifecycle,
    access_key_id: String,
    secret_access_key: String,
}

impl AwsBackup {
    /// Backup provider talking to S3 in the bucket's region
    pub fn new(credentials: &Credentials, bucket: &BucketParams) -> Result<Self> {
        let storage = S3Client::new(S3Config {
            endpoint: format!("s3.{}.amazonaws.com", bucket.region),
            region: bucket.region.clone(),
            access_key_id: credentials.require(ACCESS_KEY_ID)?.to_string(),
            secret_access_key: credentials.require(SECRET_ACCESS_KEY)?.to_string(),
            location_constraint: true,
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
            secret_access_key: credentials.require(SECRET_ACCESS_KEY)?.to_string(),
        })
    }
}

#[async_trait]
impl BackupProvider for AwsBackup {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Aws
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
            provider_name: "S3".to_string(),
            secret_data: BTreeMap::from([
                (ACCESS_KEY_ID.to_string(), self.access_key_id.clone()),
                (SECRET_ACCESS_KEY.to_string(), self.secret_access_key.clone()),
                ("region".to_string(), bucket.region.clone()),
            ]),
            env: BTreeMap::from([
                (
                    "AWS_APPLICATION_CREDENTIALS".to_string(),
                    mount_path.to_string(),
                ),
                (STORAGE_CONTAINER_ENV.to_string(), bucket.name.clone()),
            ]),
        })
    }
}
