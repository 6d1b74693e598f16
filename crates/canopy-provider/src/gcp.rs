//! GCP provider
//!
//! Bucket management goes through the GCS XML API with HMAC keys. The
//! backup agent authenticates with the service account key instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use serde::Deserialize;

use canopy_common::{Error, Result};

use crate::backup::{BackupProvider, BucketLifecycle, STORAGE_CONTAINER_ENV};
use crate::infrastructure::{first_hostname, first_ip, parameters, InfrastructureProvider};
use crate::storage::{ObjectStorage, S3Client, S3Config};
use crate::types::{BackupConfig, BucketParams, Credentials, ProviderType};

/// Credential key holding the service account JSON key
pub const SERVICE_ACCOUNT_KEY: &str = "serviceaccount.json";
/// Credential key for the HMAC access id
pub const HMAC_ACCESS_ID: &str = "hmacAccessID";
/// Credential key for the HMAC secret
pub const HMAC_SECRET: &str = "hmacSecret";

const GCS_ENDPOINT: &str = "storage.googleapis.com";
const GCS_SIGNING_REGION: &str = "auto";

/// GCP infrastructure shape
#[derive(Debug, Default, Clone, Copy)]
pub struct GcpInfrastructure;

impl InfrastructureProvider for GcpInfrastructure {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Gcp
    }

    fn storage_provisioner(&self) -> &'static str {
        "pd.csi.storage.gke.io"
    }

    fn storage_class_parameters(&self) -> BTreeMap<String, String> {
        parameters([
            ("type", "pd-ssd"),
            ("replication-type", "none"),
            ("csi.storage.k8s.io/fstype", "ext4"),
        ])
    }

    fn load_balancer_address(&self, service: &Service) -> Option<String> {
        first_ip(service).or_else(|| first_hostname(service))
    }
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    #[serde(rename = "type")]
    key_type: String,
    client_email: String,
}

/// Check that a service account key parses and names its account
fn validate_service_account(json: &str) -> Result<()> {
    let key: ServiceAccountKey = serde_json::from_str(json).map_err(|e| Error::Validation {
        resource: "gcp credentials".to_string(),
        message: format!("service account key is not valid JSON: {e}"),
        field: Some(SERVICE_ACCOUNT_KEY.to_string()),
    })?;
    if key.key_type != "service_account" || key.client_email.is_empty() {
        return Err(Error::Validation {
            resource: "gcp credentials".to_string(),
            message: "key is not a service account key".to_string(),
            field: Some(SERVICE_ACCOUNT_KEY.to_string()),
        });
    }
    Ok(())
}

/// GCS backup bucket
pub struct GcpBackup {
    lifecycle: BucketLifecycle,
    service_account: String,
}

impl GcpBackup {
    /// Backup provider talking to the GCS XML API
    pub fn new(credentials: &Credentials, bucket: &BucketParams) -> Result<Self> {
        let storage = S3Client::new(S3Config {
            endpoint: GCS_ENDPOINT.to_string(),
            region: GCS_SIGNING_REGION.to_string(),
            access_key_id: credentials.require(HMAC_ACCESS_ID)?.to_string(),
            secret_access_key: credentials.require(HMAC_SECRET)?.to_string(),
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
        let service_account = credentials.require(SERVICE_ACCOUNT_KEY)?;
        validate_service_account(service_account)?;
        Ok(Self {
            lifecycle: BucketLifecycle::new(storage, bucket.clone()),
            service_account: service_account.to_string(),
        })
    }
}

#[async_trait]
impl BackupProvider for GcpBackup {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Gcp
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
        let mount_path = mount_path.trim_end_matches('/');
        Ok(BackupConfig {
            provider_name: "GCS".to_string(),
            secret_data: BTreeMap::from([(
                SERVICE_ACCOUNT_KEY.to_string(),
                self.service_account.clone(),
            )]),
            env: BTreeMap::from([
                (
                    "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
                    format!("{mount_path}/{SERVICE_ACCOUNT_KEY}"),
                ),
                (
                    STORAGE_CONTAINER_ENV.to_string(),
                    self.lifecycle.bucket().name.clone(),
                ),
            ]),
        })
    }
}
