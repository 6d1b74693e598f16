//! Vendor tag to provider resolution

use std::sync::Arc;

use tracing::debug;

use canopy_common::{Error, Result};

use crate::alicloud::{AlicloudBackup, AlicloudInfrastructure};
use crate::aws::{AwsBackup, AwsInfrastructure};
use crate::backup::BackupProvider;
use crate::fake::{FakeBackup, FakeInfrastructure};
use crate::gcp::{GcpBackup, GcpInfrastructure};
use crate::infrastructure::InfrastructureProvider;
use crate::storage::MemoryObjectStorage;
use crate::types::{BucketParams, Credentials, ProviderType};

/// Resolves vendor tags to provider implementations
///
/// Built once at startup. Owns the in-memory storage behind the fake
/// vendor, so fake buckets persist across resolutions within one registry.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    fake_storage: Arc<MemoryObjectStorage>,
}

impl ProviderRegistry {
    /// Registry with empty fake storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose fake vendor uses `storage`
    pub fn with_fake_storage(storage: Arc<MemoryObjectStorage>) -> Self {
        Self {
            fake_storage: storage,
        }
    }

    /// Storage behind the fake vendor
    pub fn fake_storage(&self) -> &Arc<MemoryObjectStorage> {
        &self.fake_storage
    }

    /// Infrastructure provider for a vendor tag
    pub fn resolve_infrastructure_provider(
        &self,
        tag: &str,
    ) -> Result<Box<dyn InfrastructureProvider>> {
        let provider_type: ProviderType = tag.parse()?;
        debug!(provider = %provider_type, "resolved infrastructure provider");
        Ok(match provider_type {
            ProviderType::Aws => Box::new(AwsInfrastructure),
            ProviderType::Gcp => Box::new(GcpInfrastructure),
            ProviderType::Alicloud => Box::new(AlicloudInfrastructure),
            ProviderType::Fake => Box::new(FakeInfrastructure),
        })
    }

    /// Backup provider for a vendor tag, its credentials and bucket
    ///
    /// Credentials issued for a different vendor than `tag` are rejected.
    pub fn resolve_backup_provider(
        &self,
        tag: &str,
        credentials: &Credentials,
        bucket: &BucketParams,
    ) -> Result<Box<dyn BackupProvider>> {
        let provider_type: ProviderType = tag.parse()?;
        if credentials.provider_type != provider_type {
            return Err(Error::validation_for(
                format!("bucket {}", bucket.name),
                format!(
                    "backup provider is {} but credentials are for {}",
                    provider_type, credentials.provider_type
                ),
            ));
        }
        bucket.validate()?;
        debug!(provider = %provider_type, bucket = %bucket.name, "resolved backup provider");

        Ok(match provider_type {
            ProviderType::Aws => Box::new(AwsBackup::new(credentials, bucket)?),
            ProviderType::Gcp => Box::new(GcpBackup::new(credentials, bucket)?),
            ProviderType::Alicloud => Box::new(AlicloudBackup::new(credentials, bucket)?),
            ProviderType::Fake => Box::new(FakeBackup::new(self.fake_storage.clone(), bucket)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket() -> BucketParams {
        BucketParams::new("canopy-backups", "us-east-1")
    }

    #[test]
    fn every_tag_resolves_an_infrastructure_provider() {
        let registry = ProviderRegistry::new();
        for provider in ProviderType::ALL {
            let resolved = registry
                .resolve_infrastructure_provider(provider.as_str())
                .unwrap();
            assert_eq!(resolved.provider_type(), provider);
        }
    }

    #[test]
    fn unknown_tags_are_unsupported() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.resolve_infrastructure_provider("openstack"),
            Err(Error::UnsupportedProvider { .. })
        ));
        assert!(matches!(
            registry.resolve_backup_provider(
                "openstack",
                &Credentials::new(ProviderType::Fake),
                &bucket()
            ),
            Err(Error::UnsupportedProvider { .. })
        ));
    }

    #[test]
    fn mismatched_credentials_are_rejected() {
        let registry = ProviderRegistry::new();
        let creds = Credentials::new(ProviderType::Gcp);
        match registry.resolve_backup_provider("aws", &creds, &bucket()) {
            Err(Error::Validation { message, .. }) => {
                assert!(message.contains("credentials are for gcp"))
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("mismatched credentials resolved"),
        }
    }

    #[test]
    fn cloud_backups_resolve_with_complete_credentials() {
        let registry = ProviderRegistry::new();
        let creds = Credentials::new(ProviderType::Aws)
            .with(crate::aws::ACCESS_KEY_ID, "AKIA")
            .with(crate::aws::SECRET_ACCESS_KEY, "secret");
        let backup = registry
            .resolve_backup_provider("aws", &creds, &bucket())
            .unwrap();
        assert_eq!(backup.provider_type(), ProviderType::Aws);
        assert_eq!(backup.bucket(), &bucket());
    }

    #[tokio::test]
    async fn story_fake_buckets_outlive_a_single_resolution() {
        let registry = ProviderRegistry::new();
        let creds = Credentials::new(ProviderType::Fake);

        let first = registry
            .resolve_backup_provider("fake", &creds, &bucket())
            .unwrap();
        first.create_bucket().await.unwrap();

        let second = registry
            .resolve_backup_provider("fake", &creds, &bucket())
            .unwrap();
        assert!(second.bucket_exists().await.unwrap());
        assert_eq!(registry.fake_storage().bucket_names(), vec!["canopy-backups"]);

        second.delete_bucket().await.unwrap();
        second.delete_bucket().await.unwrap();
        assert!(!first.bucket_exists().await.unwrap());
    }
}
