//! Desired-state document
//!
//! Parsed from YAML and validated in full before any side effect, so a
//! malformed document never leaves a half-converged instance behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use canopy_common::{Error, Result};
use canopy_provider::{BucketParams, Credentials, ProviderType};

/// Longest instance name that still leaves room for resource suffixes
pub const MAX_INSTANCE_NAME_LEN: usize = 40;

/// Default data store image
pub const DEFAULT_DATA_STORE_IMAGE: &str = "quay.io/coreos/etcd:v3.5.17";

/// Default front end image
pub const DEFAULT_FRONT_END_IMAGE: &str = "registry.k8s.io/kube-apiserver:v1.31.4";

/// Default backup agent image
pub const DEFAULT_BACKUP_AGENT_IMAGE: &str = "ghcr.io/canopy-io/backup-agent:v0.4.2";

/// Everything Canopy should converge one instance to
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredState {
    /// Namespace the instance lives in
    pub namespace: String,
    /// Instance name, prefix of every resource name
    pub instance_name: String,
    /// Kubeconfig of the hosting cluster; in-cluster or default config when unset
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    /// Vendor tag of the hosting cluster
    pub infrastructure_provider: String,
    /// Credential bags keyed by logical name
    #[serde(default)]
    pub credentials: BTreeMap<String, Credentials>,
    /// Data store settings
    #[serde(default)]
    pub data_store: DataStoreSpec,
    /// Front end settings
    #[serde(default)]
    pub front_end: FrontEndSpec,
    /// Delete the namespace along with the instance
    #[serde(default)]
    pub delete_namespace: bool,
}

/// Data store settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataStoreSpec {
    /// Backup bucket settings
    pub backup: BackupSpec,
    /// Volume size per member
    pub storage_size: String,
    /// Members per data store
    pub replicas: i32,
    /// Container image
    pub image: String,
    /// Backup agent image
    pub backup_agent_image: String,
}

impl Default for DataStoreSpec {
    fn default() -> Self {
        Self {
            backup: BackupSpec::default(),
            storage_size: "10Gi".to_string(),
            replicas: 3,
            image: DEFAULT_DATA_STORE_IMAGE.to_string(),
            backup_agent_image: DEFAULT_BACKUP_AGENT_IMAGE.to_string(),
        }
    }
}

/// Backup bucket settings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupSpec {
    /// Provision a bucket and run the backup agent
    pub enabled: bool,
    /// Vendor tag of the bucket
    pub provider: Option<String>,
    /// Key into [`DesiredState::credentials`]
    pub credentials_ref: Option<String>,
    /// Bucket name
    pub bucket_name: Option<String>,
    /// Bucket region
    pub region: Option<String>,
}

/// Front end settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FrontEndSpec {
    /// Fixed replica count when autoscaling is off
    pub replicas: i32,
    /// Horizontal autoscaling
    pub autoscaling: AutoscalingSpec,
    /// External exposure
    pub exposure: ExposureSpec,
    /// Cluster DNS domain used for service names
    pub dns_domain: String,
    /// Audit log level
    pub audit_level: String,
    /// Container image
    pub image: String,
}

impl Default for FrontEndSpec {
    fn default() -> Self {
        Self {
            replicas: 2,
            autoscaling: AutoscalingSpec::default(),
            exposure: ExposureSpec::default(),
            dns_domain: "cluster.local".to_string(),
            audit_level: "Metadata".to_string(),
            image: DEFAULT_FRONT_END_IMAGE.to_string(),
        }
    }
}

/// Horizontal autoscaling settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoscalingSpec {
    /// Create the autoscaler
    pub enabled: bool,
    /// Lower bound
    pub min_replicas: i32,
    /// Upper bound
    pub max_replicas: i32,
    /// Target average CPU utilization, percent
    pub target_cpu_utilization: i32,
}

impl Default for AutoscalingSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            min_replicas: 2,
            max_replicas: 5,
            target_cpu_utilization: 75,
        }
    }
}

/// External exposure settings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExposureSpec {
    /// Serve under a public hostname instead of the load balancer address
    pub sni: Option<SniSpec>,
}

/// SNI exposure
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SniSpec {
    /// Public hostname
    pub hostname: String,
}

const AUDIT_LEVELS: [&str; 4] = ["None", "Metadata", "Request", "RequestResponse"];

impl DesiredState {
    /// Parse a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::serialization_for_kind("DesiredState", e.to_string()))
    }

    /// Read and parse a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::validation_for(path.display().to_string(), format!("cannot read: {e}"))
        })?;
        Self::from_yaml(&yaml)
    }

    /// Check the whole document
    pub fn validate(&self) -> Result<()> {
        validate_dns_label("namespace", &self.namespace, 63)?;
        validate_dns_label("instanceName", &self.instance_name, MAX_INSTANCE_NAME_LEN)?;
        self.infrastructure_provider.parse::<ProviderType>()?;

        for (name, credentials) in &self.credentials {
            if credentials.data.is_empty() && credentials.provider_type != ProviderType::Fake {
                return Err(Error::validation_for_field(
                    format!("credentials.{name}.data"),
                    "credential bag is empty",
                ));
            }
        }

        self.validate_data_store()?;
        self.validate_front_end()
    }

    fn validate_data_store(&self) -> Result<()> {
        let data_store = &self.data_store;
        if data_store.replicas < 1 {
            return Err(Error::validation_for_field(
                "dataStore.replicas",
                "at least one member is required",
            ));
        }
        validate_quantity("dataStore.storageSize", &data_store.storage_size)?;

        if data_store.backup.enabled {
            let provider: ProviderType = self.backup_provider_tag()?.parse()?;
            let credentials = self.backup_credentials()?;
            if credentials.provider_type != provider {
                return Err(Error::validation_for_field(
                    "dataStore.backup.credentialsRef",
                    format!(
                        "credentials are for {} but the backup provider is {}",
                        credentials.provider_type, provider
                    ),
                ));
            }
            if let Some(bucket) = self.backup_bucket()? {
                bucket.validate()?;
            }
        }
        Ok(())
    }

    fn validate_front_end(&self) -> Result<()> {
        let front_end = &self.front_end;
        if front_end.replicas < 1 {
            return Err(Error::validation_for_field(
                "frontEnd.replicas",
                "at least one replica is required",
            ));
        }
        let autoscaling = &front_end.autoscaling;
        if autoscaling.enabled {
            if autoscaling.min_replicas < 1 {
                return Err(Error::validation_for_field(
                    "frontEnd.autoscaling.minReplicas",
                    "must be at least 1",
                ));
            }
            if autoscaling.max_replicas < autoscaling.min_replicas {
                return Err(Error::validation_for_field(
                    "frontEnd.autoscaling.maxReplicas",
                    "must not be below minReplicas",
                ));
            }
            if !(1..=100).contains(&autoscaling.target_cpu_utilization) {
                return Err(Error::validation_for_field(
                    "frontEnd.autoscaling.targetCpuUtilization",
                    "must be a percentage between 1 and 100",
                ));
            }
        }
        if let Some(sni) = &front_end.exposure.sni {
            validate_hostname("frontEnd.exposure.sni.hostname", &sni.hostname)?;
        }
        validate_hostname("frontEnd.dnsDomain", &front_end.dns_domain)?;
        if !AUDIT_LEVELS.contains(&front_end.audit_level.as_str()) {
            return Err(Error::validation_for_field(
                "frontEnd.auditLevel",
                format!("must be one of {}", AUDIT_LEVELS.join(", ")),
            ));
        }
        Ok(())
    }

    /// Whether the backup bucket and agent are enabled
    pub fn backup_enabled(&self) -> bool {
        self.data_store.backup.enabled
    }

    /// Vendor tag of the backup bucket
    pub fn backup_provider_tag(&self) -> Result<&str> {
        self.data_store
            .backup
            .provider
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                Error::validation_for_field("dataStore.backup.provider", "required when enabled")
            })
    }

    /// Credentials referenced by the backup settings
    pub fn backup_credentials(&self) -> Result<&Credentials> {
        let reference = self
            .data_store
            .backup
            .credentials_ref
            .as_deref()
            .ok_or_else(|| {
                Error::validation_for_field(
                    "dataStore.backup.credentialsRef",
                    "required when enabled",
                )
            })?;
        self.credentials.get(reference).ok_or_else(|| {
            Error::validation_for_field(
                "dataStore.backup.credentialsRef",
                format!("no credentials named {reference}"),
            )
        })
    }

    /// Backup bucket parameters, `None` when backup is disabled
    pub fn backup_bucket(&self) -> Result<Option<BucketParams>> {
        let backup = &self.data_store.backup;
        if !backup.enabled {
            return Ok(None);
        }
        let name = backup.bucket_name.as_deref().ok_or_else(|| {
            Error::validation_for_field("dataStore.backup.bucketName", "required when enabled")
        })?;
        let region = backup.region.as_deref().ok_or_else(|| {
            Error::validation_for_field("dataStore.backup.region", "required when enabled")
        })?;
        Ok(Some(BucketParams::new(name, region)))
    }
}

fn validate_dns_label(field: &str, value: &str, max_len: usize) -> Result<()> {
    if value.is_empty() || value.len() > max_len {
        return Err(Error::validation_for_field(
            field,
            format!("must be 1-{max_len} characters"),
        ));
    }
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_chars || value.starts_with('-') || value.ends_with('-') {
        return Err(Error::validation_for_field(
            field,
            "must be a lowercase DNS label",
        ));
    }
    Ok(())
}

fn validate_hostname(field: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.len() > 253 {
        return Err(Error::validation_for_field(field, "must be 1-253 characters"));
    }
    value
        .split('.')
        .try_for_each(|label| validate_dns_label(field, label, 63))
}

fn validate_quantity(field: &str, value: &str) -> Result<()> {
    let digits = value.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let suffix = &value[digits.len()..];
    let known_suffix = ["", "Ki", "Mi", "Gi", "Ti", "k", "M", "G", "T"].contains(&suffix);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) || !known_suffix {
        return Err(Error::validation_for_field(
            field,
            format!("{value} is not a storage quantity"),
        ));
    }
    Ok(())
}
