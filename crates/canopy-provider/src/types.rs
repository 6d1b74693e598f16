//! Provider tags, credential bags and bucket parameters

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use canopy_common::{Error, Result};

/// Cloud vendor a provider targets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Amazon Web Services
    Aws,
    /// Google Cloud Platform
    Gcp,
    /// Alibaba Cloud
    Alicloud,
    /// In-process provider for local development and tests
    Fake,
}

impl ProviderType {
    /// Every supported provider, in tag order
    pub const ALL: [ProviderType; 4] = [Self::Aws, Self::Gcp, Self::Alicloud, Self::Fake];

    /// The lowercase tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Alicloud => "alicloud",
            Self::Fake => "fake",
        }
    }
}

impl std::str::FromStr for ProviderType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "gcp" => Ok(Self::Gcp),
            "alicloud" => Ok(Self::Alicloud),
            "fake" => Ok(Self::Fake),
            _ => Err(Error::unsupported_provider(s)),
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named key-value credential bag for one vendor
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Vendor these credentials belong to
    #[serde(rename = "provider")]
    pub provider_type: ProviderType,
    /// Credential values
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Credentials {
    /// Create a credential bag
    pub fn new(provider_type: ProviderType) -> Self {
        Self {
            provider_type,
            data: BTreeMap::new(),
        }
    }

    /// Add a credential value
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// A required, non-empty credential value
    pub fn require(&self, key: &str) -> Result<&str> {
        match self.data.get(key).map(String::as_str) {
            Some(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(Error::Validation {
                resource: format!("{} credentials", self.provider_type),
                message: format!("missing required key {key}"),
                field: Some(key.to_string()),
            }),
        }
    }
}

/// Backup bucket identity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketParams {
    /// Bucket name
    pub name: String,
    /// Vendor region the bucket lives in
    pub region: String,
}

impl BucketParams {
    /// Create bucket parameters
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
        }
    }

    /// Check the name against the rules shared by S3, GCS and OSS
    ///
    /// 3-63 characters of lowercase letters, digits, `-` and `.`,
    /// starting and ending with a letter or digit.
    pub fn validate(&self) -> Result<()> {
        let name = &self.name;
        let invalid = |message: &str| Error::validation_for(format!("bucket {name}"), message);

        if name.len() < 3 || name.len() > 63 {
            return Err(invalid("name must be 3-63 characters"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        {
            return Err(invalid(
                "name may only contain lowercase letters, digits, '-' and '.'",
            ));
        }
        let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
        if !edge_ok(name.chars().next()) || !edge_ok(name.chars().last()) {
            return Err(invalid("name must start and end with a letter or digit"));
        }
        if self.region.trim().is_empty() {
            return Err(invalid("region is required"));
        }
        Ok(())
    }
}

/// What the backup agent needs to reach a bucket
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupConfig {
    /// Vendor name as the backup agent knows it
    pub provider_name: String,
    /// Secret content mounted into the agent
    pub secret_data: BTreeMap<String, String>,
    /// Environment variables for the agent container
    pub env: BTreeMap<String, String>,
}
