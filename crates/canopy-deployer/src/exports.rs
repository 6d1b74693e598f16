//! Values handed to downstream consumers after a reconcile
//!
//! Tasks record into an [`ExportsCollector`] as they finish. Each key has
//! exactly one writing task; a second write is a bug and fails that task.
//! The collector is read only once the whole graph has completed.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use canopy_common::{Error, Result};

/// One exported value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExportKey {
    /// Public front end URL
    FrontEndUrl,
    /// In-cluster data store URL
    DataStoreUrl,
    /// CA bundle clients should trust
    CaBundle,
    /// Admin kubeconfig
    Kubeconfig,
    /// Service account token signing key
    ServiceAccountSigningKey,
}

impl ExportKey {
    /// Every key, in document order
    pub const ALL: [ExportKey; 5] = [
        Self::FrontEndUrl,
        Self::DataStoreUrl,
        Self::CaBundle,
        Self::Kubeconfig,
        Self::ServiceAccountSigningKey,
    ];

    /// Stable name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FrontEndUrl => "frontEndUrl",
            Self::DataStoreUrl => "dataStoreUrl",
            Self::CaBundle => "caBundle",
            Self::Kubeconfig => "kubeconfig",
            Self::ServiceAccountSigningKey => "serviceAccountSigningKey",
        }
    }
}

impl std::fmt::Display for ExportKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only, single-writer-per-key accumulator
#[derive(Debug, Default)]
pub struct ExportsCollector {
    values: DashMap<ExportKey, String>,
}

impl ExportsCollector {
    /// Empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a value; recording the same key twice is an error
    pub fn record(&self, key: ExportKey, value: impl Into<String>) -> Result<()> {
        match self.values.entry(key) {
            Entry::Occupied(_) => Err(Error::internal_with_context(
                "exports",
                format!("{key} was recorded twice"),
            )),
            Entry::Vacant(slot) => {
                slot.insert(value.into());
                debug!(export = %key, "recorded export");
                Ok(())
            }
        }
    }

    /// A recorded value
    pub fn get(&self, key: ExportKey) -> Option<String> {
        self.values.get(&key).map(|v| v.value().clone())
    }

    /// Number of recorded values
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Assemble the final exports; every key must have been recorded
    pub fn finalize(&self) -> Result<Exports> {
        let take = |key: ExportKey| {
            self.get(key).ok_or_else(|| {
                Error::internal_with_context("exports", format!("{key} was never recorded"))
            })
        };
        Ok(Exports {
            front_end_url: take(ExportKey::FrontEndUrl)?,
            data_store_url: take(ExportKey::DataStoreUrl)?,
            ca_bundle: take(ExportKey::CaBundle)?,
            kubeconfig: take(ExportKey::Kubeconfig)?,
            service_account_signing_key: take(ExportKey::ServiceAccountSigningKey)?,
        })
    }
}

/// Derived values for downstream consumers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exports {
    /// Public front end URL
    pub front_end_url: String,
    /// In-cluster data store URL
    pub data_store_url: String,
    /// PEM CA bundle for the front end
    pub ca_bundle: String,
    /// Admin kubeconfig
    pub kubeconfig: String,
    /// PEM service account signing key
    pub service_account_signing_key: String,
}

impl Exports {
    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::serialization_for_kind("Exports", e.to_string()))
    }
}
