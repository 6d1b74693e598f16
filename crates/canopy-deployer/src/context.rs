//! Immutable startup context shared by every task

use std::collections::BTreeMap;
use std::sync::Arc;

use canopy_common::store::ResourceStore;
use canopy_common::Result;
use canopy_infra::CertificateManager;
use canopy_provider::{BackupProvider, InfrastructureProvider, ProviderRegistry};

use crate::config::DesiredState;
use crate::names::{ResourceNames, PKI_COMPONENT};
use crate::templates::Templates;

/// Validated configuration plus everything derived from it at startup
pub struct DeployContext {
    config: DesiredState,
    names: ResourceNames,
    store: Arc<dyn ResourceStore>,
    registry: ProviderRegistry,
    infrastructure: Box<dyn InfrastructureProvider>,
    templates: Templates,
    certificates: CertificateManager,
}

impl DeployContext {
    /// Validate `config` and build the context
    ///
    /// Fails before any remote call when the document is invalid, a provider
    /// is unknown or lacks credential keys, or the templates don't compile.
    pub fn new(
        config: DesiredState,
        store: Arc<dyn ResourceStore>,
        registry: ProviderRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let infrastructure =
            registry.resolve_infrastructure_provider(&config.infrastructure_provider)?;
        let names = ResourceNames::new(&config.instance_name, &config.namespace);
        let certificates = CertificateManager::new(store.clone(), &config.namespace)
            .with_labels(names.labels(PKI_COMPONENT));

        let context = Self {
            templates: Templates::new()?,
            config,
            names,
            store,
            registry,
            infrastructure,
            certificates,
        };
        // Vendor constructors check their required credential keys
        context.backup_provider()?;
        Ok(context)
    }

    /// The validated desired state
    pub fn config(&self) -> &DesiredState {
        &self.config
    }

    /// Resource names for this instance
    pub fn names(&self) -> &ResourceNames {
        &self.names
    }

    /// Namespace of the instance
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Remote store
    pub fn store(&self) -> &dyn ResourceStore {
        self.store.as_ref()
    }

    /// Provider registry
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Infrastructure provider of the hosting cluster
    pub fn infrastructure(&self) -> &dyn InfrastructureProvider {
        self.infrastructure.as_ref()
    }

    /// Compiled templates
    pub fn templates(&self) -> &Templates {
        &self.templates
    }

    /// Certificate manager for the instance namespace
    pub fn certificates(&self) -> &CertificateManager {
        &self.certificates
    }

    /// Labels for resources of `component`
    pub fn labels(&self, component: &str) -> BTreeMap<String, String> {
        self.names.labels(component)
    }

    /// Backup provider for the configured bucket, `None` when backup is off
    pub fn backup_provider(&self) -> Result<Option<Box<dyn BackupProvider>>> {
        let Some(bucket) = self.config.backup_bucket()? else {
            return Ok(None);
        };
        let provider = self.registry.resolve_backup_provider(
            self.config.backup_provider_tag()?,
            self.config.backup_credentials()?,
            &bucket,
        )?;
        Ok(Some(provider))
    }
}
