//! Certificate authority manager
//!
//! Certificates live in secrets. [`CertificateManager::ensure_certificate`]
//! reloads a secret's key and certificate verbatim when it exists, and only
//! generates fresh material when it doesn't, so a signing chain is stable
//! across runs. The stored secret never carries the chain itself: callers
//! walk CA-before-leaf and hand the CA [`Certificate`] back in.
//!
//! Secret layout:
//! - CA: `Opaque` with `ca.crt` and `ca.key`
//! - leaf: `kubernetes.io/tls` with `tls.crt`, `tls.key` and `ca.crt`
//! - either may carry a derived `kubeconfig`

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use tracing::{debug, info, warn};

use canopy_common::checksum::checksum_secret;
use canopy_common::error::UNKNOWN_CONTEXT;
use canopy_common::reconcile::{delete_if_exists, ensure_desired_state};
use canopy_common::store::{get_typed, identity_meta, ResourceStore};
use canopy_common::{Error, Result};

use crate::kubeconfig::build_client_kubeconfig;
use crate::pki::{
    self, CertificateInfo, CertificateType, KeyUsage, PemPair, PkiError, SubjectParams,
};

/// CA certificate key
pub const CA_CERT_KEY: &str = "ca.crt";
/// CA private key key
pub const CA_KEY_KEY: &str = "ca.key";
/// Leaf certificate key
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Leaf private key key
pub const TLS_KEY_KEY: &str = "tls.key";
/// Derived kubeconfig key
pub const KUBECONFIG_KEY: &str = "kubeconfig";

/// Secret type for CA and self-signed certificates
pub const SECRET_TYPE_OPAQUE: &str = "Opaque";
/// Secret type for signed leaves
pub const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";

impl From<PkiError> for Error {
    fn from(err: PkiError) -> Self {
        Error::certificate(UNKNOWN_CONTEXT, err.to_string())
    }
}

/// Kubeconfig to derive from a client certificate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KubeconfigRequest {
    /// Cluster and context name
    pub cluster_name: String,
    /// API server URL
    pub server: String,
    /// User entry name
    pub user_name: String,
}

/// A loaded or generated certificate with its key
#[derive(Clone, Debug)]
pub struct Certificate {
    /// Secret name
    pub name: String,
    /// Subject common name
    pub common_name: String,
    /// Role in the chain
    pub certificate_type: CertificateType,
    /// Signing CA, `None` for self-signed roots
    pub ca: Option<Arc<Certificate>>,
    /// DNS SANs
    pub dns_names: Vec<String>,
    /// IP SANs
    pub ip_addresses: Vec<IpAddr>,
    /// Key usage flags
    pub key_usages: Vec<KeyUsage>,
    /// PEM private key
    pub private_key_pem: String,
    /// PEM certificate
    pub certificate_pem: String,
    /// Derived kubeconfig, when requested
    pub kubeconfig: Option<String>,
}

impl Certificate {
    fn pem_pair(&self) -> PemPair {
        PemPair {
            certificate_pem: self.certificate_pem.clone(),
            private_key_pem: self.private_key_pem.clone(),
        }
    }

    /// PEM of the certificate that clients should trust for this one
    pub fn ca_bundle_pem(&self) -> &str {
        match &self.ca {
            Some(ca) => &ca.certificate_pem,
            None => &self.certificate_pem,
        }
    }

    /// Parse the certificate
    pub fn info(&self) -> Result<CertificateInfo> {
        CertificateInfo::from_pem(&self.certificate_pem)
            .map_err(|e| Error::certificate(&self.name, e.to_string()))
    }
}

/// Declarative request for one certificate secret
#[derive(Clone, Debug)]
pub struct CertificateSecretConfig {
    /// Secret name, also the logical certificate name
    pub name: String,
    /// Role in the chain
    pub certificate_type: CertificateType,
    /// Signing CA for leaves
    pub signing_ca: Option<Arc<Certificate>>,
    /// Subject common name
    pub common_name: String,
    /// Subject organizations
    pub organizations: Vec<String>,
    /// DNS SANs
    pub dns_names: Vec<String>,
    /// IP SANs
    pub ip_addresses: Vec<IpAddr>,
    /// Kubeconfig to derive and store alongside the certificate
    pub kubeconfig: Option<KubeconfigRequest>,
}

impl CertificateSecretConfig {
    /// Self-signed CA
    pub fn ca(name: impl Into<String>, common_name: impl Into<String>) -> Self {
        Self::new(name, CertificateType::Ca, common_name, None)
    }

    /// Server leaf signed by `ca`
    pub fn server(
        name: impl Into<String>,
        common_name: impl Into<String>,
        ca: Arc<Certificate>,
    ) -> Self {
        Self::new(name, CertificateType::Server, common_name, Some(ca))
    }

    /// Client leaf signed by `ca`
    pub fn client(
        name: impl Into<String>,
        common_name: impl Into<String>,
        ca: Arc<Certificate>,
    ) -> Self {
        Self::new(name, CertificateType::Client, common_name, Some(ca))
    }

    /// Mutual-TLS peer leaf signed by `ca`
    pub fn peer(
        name: impl Into<String>,
        common_name: impl Into<String>,
        ca: Arc<Certificate>,
    ) -> Self {
        Self::new(name, CertificateType::Peer, common_name, Some(ca))
    }

    /// Request without defaults applied
    pub fn new(
        name: impl Into<String>,
        certificate_type: CertificateType,
        common_name: impl Into<String>,
        signing_ca: Option<Arc<Certificate>>,
    ) -> Self {
        Self {
            name: name.into(),
            certificate_type,
            signing_ca,
            common_name: common_name.into(),
            organizations: Vec::new(),
            dns_names: Vec::new(),
            ip_addresses: Vec::new(),
            kubeconfig: None,
        }
    }

    /// Set subject organizations
    pub fn with_organizations(mut self, orgs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.organizations = orgs.into_iter().map(Into::into).collect();
        self
    }

    /// Set DNS SANs
    pub fn with_dns_names(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dns_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Set IP SANs
    pub fn with_ip_addresses(mut self, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        self.ip_addresses = ips.into_iter().collect();
        self
    }

    /// Derive a kubeconfig from this certificate
    pub fn with_kubeconfig(mut self, request: KubeconfigRequest) -> Self {
        self.kubeconfig = Some(request);
        self
    }

    fn validate(&self) -> Result<()> {
        match (self.certificate_type.is_leaf(), &self.signing_ca) {
            (true, None) => Err(Error::validation_for(
                format!("certificate {}", self.name),
                "leaf certificates need a signing CA",
            )),
            (false, Some(_)) => Err(Error::validation_for(
                format!("certificate {}", self.name),
                "CA certificates are self-signed",
            )),
            (true, Some(ca)) if ca.certificate_type.is_leaf() => Err(Error::validation_for(
                format!("certificate {}", self.name),
                format!("signing certificate {} is not a CA", ca.name),
            )),
            _ => Ok(()),
        }
    }

    fn subject(&self) -> SubjectParams {
        SubjectParams {
            common_name: self.common_name.clone(),
            organizations: self.organizations.clone(),
            dns_names: self.dns_names.clone(),
            ip_addresses: self.ip_addresses.clone(),
        }
    }

    fn keys(&self) -> (&'static str, &'static str) {
        if self.certificate_type.is_leaf() {
            (TLS_CERT_KEY, TLS_KEY_KEY)
        } else {
            (CA_CERT_KEY, CA_KEY_KEY)
        }
    }
}

/// Everything the secret should contain after a reconcile
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredSecret {
    type_: String,
    data: BTreeMap<String, ByteString>,
    labels: BTreeMap<String, String>,
    cert_key: &'static str,
    origin: Origin,
}

/// Where the certificate material in a [`DesiredSecret`] came from
#[derive(Clone, Debug, PartialEq)]
pub enum Origin {
    /// Reloaded from the secret as stored
    Stored,
    /// Generated because no secret existed
    Generated,
    /// Generated to replace a stored leaf its CA no longer signs
    Reissued {
        /// Certificate the new material replaces
        previous: ByteString,
    },
}

/// Result of reading a stored certificate secret
enum Reloaded {
    Current(PemPair),
    Stale { certificate_pem: String },
}

/// Converge a certificate secret toward `desired`
///
/// Fresh material never replaces a certificate someone else stored in the
/// meantime; that is reported as a conflict. A reissue only replaces the
/// certificate it was issued against.
pub fn apply_certificate_secret(mut observed: Secret, desired: &DesiredSecret) -> Result<Secret> {
    let existing_cert = observed
        .data
        .as_ref()
        .and_then(|d| d.get(desired.cert_key));
    let replaceable = match &desired.origin {
        Origin::Stored => true,
        Origin::Generated => {
            observed.metadata.resource_version.is_none() || existing_cert.is_none()
        }
        Origin::Reissued { previous } => existing_cert == Some(previous),
    };
    if !replaceable && existing_cert != desired.data.get(desired.cert_key) {
        return Err(Error::conflict_for(
            "Secret",
            observed.metadata.name.clone().unwrap_or_default(),
            "certificate was generated concurrently",
        ));
    }

    observed.type_ = Some(desired.type_.clone());
    observed.data = Some(desired.data.clone());
    if !desired.labels.is_empty() {
        observed
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(desired.labels.clone());
    }
    Ok(observed)
}

fn string_entry(secret: &Secret, name: &str, key: &str) -> Result<String> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .ok_or_else(|| Error::certificate(name, format!("secret exists but has no {}", key)))?;
    String::from_utf8(bytes.0.clone())
        .map_err(|_| Error::certificate(name, format!("{} is not valid UTF-8", key)))
}

/// Persists certificates as secrets in one namespace
pub struct CertificateManager {
    store: Arc<dyn ResourceStore>,
    namespace: String,
    labels: BTreeMap<String, String>,
}

impl CertificateManager {
    /// Manager for secrets in `namespace`
    pub fn new(store: Arc<dyn ResourceStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            labels: BTreeMap::new(),
        }
    }

    /// Labels stamped on every certificate secret
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Load or generate a certificate and persist it
    ///
    /// Returns the certificate and the checksum of the persisted secret.
    pub async fn ensure_certificate(
        &self,
        config: &CertificateSecretConfig,
    ) -> Result<(Arc<Certificate>, String)> {
        config.validate()?;
        let name = config.name.as_str();

        let existing =
            get_typed::<Secret>(self.store.as_ref(), name, Some(&self.namespace)).await?;
        let (pair, origin) = match existing {
            Some(secret) => {
                debug!(secret = name, "reloading stored certificate");
                match self.reload(config, &secret)? {
                    Reloaded::Current(pair) => (pair, Origin::Stored),
                    Reloaded::Stale { certificate_pem } => {
                        warn!(
                            secret = name,
                            cn = %config.common_name,
                            "stored certificate is not signed by the current CA, reissuing"
                        );
                        let previous = ByteString(certificate_pem.into_bytes());
                        (generate(config)?, Origin::Reissued { previous })
                    }
                }
            }
            None => {
                info!(secret = name, cn = %config.common_name, "generating certificate");
                (generate(config)?, Origin::Generated)
            }
        };

        let kubeconfig = match &config.kubeconfig {
            Some(request) => Some(
                build_client_kubeconfig(
                    &request.cluster_name,
                    &request.server,
                    &request.user_name,
                    config
                        .signing_ca
                        .as_ref()
                        .map_or(pair.certificate_pem.as_str(), |ca| ca.certificate_pem.as_str()),
                    &pair.certificate_pem,
                    &pair.private_key_pem,
                )
                .to_yaml()
                .map_err(|e| Error::certificate(name, e.to_string()))?,
            ),
            None => None,
        };

        let certificate = Certificate {
            name: config.name.clone(),
            common_name: config.common_name.clone(),
            certificate_type: config.certificate_type,
            ca: config.signing_ca.clone(),
            dns_names: config.dns_names.clone(),
            ip_addresses: config.ip_addresses.clone(),
            key_usages: config.certificate_type.key_usages(),
            private_key_pem: pair.private_key_pem,
            certificate_pem: pair.certificate_pem,
            kubeconfig,
        };

        let desired = self.desired_secret(config, &certificate, origin);
        let identity = Secret {
            metadata: identity_meta(name, Some(&self.namespace)),
            ..Default::default()
        };
        let ensured = ensure_desired_state(self.store.as_ref(), identity, |observed| {
            apply_certificate_secret(observed, &desired)
        })
        .await?;

        Ok((Arc::new(certificate), checksum_secret(&ensured.object)))
    }

    /// A leaf whose CA was regenerated under the same name comes back stale
    fn reload(&self, config: &CertificateSecretConfig, secret: &Secret) -> Result<Reloaded> {
        let name = config.name.as_str();
        let (cert_key, key_key) = config.keys();
        let certificate_pem = string_entry(secret, name, cert_key)?;
        let private_key_pem = string_entry(secret, name, key_key)?;

        pki::load_key_pair(&private_key_pem).map_err(|e| Error::certificate(name, e.to_string()))?;
        let info = CertificateInfo::from_pem(&certificate_pem)
            .map_err(|e| Error::certificate(name, e.to_string()))?;

        if let Some(ca) = &config.signing_ca {
            let ca_info = ca.info()?;
            if info.issuer_common_name != ca_info.common_name {
                return Err(Error::validation_for(
                    format!("secret {}", name),
                    format!(
                        "stored certificate was issued by {}, expected {}",
                        info.issuer_common_name, ca_info.common_name
                    ),
                ));
            }
            if let Err(e) = pki::verify_signed_by(&certificate_pem, &ca.certificate_pem) {
                debug!(secret = name, error = %e, "stored certificate does not verify");
                return Ok(Reloaded::Stale { certificate_pem });
            }
        }

        Ok(Reloaded::Current(PemPair {
            certificate_pem,
            private_key_pem,
        }))
    }

    fn desired_secret(
        &self,
        config: &CertificateSecretConfig,
        certificate: &Certificate,
        origin: Origin,
    ) -> DesiredSecret {
        let (cert_key, key_key) = config.keys();
        let mut data = BTreeMap::new();
        data.insert(
            cert_key.to_string(),
            ByteString(certificate.certificate_pem.clone().into_bytes()),
        );
        data.insert(
            key_key.to_string(),
            ByteString(certificate.private_key_pem.clone().into_bytes()),
        );
        if let Some(ca) = &certificate.ca {
            data.insert(
                CA_CERT_KEY.to_string(),
                ByteString(ca.certificate_pem.clone().into_bytes()),
            );
        }
        if let Some(kubeconfig) = &certificate.kubeconfig {
            data.insert(
                KUBECONFIG_KEY.to_string(),
                ByteString(kubeconfig.clone().into_bytes()),
            );
        }

        DesiredSecret {
            type_: if config.certificate_type.is_leaf() {
                SECRET_TYPE_TLS
            } else {
                SECRET_TYPE_OPAQUE
            }
            .to_string(),
            data,
            labels: self.labels.clone(),
            cert_key,
            origin,
        }
    }

    /// Delete the named certificate secrets, tolerating absent ones
    ///
    /// Returns how many secrets were actually deleted.
    pub async fn delete_certificates<S: AsRef<str>>(&self, names: &[S]) -> Result<usize> {
        let mut deleted = 0;
        for name in names {
            if delete_if_exists::<Secret>(self.store.as_ref(), name.as_ref(), Some(&self.namespace))
                .await?
            {
                deleted += 1;
            }
        }
        info!(deleted, namespace = %self.namespace, "certificate secrets removed");
        Ok(deleted)
    }
}

fn generate(config: &CertificateSecretConfig) -> Result<PemPair> {
    let subject = config.subject();
    let result = match &config.signing_ca {
        Some(ca) => pki::generate_signed(&subject, config.certificate_type, &ca.pem_pair()),
        None => pki::generate_ca(&subject),
    };
    result.map_err(|e| Error::certificate(&config.name, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_common::store::MemoryStore;

    const NS: &str = "canopy";

    fn manager(store: &Arc<MemoryStore>) -> CertificateManager {
        let store: Arc<dyn ResourceStore> = store.clone();
        CertificateManager::new(store, NS)
    }

    async fn stored_secret(store: &MemoryStore, name: &str) -> Secret {
        get_typed::<Secret>(store, name, Some(NS))
            .await
            .unwrap()
            .unwrap()
    }

    fn data_keys(secret: &Secret) -> Vec<&str> {
        secret
            .data
            .as_ref()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect()
    }

    /// Story: a CA and a server leaf are generated once; the leaf chains to
    /// the CA and both land in secrets of the right type
    #[tokio::test]
    async fn story_ca_and_leaf_are_generated_and_persisted() {
        let store = Arc::new(MemoryStore::new());
        let certs = manager(&store);

        let (ca, _) = certs
            .ensure_certificate(&CertificateSecretConfig::ca("etcd-ca", "etcd-ca"))
            .await
            .unwrap();
        let (leaf, _) = certs
            .ensure_certificate(
                &CertificateSecretConfig::server("etcd-server-tls", "etcd-server", ca.clone())
                    .with_dns_names(["etcd-main-client.canopy.svc"]),
            )
            .await
            .unwrap();

        let ca_info = ca.info().unwrap();
        let leaf_info = leaf.info().unwrap();
        assert!(ca_info.is_ca);
        assert!(!leaf_info.is_ca);
        assert_eq!(leaf_info.issuer_common_name, ca_info.common_name);

        let ca_secret = stored_secret(&store, "etcd-ca").await;
        assert_eq!(ca_secret.type_.as_deref(), Some(SECRET_TYPE_OPAQUE));
        assert_eq!(data_keys(&ca_secret), vec!["ca.crt", "ca.key"]);

        let leaf_secret = stored_secret(&store, "etcd-server-tls").await;
        assert_eq!(leaf_secret.type_.as_deref(), Some(SECRET_TYPE_TLS));
        assert_eq!(data_keys(&leaf_secret), vec!["ca.crt", "tls.crt", "tls.key"]);
        assert_eq!(leaf.ca_bundle_pem(), ca.certificate_pem);
    }

    /// Story: a second run reloads stored bytes verbatim, writes nothing and
    /// reports the same checksum
    #[tokio::test]
    async fn story_second_run_reloads_verbatim() {
        let store = Arc::new(MemoryStore::new());
        let certs = manager(&store);
        let config = CertificateSecretConfig::ca("kube-apiserver-ca", "kube-apiserver-ca");

        let (first, first_sum) = certs.ensure_certificate(&config).await.unwrap();
        let writes = store.writes();
        let (second, second_sum) = certs.ensure_certificate(&config).await.unwrap();

        assert_eq!(first.private_key_pem, second.private_key_pem);
        assert_eq!(first.certificate_pem, second.certificate_pem);
        assert_eq!(first_sum, second_sum);
        assert_eq!(store.writes(), writes);
    }

    #[tokio::test]
    async fn leaf_without_ca_is_rejected_before_any_write() {
        let store = Arc::new(MemoryStore::new());
        let config = CertificateSecretConfig::new(
            "orphan-tls",
            CertificateType::Server,
            "orphan",
            None,
        );
        let err = manager(&store).ensure_certificate(&config).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn stored_leaf_from_another_ca_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let certs = manager(&store);
        let (old_ca, _) = certs
            .ensure_certificate(&CertificateSecretConfig::ca("old-ca", "old-ca"))
            .await
            .unwrap();
        let (new_ca, _) = certs
            .ensure_certificate(&CertificateSecretConfig::ca("new-ca", "new-ca"))
            .await
            .unwrap();
        certs
            .ensure_certificate(&CertificateSecretConfig::client("admin-tls", "admin", old_ca))
            .await
            .unwrap();

        let err = certs
            .ensure_certificate(&CertificateSecretConfig::client("admin-tls", "admin", new_ca))
            .await
            .unwrap_err();
        match err {
            Error::Validation { resource, message, .. } => {
                assert_eq!(resource, "secret admin-tls");
                assert!(message.contains("old-ca"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    /// Story: the CA secret is lost and regenerated under the same name; the
    /// leaf is reissued once against it and then reloads verbatim
    #[tokio::test]
    async fn story_leaf_is_reissued_after_its_ca_is_regenerated() {
        let store = Arc::new(MemoryStore::new());
        let certs = manager(&store);
        let ca_config = CertificateSecretConfig::ca("etcd-ca", "etcd-ca");
        let (old_ca, _) = certs.ensure_certificate(&ca_config).await.unwrap();
        let leaf_config = |ca: Arc<Certificate>| {
            CertificateSecretConfig::server("etcd-server-tls", "etcd-server", ca)
        };
        let (old_leaf, old_sum) = certs.ensure_certificate(&leaf_config(old_ca)).await.unwrap();

        certs.delete_certificates(&["etcd-ca"]).await.unwrap();
        let (new_ca, _) = certs.ensure_certificate(&ca_config).await.unwrap();
        let (new_leaf, new_sum) = certs
            .ensure_certificate(&leaf_config(new_ca.clone()))
            .await
            .unwrap();

        assert_ne!(new_leaf.certificate_pem, old_leaf.certificate_pem);
        assert_ne!(new_sum, old_sum);
        pki::verify_signed_by(&new_leaf.certificate_pem, &new_ca.certificate_pem).unwrap();
        let stored = stored_secret(&store, "etcd-server-tls").await;
        assert_eq!(
            stored.data.unwrap()[CA_CERT_KEY].0,
            new_ca.certificate_pem.as_bytes()
        );

        let writes = store.writes();
        let (again, again_sum) = certs.ensure_certificate(&leaf_config(new_ca)).await.unwrap();
        assert_eq!(again.certificate_pem, new_leaf.certificate_pem);
        assert_eq!(again_sum, new_sum);
        assert_eq!(store.writes(), writes);
    }

    #[test]
    fn reissue_only_replaces_the_certificate_it_was_issued_against() {
        let mut observed = Secret {
            metadata: identity_meta("etcd-server-tls", Some(NS)),
            data: Some(BTreeMap::from([(
                TLS_CERT_KEY.to_string(),
                ByteString(b"someone-else".to_vec()),
            )])),
            ..Default::default()
        };
        observed.metadata.resource_version = Some("9".to_string());

        let desired = DesiredSecret {
            type_: SECRET_TYPE_TLS.to_string(),
            data: BTreeMap::from([(TLS_CERT_KEY.to_string(), ByteString(b"ours".to_vec()))]),
            labels: BTreeMap::new(),
            cert_key: TLS_CERT_KEY,
            origin: Origin::Reissued {
                previous: ByteString(b"stale".to_vec()),
            },
        };
        let err = apply_certificate_secret(observed.clone(), &desired).unwrap_err();
        assert!(err.is_conflict());

        observed.data = Some(BTreeMap::from([(
            TLS_CERT_KEY.to_string(),
            ByteString(b"stale".to_vec()),
        )]));
        let replaced = apply_certificate_secret(observed, &desired).unwrap();
        assert_eq!(replaced.data.unwrap()[TLS_CERT_KEY].0, b"ours".to_vec());
    }

    #[tokio::test]
    async fn kubeconfig_is_derived_and_stable() {
        let store = Arc::new(MemoryStore::new());
        let certs = manager(&store);
        let (ca, _) = certs
            .ensure_certificate(&CertificateSecretConfig::ca("kube-apiserver-ca", "kube-apiserver-ca"))
            .await
            .unwrap();
        let config = CertificateSecretConfig::client("admin-kubeconfig", "system:admin", ca)
            .with_organizations(["system:masters"])
            .with_kubeconfig(KubeconfigRequest {
                cluster_name: "canopy-main".to_string(),
                server: "https://api.example.com".to_string(),
                user_name: "system:admin".to_string(),
            });

        let (first, first_sum) = certs.ensure_certificate(&config).await.unwrap();
        let (second, second_sum) = certs.ensure_certificate(&config).await.unwrap();

        let yaml = first.kubeconfig.clone().unwrap();
        assert!(yaml.contains("server: https://api.example.com"));
        assert_eq!(second.kubeconfig, first.kubeconfig);
        assert_eq!(first_sum, second_sum);

        let secret = stored_secret(&store, "admin-kubeconfig").await;
        assert!(data_keys(&secret).contains(&KUBECONFIG_KEY));
    }

    #[tokio::test]
    async fn changed_content_changes_checksum() {
        let store = Arc::new(MemoryStore::new());
        let certs = manager(&store);
        let config = CertificateSecretConfig::ca("etcd-ca", "etcd-ca");
        let (_, before) = certs.ensure_certificate(&config).await.unwrap();

        certs.delete_certificates(&["etcd-ca"]).await.unwrap();
        let (_, after) = certs.ensure_certificate(&config).await.unwrap();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn delete_tolerates_missing_secrets() {
        let store = Arc::new(MemoryStore::new());
        let certs = manager(&store);
        certs
            .ensure_certificate(&CertificateSecretConfig::ca("etcd-ca", "etcd-ca"))
            .await
            .unwrap();

        let names = ["etcd-ca", "never-created"];
        assert_eq!(certs.delete_certificates(&names).await.unwrap(), 1);
        assert_eq!(certs.delete_certificates(&names).await.unwrap(), 0);
    }

    #[test]
    fn pki_errors_convert_to_certificate_errors() {
        let err: Error = PkiError::ParseError("bad pem".to_string()).into();
        assert!(matches!(err, Error::Certificate { .. }));
        assert!(err.to_string().contains("bad pem"));
    }

    #[test]
    fn fresh_material_does_not_overwrite_a_racing_writer() {
        let mut observed = Secret {
            metadata: identity_meta("etcd-ca", Some(NS)),
            data: Some(BTreeMap::from([(
                CA_CERT_KEY.to_string(),
                ByteString(b"theirs".to_vec()),
            )])),
            ..Default::default()
        };
        observed.metadata.resource_version = Some("7".to_string());

        let desired = DesiredSecret {
            type_: SECRET_TYPE_OPAQUE.to_string(),
            data: BTreeMap::from([(CA_CERT_KEY.to_string(), ByteString(b"ours".to_vec()))]),
            labels: BTreeMap::new(),
            cert_key: CA_CERT_KEY,
            origin: Origin::Generated,
        };
        let err = apply_certificate_secret(observed, &desired).unwrap_err();
        assert!(err.is_conflict());
    }
}
