//! Client kubeconfig derivation
//!
//! A derived kubeconfig has one cluster trusting the issuing CA, one user
//! authenticating with a client certificate, and one context tying them
//! together. Output is deterministic for the same inputs, so a reloaded
//! certificate yields a byte-identical kubeconfig.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::pki::PkiError;

/// Kubeconfig document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// API version
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Kind (always "Config")
    pub kind: String,
    /// Clusters
    pub clusters: Vec<NamedCluster>,
    /// Users
    pub users: Vec<NamedUser>,
    /// Contexts
    pub contexts: Vec<NamedContext>,
    /// Current context
    pub current_context: String,
}

/// Cluster entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCluster {
    /// Cluster name
    pub name: String,
    /// Cluster config
    pub cluster: ClusterConfig,
}

/// Cluster configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// API server URL
    pub server: String,
    /// CA certificate (base64 encoded PEM)
    pub certificate_authority_data: String,
}

/// User entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedUser {
    /// User name
    pub name: String,
    /// User config
    pub user: UserConfig,
}

/// Client certificate credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserConfig {
    /// Client certificate (base64 encoded PEM)
    pub client_certificate_data: String,
    /// Client key (base64 encoded PEM)
    pub client_key_data: String,
}

/// Context entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedContext {
    /// Context name
    pub name: String,
    /// Context config
    pub context: ContextConfig,
}

/// Context configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Cluster name (reference)
    pub cluster: String,
    /// User name (reference)
    pub user: String,
}

/// Build a kubeconfig for a client certificate
pub fn build_client_kubeconfig(
    cluster_name: &str,
    server: &str,
    user_name: &str,
    ca_certificate_pem: &str,
    client_certificate_pem: &str,
    client_key_pem: &str,
) -> Kubeconfig {
    Kubeconfig {
        api_version: "v1".into(),
        kind: "Config".into(),
        clusters: vec![NamedCluster {
            name: cluster_name.to_string(),
            cluster: ClusterConfig {
                server: server.to_string(),
                certificate_authority_data: STANDARD.encode(ca_certificate_pem.as_bytes()),
            },
        }],
        users: vec![NamedUser {
            name: user_name.to_string(),
            user: UserConfig {
                client_certificate_data: STANDARD.encode(client_certificate_pem.as_bytes()),
                client_key_data: STANDARD.encode(client_key_pem.as_bytes()),
            },
        }],
        contexts: vec![NamedContext {
            name: cluster_name.to_string(),
            context: ContextConfig {
                cluster: cluster_name.to_string(),
                user: user_name.to_string(),
            },
        }],
        current_context: cluster_name.to_string(),
    }
}

impl Kubeconfig {
    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String, PkiError> {
        serde_yaml::to_string(self)
            .map_err(|e| PkiError::Kubeconfig(format!("failed to serialize: {}", e)))
    }

    /// Parse from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self, PkiError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| PkiError::Kubeconfig(format!("failed to parse: {}", e)))
    }
}
