//! Resource names and labels for one instance

use std::collections::BTreeMap;

use canopy_common::{
    COMPONENT_LABEL_KEY, INSTANCE_LABEL_KEY, MANAGED_BY_LABEL_KEY, MANAGED_BY_VALUE,
};

/// Component label of data store resources
pub const DATA_STORE_COMPONENT: &str = "data-store";
/// Component label of front end resources
pub const FRONT_END_COMPONENT: &str = "front-end";
/// Component label of certificate secrets
pub const PKI_COMPONENT: &str = "pki";

/// Data store client port
pub const DATA_STORE_CLIENT_PORT: i32 = 2379;
/// Data store peer port
pub const DATA_STORE_PEER_PORT: i32 = 2380;
/// Port the front end container listens on
pub const FRONT_END_CONTAINER_PORT: i32 = 6443;

/// The two data store clusters behind one front end
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataStoreRole {
    /// Cluster state
    Main,
    /// Event objects, kept apart to shield the main store from churn
    Events,
}

impl DataStoreRole {
    /// Both roles
    pub const ALL: [DataStoreRole; 2] = [Self::Main, Self::Events];

    fn suffix(self) -> &'static str {
        match self {
            Self::Main => "data-store",
            Self::Events => "data-store-events",
        }
    }
}

/// Name derivation for one instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceNames {
    instance: String,
    namespace: String,
}

impl ResourceNames {
    /// Names for `instance` in `namespace`
    pub fn new(instance: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            namespace: namespace.into(),
        }
    }

    /// Instance name
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn prefixed(&self, suffix: &str) -> String {
        format!("{}-{}", self.instance, suffix)
    }

    /// Data store CA secret
    pub fn data_store_ca(&self) -> String {
        self.prefixed("data-store-ca")
    }

    /// Data store serving certificate secret
    pub fn data_store_server(&self) -> String {
        self.prefixed("data-store-server")
    }

    /// Data store peer certificate secret
    pub fn data_store_peer(&self) -> String {
        self.prefixed("data-store-peer")
    }

    /// Front end's data store client certificate secret
    pub fn data_store_client(&self) -> String {
        self.prefixed("data-store-client")
    }

    /// Front end CA secret
    pub fn front_end_ca(&self) -> String {
        self.prefixed("ca")
    }

    /// Front end serving certificate secret
    pub fn front_end_server(&self) -> String {
        self.prefixed("front-end-server")
    }

    /// Admin client certificate secret, also carrying the kubeconfig
    pub fn admin(&self) -> String {
        self.prefixed("admin")
    }

    /// Every certificate secret, leaves before their CAs
    pub fn certificate_names(&self) -> Vec<String> {
        vec![
            self.admin(),
            self.front_end_server(),
            self.data_store_client(),
            self.data_store_peer(),
            self.data_store_server(),
            self.front_end_ca(),
            self.data_store_ca(),
        ]
    }

    /// Service account signing key secret
    pub fn service_account_key(&self) -> String {
        self.prefixed("service-account-key")
    }

    /// Encryption configuration secret
    pub fn encryption_config(&self) -> String {
        self.prefixed("encryption-config")
    }

    /// Audit policy config map
    pub fn audit_policy(&self) -> String {
        self.prefixed("audit-policy")
    }

    /// Backup agent credentials secret
    pub fn backup_credentials(&self) -> String {
        self.prefixed("backup-credentials")
    }

    /// Cluster-scoped storage class for data store volumes
    pub fn storage_class(&self) -> String {
        format!("{}-{}-data-store", self.namespace, self.instance)
    }

    /// StatefulSet and headless service of a data store role
    pub fn data_store(&self, role: DataStoreRole) -> String {
        self.prefixed(role.suffix())
    }

    /// In-cluster client URL of a data store role
    pub fn data_store_url(&self, role: DataStoreRole) -> String {
        format!(
            "https://{}.{}.svc:{}",
            self.data_store(role),
            self.namespace,
            DATA_STORE_CLIENT_PORT
        )
    }

    /// Front end deployment, load balancer service and autoscaler
    pub fn front_end(&self) -> String {
        self.prefixed("front-end")
    }

    /// Labels stamped on every resource of `component`
    pub fn labels(&self, component: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (INSTANCE_LABEL_KEY.to_string(), self.instance.clone()),
            (COMPONENT_LABEL_KEY.to_string(), component.to_string()),
            (MANAGED_BY_LABEL_KEY.to_string(), MANAGED_BY_VALUE.to_string()),
        ])
    }

    /// Pod selector of a workload
    pub fn selector(&self, workload: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (INSTANCE_LABEL_KEY.to_string(), self.instance.clone()),
            ("app.kubernetes.io/name".to_string(), workload.to_string()),
        ])
    }
}
