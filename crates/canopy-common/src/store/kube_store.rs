//! Resource store backed by the Kubernetes API server
//!
//! All objects go through `Api<DynamicObject>` with an `ApiResource` built
//! from the key, so native types and CRDs share one code path.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tracing::{debug, trace};

use super::{ListScope, ResourceKey, ResourceStore};
use crate::{Error, Result};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Page size when listing collections
const LIST_PAGE_SIZE: u32 = 500;

/// Create a kube client from an optional kubeconfig path
///
/// Falls back to in-cluster / default kubeconfig inference when no path is given.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::validation_for_field(
                    "kubeconfig",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::validation_for_field(
                        "kubeconfig",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::transport("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config)
        .map_err(|e| Error::transport("create_client", format!("failed to create client: {}", e)))
}

/// Split "group/version" into its parts ("v1" has an empty group)
fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

fn api_resource(api_version: &str, kind: &str, plural: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(&group, &version, kind), plural)
}

/// [`ResourceStore`] over a live cluster
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(
        &self,
        api_version: &str,
        kind: &str,
        plural: &str,
        namespace: Option<&str>,
    ) -> Api<DynamicObject> {
        let ar = api_resource(api_version, kind, plural);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn api_for(&self, key: &ResourceKey) -> Api<DynamicObject> {
        self.api(&key.api_version, &key.kind, &key.plural, key.namespace.as_deref())
    }
}

/// Attach the key's identity to kube errors so messages name the object
fn map_kube_error(key: &ResourceKey, op: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(&key.kind, key.qualified_name()),
        kube::Error::Api(ae) if ae.code == 409 => {
            Error::conflict_for(&key.kind, key.qualified_name(), ae.message)
        }
        other => Error::transport(format!("{} {}", op, key), other.to_string()),
    }
}

fn to_dynamic(key: &ResourceKey, obj: serde_json::Value) -> Result<DynamicObject> {
    serde_json::from_value(obj)
        .map_err(|e| Error::serialization_for_kind(&key.kind, e.to_string()))
}

fn from_dynamic(key: &ResourceKey, obj: DynamicObject) -> Result<serde_json::Value> {
    serde_json::to_value(obj).map_err(|e| Error::serialization_for_kind(&key.kind, e.to_string()))
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<serde_json::Value>> {
        trace!(resource = %key, "get");
        let obj = self
            .api_for(key)
            .get_opt(&key.name)
            .await
            .map_err(|e| map_kube_error(key, "get", e))?;
        obj.map(|o| from_dynamic(key, o)).transpose()
    }

    async fn create(
        &self,
        key: &ResourceKey,
        obj: serde_json::Value,
    ) -> Result<serde_json::Value> {
        debug!(resource = %key, "create");
        let created = self
            .api_for(key)
            .create(&PostParams::default(), &to_dynamic(key, obj)?)
            .await
            .map_err(|e| map_kube_error(key, "create", e))?;
        from_dynamic(key, created)
    }

    async fn update(
        &self,
        key: &ResourceKey,
        obj: serde_json::Value,
    ) -> Result<serde_json::Value> {
        debug!(resource = %key, "update");
        let updated = self
            .api_for(key)
            .replace(&key.name, &PostParams::default(), &to_dynamic(key, obj)?)
            .await
            .map_err(|e| map_kube_error(key, "update", e))?;
        from_dynamic(key, updated)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<bool> {
        debug!(resource = %key, "delete");
        match self.api_for(key).delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(map_kube_error(key, "delete", e)),
        }
    }

    async fn list(&self, scope: &ListScope) -> Result<Vec<serde_json::Value>> {
        let api = self.api(
            &scope.api_version,
            &scope.kind,
            &scope.plural,
            scope.namespace.as_deref(),
        );
        let mut items = Vec::new();
        let mut params = ListParams::default().limit(LIST_PAGE_SIZE);
        loop {
            let page = api.list(&params).await.map_err(|e| {
                Error::transport(format!("list {}", scope.kind), e.to_string())
            })?;
            for obj in page.items {
                items.push(
                    serde_json::to_value(obj)
                        .map_err(|e| Error::serialization_for_kind(&scope.kind, e.to_string()))?,
                );
            }
            match page.metadata.continue_ {
                Some(token) if !token.is_empty() => params = params.continue_token(&token),
                _ => break,
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_splits_group_and_version() {
        assert_eq!(
            parse_api_version("apps/v1"),
            ("apps".to_string(), "v1".to_string())
        );
        assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
        assert_eq!(
            parse_api_version("autoscaling/v2"),
            ("autoscaling".to_string(), "v2".to_string())
        );
    }

    #[test]
    fn api_resource_keeps_plural() {
        let ar = api_resource("storage.k8s.io/v1", "StorageClass", "storageclasses");
        assert_eq!(ar.group, "storage.k8s.io");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.kind, "StorageClass");
        assert_eq!(ar.plural, "storageclasses");
        assert_eq!(ar.api_version, "storage.k8s.io/v1");
    }

    #[test]
    fn not_found_errors_name_the_object() {
        let key = ResourceKey {
            api_version: "v1".to_string(),
            kind: "Secret".to_string(),
            plural: "secrets".to_string(),
            namespace: Some("canopy".to_string()),
            name: "etcd-ca".to_string(),
        };
        let err = map_kube_error(
            &key,
            "get",
            kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "not found".to_string(),
                reason: "NotFound".to_string(),
                code: 404,
            }),
        );
        assert_eq!(err.to_string(), "Secret canopy/etcd-ca not found");
    }
}
