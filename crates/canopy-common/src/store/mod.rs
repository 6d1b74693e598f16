//! Remote resource store adapter
//!
//! Canopy talks to the hosting cluster through a small CRUD surface over
//! untyped JSON objects. Typed k8s-openapi resources are converted at the
//! edge with serde, so the same store works for Secrets, StatefulSets and
//! cluster-scoped objects like StorageClasses.
//!
//! Two implementations ship with the crate:
//! - [`KubeStore`]: the real API server via `kube::Api<DynamicObject>`
//! - [`MemoryStore`]: an in-process store with resource versions and
//!   conflict detection, used by tests and dry runs

mod kube_store;
mod memory;

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

pub use self::kube_store::{create_client, KubeStore};
pub use self::memory::MemoryStore;

/// Identity of an object in the remote store
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Full API version (e.g., "apps/v1", "v1")
    pub api_version: String,
    /// Kind (e.g., "StatefulSet")
    pub kind: String,
    /// Plural resource name used in API paths (e.g., "statefulsets")
    pub plural: String,
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ResourceKey {
    /// Build the key for a typed resource
    pub fn of<K: StoredResource>(name: &str, namespace: Option<&str>) -> Self {
        Self {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            plural: K::plural(&()).into_owned(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Build the key from an object's own metadata
    pub fn from_object<K: StoredResource>(obj: &K) -> Result<Self> {
        let meta = obj.meta();
        let name = meta.name.as_deref().ok_or_else(|| {
            Error::validation_for(K::kind(&()).into_owned(), "object identity has no name")
        })?;
        Ok(Self::of::<K>(name, meta.namespace.as_deref()))
    }

    /// "namespace/name" or just "name" for cluster-scoped objects
    pub fn qualified_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.qualified_name())
    }
}

/// Selects a collection of objects of one kind, optionally within a namespace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListScope {
    /// Full API version
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Plural resource name
    pub plural: String,
    /// Namespace to scope the listing to
    pub namespace: Option<String>,
}

impl ListScope {
    /// Scope for a typed resource
    pub fn of<K: StoredResource>(namespace: Option<&str>) -> Self {
        Self {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            plural: K::plural(&()).into_owned(),
            namespace: namespace.map(str::to_string),
        }
    }
}

/// Resource types that can round-trip through the store
///
/// Blanket-implemented for every k8s-openapi resource.
pub trait StoredResource:
    ::kube::Resource<DynamicType = ()>
    + Clone
    + fmt::Debug
    + PartialEq
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoredResource for K where
    K: ::kube::Resource<DynamicType = ()>
        + Clone
        + fmt::Debug
        + PartialEq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// CRUD surface of the remote store
///
/// `update` is version-checked: an object whose `metadata.resourceVersion`
/// doesn't match the stored one is rejected with [`Error::Conflict`].
/// `create` of an existing object is also a conflict.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch an object, `None` if absent
    async fn get(&self, key: &ResourceKey) -> Result<Option<serde_json::Value>>;

    /// Create an object, returning the stored form with server fields set
    async fn create(&self, key: &ResourceKey, obj: serde_json::Value)
        -> Result<serde_json::Value>;

    /// Replace an object, returning the stored form
    async fn update(&self, key: &ResourceKey, obj: serde_json::Value)
        -> Result<serde_json::Value>;

    /// Delete an object, returning false if it didn't exist
    async fn delete(&self, key: &ResourceKey) -> Result<bool>;

    /// List objects of one kind
    async fn list(&self, scope: &ListScope) -> Result<Vec<serde_json::Value>>;
}

/// Convert a typed object into the store's JSON form
pub fn to_value<K: StoredResource>(obj: &K) -> Result<serde_json::Value> {
    serde_json::to_value(obj)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()).into_owned(), e.to_string()))
}

/// Convert the store's JSON form back into a typed object
pub fn from_value<K: StoredResource>(value: serde_json::Value) -> Result<K> {
    serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()).into_owned(), e.to_string()))
}

/// Fetch a typed object
pub async fn get_typed<K: StoredResource>(
    store: &dyn ResourceStore,
    name: &str,
    namespace: Option<&str>,
) -> Result<Option<K>> {
    let key = ResourceKey::of::<K>(name, namespace);
    store.get(&key).await?.map(from_value).transpose()
}

/// List typed objects
pub async fn list_typed<K: StoredResource>(
    store: &dyn ResourceStore,
    namespace: Option<&str>,
) -> Result<Vec<K>> {
    store
        .list(&ListScope::of::<K>(namespace))
        .await?
        .into_iter()
        .map(from_value)
        .collect()
}

/// Metadata with just a name and optional namespace, for identity objects
pub fn identity_meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        ..Default::default()
    }
}
