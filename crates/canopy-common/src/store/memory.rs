//! In-process resource store
//!
//! Behaves like the API server for the parts canopy relies on: server fields
//! are assigned on write, `update` is version-checked and `create` of an
//! existing object is a conflict. Every successful write is counted so
//! callers can assert that a pass changed nothing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use k8s_openapi::chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{ListScope, ResourceKey, ResourceStore};
use crate::{Error, Result};

/// In-memory [`ResourceStore`]
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<ResourceKey, Value>>,
    version: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful create, update and delete calls so far
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    /// True when an object with this key is stored
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.objects.lock().contains_key(key)
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

fn metadata_mut<'a>(
    key: &ResourceKey,
    obj: &'a mut Value,
) -> Result<&'a mut serde_json::Map<String, Value>> {
    let root = obj
        .as_object_mut()
        .ok_or_else(|| Error::serialization_for_kind(&key.kind, "object is not a JSON map"))?;
    let meta = root.entry("metadata").or_insert_with(|| json!({}));
    meta.as_object_mut()
        .ok_or_else(|| Error::serialization_for_kind(&key.kind, "metadata is not a JSON map"))
}

fn resource_version(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/resourceVersion").and_then(Value::as_str)
}

fn set_identity(key: &ResourceKey, obj: &mut Value) -> Result<()> {
    if let Some(root) = obj.as_object_mut() {
        root.insert("apiVersion".to_string(), json!(key.api_version));
        root.insert("kind".to_string(), json!(key.kind));
    }
    let meta = metadata_mut(key, obj)?;
    meta.insert("name".to_string(), json!(key.name));
    match &key.namespace {
        Some(ns) => meta.insert("namespace".to_string(), json!(ns)),
        None => meta.remove("namespace"),
    };
    Ok(())
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Value>> {
        Ok(self.objects.lock().get(key).cloned())
    }

    async fn create(&self, key: &ResourceKey, mut obj: Value) -> Result<Value> {
        let mut objects = self.objects.lock();
        if objects.contains_key(key) {
            return Err(Error::conflict_for(
                &key.kind,
                key.qualified_name(),
                "already exists",
            ));
        }

        set_identity(key, &mut obj)?;
        let version = self.next_version();
        let meta = metadata_mut(key, &mut obj)?;
        meta.insert("resourceVersion".to_string(), json!(version));
        meta.insert("uid".to_string(), json!(format!("uid-{:08}", version)));
        meta.insert(
            "creationTimestamp".to_string(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        );

        objects.insert(key.clone(), obj.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(obj)
    }

    async fn update(&self, key: &ResourceKey, mut obj: Value) -> Result<Value> {
        let mut objects = self.objects.lock();
        let stored = objects
            .get(key)
            .ok_or_else(|| Error::not_found(&key.kind, key.qualified_name()))?;

        let stored_version = resource_version(stored).map(str::to_string);
        if let Some(given) = resource_version(&obj) {
            if Some(given) != stored_version.as_deref() {
                return Err(Error::conflict_for(
                    &key.kind,
                    key.qualified_name(),
                    format!(
                        "resourceVersion {} is stale (current {})",
                        given,
                        stored_version.as_deref().unwrap_or("none")
                    ),
                ));
            }
        }

        let uid = stored.pointer("/metadata/uid").cloned();
        let created = stored.pointer("/metadata/creationTimestamp").cloned();

        set_identity(key, &mut obj)?;
        let version = self.next_version();
        let meta = metadata_mut(key, &mut obj)?;
        meta.insert("resourceVersion".to_string(), json!(version));
        if let Some(uid) = uid {
            meta.insert("uid".to_string(), uid);
        }
        if let Some(created) = created {
            meta.insert("creationTimestamp".to_string(), created);
        }

        objects.insert(key.clone(), obj.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(obj)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<bool> {
        let removed = self.objects.lock().remove(key).is_some();
        if removed {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    async fn list(&self, scope: &ListScope) -> Result<Vec<Value>> {
        Ok(self
            .objects
            .lock()
            .iter()
            .filter(|(key, _)| {
                key.api_version == scope.api_version
                    && key.kind == scope.kind
                    && (scope.namespace.is_none() || key.namespace == scope.namespace)
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{get_typed, identity_meta, list_typed, to_value};
    use k8s_openapi::api::core::v1::Secret;

    fn secret(name: &str) -> Secret {
        Secret {
            metadata: identity_meta(name, Some("canopy")),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_assigns_server_fields() {
        let store = MemoryStore::new();
        let key = ResourceKey::of::<Secret>("etcd-ca", Some("canopy"));
        let created = store
            .create(&key, to_value(&secret("etcd-ca")).unwrap())
            .await
            .unwrap();

        assert_eq!(resource_version(&created), Some("1"));
        assert!(created.pointer("/metadata/uid").is_some());
        assert!(created.pointer("/metadata/creationTimestamp").is_some());
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn create_of_existing_object_conflicts() {
        let store = MemoryStore::new();
        let key = ResourceKey::of::<Secret>("etcd-ca", Some("canopy"));
        store.create(&key, to_value(&secret("etcd-ca")).unwrap()).await.unwrap();

        let err = store
            .create(&key, to_value(&secret("etcd-ca")).unwrap())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.writes(), 1);
    }

    /// Story: two writers race on the same object, the stale one is rejected
    #[tokio::test]
    async fn story_stale_update_is_rejected() {
        let store = MemoryStore::new();
        let key = ResourceKey::of::<Secret>("etcd-ca", Some("canopy"));
        let created = store
            .create(&key, to_value(&secret("etcd-ca")).unwrap())
            .await
            .unwrap();

        // First writer wins and bumps the version
        let updated = store.update(&key, created.clone()).await.unwrap();
        assert_eq!(resource_version(&updated), Some("2"));
        assert_eq!(
            updated.pointer("/metadata/uid"),
            created.pointer("/metadata/uid")
        );

        // Second writer still holds version 1
        let err = store.update(&key, created).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn update_of_missing_object_is_not_found() {
        let store = MemoryStore::new();
        let key = ResourceKey::of::<Secret>("missing", Some("canopy"));
        let err = store
            .update(&key, to_value(&secret("missing")).unwrap())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_reports_absence() {
        let store = MemoryStore::new();
        let key = ResourceKey::of::<Secret>("etcd-ca", Some("canopy"));
        store.create(&key, to_value(&secret("etcd-ca")).unwrap()).await.unwrap();

        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn list_scopes_by_namespace() {
        let store = MemoryStore::new();
        for (name, ns) in [("a", "canopy"), ("b", "canopy"), ("c", "other")] {
            let obj = Secret {
                metadata: identity_meta(name, Some(ns)),
                ..Default::default()
            };
            let key = ResourceKey::of::<Secret>(name, Some(ns));
            store.create(&key, to_value(&obj).unwrap()).await.unwrap();
        }

        let in_canopy: Vec<Secret> = list_typed(&store, Some("canopy")).await.unwrap();
        assert_eq!(in_canopy.len(), 2);
        let everywhere: Vec<Secret> = list_typed(&store, None).await.unwrap();
        assert_eq!(everywhere.len(), 3);

        let fetched: Option<Secret> = get_typed(&store, "c", Some("other")).await.unwrap();
        assert_eq!(fetched.unwrap().metadata.namespace.as_deref(), Some("other"));
    }
}
