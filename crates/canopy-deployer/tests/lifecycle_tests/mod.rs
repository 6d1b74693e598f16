//! Shared fixtures for lifecycle tests

mod delete;
mod failures;
mod reconcile;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use canopy_common::graph::{Progress, TaskState};
use canopy_common::store::{ListScope, MemoryStore, ResourceKey, ResourceStore};
use canopy_common::{Error, Result};
use canopy_deployer::{Deployer, DesiredState};
use canopy_provider::ProviderRegistry;

pub const NAMESPACE: &str = "tenants";

pub fn document(instance: &str) -> String {
    format!("namespace: {NAMESPACE}\ninstanceName: {instance}\ninfrastructureProvider: fake\n")
}

pub fn document_with_backup(instance: &str) -> String {
    format!(
        r#"{}deleteNamespace: true
credentials:
  local:
    provider: fake
dataStore:
  backup:
    enabled: true
    provider: fake
    credentialsRef: local
    bucketName: {instance}-backups
    region: local
"#,
        document(instance)
    )
}

pub fn deployer(
    yaml: &str,
    store: Arc<dyn ResourceStore>,
    registry: &ProviderRegistry,
) -> Deployer {
    let config = DesiredState::from_yaml(yaml).unwrap();
    Deployer::new(config, store, registry.clone()).unwrap()
}

/// Every progress transition, in order
#[derive(Clone, Default)]
pub struct ProgressLog {
    events: Arc<Mutex<Vec<(String, TaskState)>>>,
}

impl ProgressLog {
    pub fn callback(&self) -> impl Fn(&Progress) + Send + Sync + 'static {
        let events = self.events.clone();
        move |p: &Progress| events.lock().unwrap().push((p.task.clone(), p.state))
    }

    pub fn position(&self, task: &str, state: TaskState) -> Option<usize> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .position(|(t, s)| t == task && *s == state)
    }

    pub fn final_state(&self, task: &str) -> Option<TaskState> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(t, _)| t == task)
            .map(|(_, s)| *s)
    }
}

/// Memory store that rejects writes of selected kinds
pub struct FailingStore {
    pub inner: MemoryStore,
    failing_kinds: HashSet<String>,
    cancel_on: Option<(String, CancellationToken)>,
}

impl FailingStore {
    pub fn failing(kinds: &[&str]) -> Self {
        Self {
            inner: MemoryStore::new(),
            failing_kinds: kinds.iter().map(|k| k.to_string()).collect(),
            cancel_on: None,
        }
    }

    /// Cancel `token` right after the first successful create of `kind`
    pub fn cancelling_on(kind: &str, token: CancellationToken) -> Self {
        Self {
            cancel_on: Some((kind.to_string(), token)),
            ..Self::failing(&[])
        }
    }

    fn check(&self, key: &ResourceKey) -> Result<()> {
        if self.failing_kinds.contains(&key.kind) {
            return Err(Error::transport(
                format!("write {key}"),
                "connection reset by peer",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for FailingStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Value>> {
        self.inner.get(key).await
    }

    async fn create(&self, key: &ResourceKey, obj: Value) -> Result<Value> {
        self.check(key)?;
        let created = self.inner.create(key, obj).await?;
        if let Some((kind, token)) = &self.cancel_on {
            if kind == &key.kind {
                token.cancel();
            }
        }
        Ok(created)
    }

    async fn update(&self, key: &ResourceKey, obj: Value) -> Result<Value> {
        self.check(key)?;
        self.inner.update(key, obj).await
    }

    async fn delete(&self, key: &ResourceKey) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn list(&self, scope: &ListScope) -> Result<Vec<Value>> {
        self.inner.list(scope).await
    }
}
