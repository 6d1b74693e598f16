//! Delete task graph
//!
//! Built independently of the reconcile graph and run in reverse dependency
//! order: the front end goes first, then the data store, then the objects
//! both relied on. Every step tolerates objects that are already gone, so a
//! delete can be re-run after a partial failure.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, PersistentVolumeClaim, Secret, Service};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use canopy_common::graph::{TaskGraph, TaskGraphBuilder};
use canopy_common::reconcile::delete_if_exists;
use canopy_common::store::{list_typed, ResourceStore, StoredResource};
use canopy_common::wait::{poll_until, BUCKET_DELETION_TIMEOUT, BUCKET_POLL_INTERVAL};
use canopy_common::{Result, INSTANCE_LABEL_KEY};

use crate::context::DeployContext;
use crate::exports::ExportsCollector;
use crate::names::DataStoreRole;
use crate::reconcile::deploy_task;

/// Removes the front end and its generated configuration
pub const FRONT_END_TASK: &str = "delete-front-end";
/// Removes both data store clusters and their volumes
pub const DATA_STORE_TASK: &str = "delete-data-store";
/// Purges and removes the backup bucket
pub const BACKUP_BUCKET_TASK: &str = "delete-backup-bucket";
/// Removes every certificate secret
pub const CERTIFICATES_TASK: &str = "delete-certificates";
/// Removes the storage class
pub const STORAGE_CLASS_TASK: &str = "delete-storage-class";
/// Removes the namespace when nothing else lives in it
pub const NAMESPACE_TASK: &str = "delete-namespace";

/// Compile the delete graph for one instance
pub fn build_delete_graph(ctx: Arc<DeployContext>) -> Result<TaskGraph> {
    // Delete tasks record nothing, but share the reconcile task shape
    let exports = Arc::new(ExportsCollector::new());
    let backup_enabled = ctx.config().backup_enabled();
    let delete_namespace = ctx.config().delete_namespace;

    let graph = TaskGraphBuilder::new()
        .task(deploy_task(FRONT_END_TASK, &ctx, &exports, |ctx, _, _| async move {
            delete_front_end(&ctx).await
        }))
        .task(
            deploy_task(DATA_STORE_TASK, &ctx, &exports, |ctx, _, _| async move {
                delete_data_store(&ctx).await
            })
            .depends_on([FRONT_END_TASK]),
        )
        .task(
            deploy_task(BACKUP_BUCKET_TASK, &ctx, &exports, |ctx, _, cancel| async move {
                delete_backup_bucket(&ctx, &cancel).await
            })
            .depends_on([DATA_STORE_TASK])
            .do_if(move || backup_enabled),
        )
        .task(
            deploy_task(CERTIFICATES_TASK, &ctx, &exports, |ctx, _, _| async move {
                ctx.certificates()
                    .delete_certificates(&ctx.names().certificate_names())
                    .await
                    .map(|_| ())
            })
            .depends_on([FRONT_END_TASK, DATA_STORE_TASK]),
        )
        .task(
            deploy_task(STORAGE_CLASS_TASK, &ctx, &exports, |ctx, _, _| async move {
                delete_if_exists::<StorageClass>(ctx.store(), &ctx.names().storage_class(), None)
                    .await
                    .map(|_| ())
            })
            .depends_on([DATA_STORE_TASK]),
        )
        .task(
            deploy_task(NAMESPACE_TASK, &ctx, &exports, |ctx, _, _| async move {
                delete_namespace_if_unused(&ctx).await
            })
            .depends_on([
                FRONT_END_TASK,
                DATA_STORE_TASK,
                BACKUP_BUCKET_TASK,
                CERTIFICATES_TASK,
                STORAGE_CLASS_TASK,
            ])
            .do_if(move || delete_namespace),
        )
        .build()?;
    Ok(graph)
}

async fn delete_front_end(ctx: &DeployContext) -> Result<()> {
    let store = ctx.store();
    let names = ctx.names();
    let ns = Some(ctx.namespace());
    let front_end = names.front_end();

    delete_if_exists::<HorizontalPodAutoscaler>(store, &front_end, ns).await?;
    delete_if_exists::<Deployment>(store, &front_end, ns).await?;
    delete_if_exists::<Service>(store, &front_end, ns).await?;
    delete_if_exists::<ConfigMap>(store, &names.audit_policy(), ns).await?;
    delete_if_exists::<Secret>(store, &names.service_account_key(), ns).await?;
    delete_if_exists::<Secret>(store, &names.encryption_config(), ns).await?;
    Ok(())
}

async fn delete_data_store(ctx: &DeployContext) -> Result<()> {
    let store = ctx.store();
    let names = ctx.names();
    let ns = Some(ctx.namespace());

    for role in DataStoreRole::ALL {
        let name = names.data_store(role);
        delete_if_exists::<StatefulSet>(store, &name, ns).await?;
        delete_if_exists::<Service>(store, &name, ns).await?;
    }
    delete_if_exists::<Secret>(store, &names.backup_credentials(), ns).await?;

    let claims = list_typed::<PersistentVolumeClaim>(store, ns).await?;
    let mut deleted = 0;
    for claim in claims
        .iter()
        .filter(|c| instance_label(&c.metadata) == Some(names.instance()))
    {
        if let Some(name) = claim.metadata.name.as_deref() {
            if delete_if_exists::<PersistentVolumeClaim>(store, name, ns).await? {
                deleted += 1;
            }
        }
    }
    info!(claims = deleted, "data store volumes released");
    Ok(())
}

async fn delete_backup_bucket(ctx: &DeployContext, cancel: &CancellationToken) -> Result<()> {
    let Some(provider) = ctx.backup_provider()? else {
        return Ok(());
    };
    provider.delete_bucket().await?;

    let what = format!("deletion of bucket {}", provider.bucket().name);
    poll_until(&what, BUCKET_DELETION_TIMEOUT, BUCKET_POLL_INTERVAL, cancel, || {
        let provider = &provider;
        async move { provider.bucket_exists().await.map(|exists| !exists) }
    })
    .await
}

fn instance_label(meta: &ObjectMeta) -> Option<&str> {
    meta.labels.as_ref()?.get(INSTANCE_LABEL_KEY).map(String::as_str)
}

/// Whether any object of kind `K` in the namespace belongs to another instance
async fn foreign_objects<K: StoredResource>(
    store: &dyn ResourceStore,
    namespace: &str,
    instance: &str,
) -> Result<Vec<String>> {
    Ok(list_typed::<K>(store, Some(namespace))
        .await?
        .iter()
        .filter_map(|obj| {
            let meta = obj.meta();
            match instance_label(meta) {
                Some(owner) if owner != instance => Some(format!(
                    "{} {} ({owner})",
                    K::kind(&()),
                    meta.name.as_deref().unwrap_or_default()
                )),
                _ => None,
            }
        })
        .collect())
}

async fn delete_namespace_if_unused(ctx: &DeployContext) -> Result<()> {
    let store = ctx.store();
    let namespace = ctx.namespace();
    let instance = ctx.names().instance();

    let mut foreign = foreign_objects::<StatefulSet>(store, namespace, instance).await?;
    foreign.extend(foreign_objects::<Deployment>(store, namespace, instance).await?);
    foreign.extend(foreign_objects::<Service>(store, namespace, instance).await?);
    foreign.extend(foreign_objects::<Secret>(store, namespace, instance).await?);
    foreign.extend(foreign_objects::<ConfigMap>(store, namespace, instance).await?);

    if !foreign.is_empty() {
        info!(
            namespace,
            remaining = foreign.len(),
            first = %foreign[0],
            "namespace still hosts other instances, keeping it"
        );
        return Ok(());
    }

    if delete_if_exists::<Namespace>(store, namespace, None).await? {
        info!(namespace, "namespace deleted");
    } else {
        debug!(namespace, "namespace already gone");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_common::store::{identity_meta, MemoryStore};
    use canopy_common::reconcile::ensure_desired_state;
    use canopy_provider::ProviderRegistry;
    use std::collections::BTreeMap;

    use crate::config::DesiredState;

    fn context(store: Arc<MemoryStore>) -> DeployContext {
        let config = DesiredState::from_yaml(
            "namespace: tenants\ninstanceName: alpha\ninfrastructureProvider: fake\ndeleteNamespace: true\n",
        )
        .unwrap();
        DeployContext::new(config, store, ProviderRegistry::new()).unwrap()
    }

    async fn put_secret(store: &MemoryStore, name: &str, instance: &str) {
        let mut meta = identity_meta(name, Some("tenants"));
        meta.labels = Some(BTreeMap::from([(
            INSTANCE_LABEL_KEY.to_string(),
            instance.to_string(),
        )]));
        let identity = Secret {
            metadata: meta,
            ..Default::default()
        };
        ensure_desired_state(store, identity, Ok).await.unwrap();
    }

    async fn put_namespace(store: &MemoryStore) {
        let ns = Namespace {
            metadata: identity_meta("tenants", None),
            ..Default::default()
        };
        ensure_desired_state(store, ns, Ok).await.unwrap();
    }

    #[test]
    fn namespace_goes_last() {
        let store = Arc::new(MemoryStore::new());
        let graph = build_delete_graph(Arc::new(context(store))).unwrap();
        assert_eq!(graph.topological_ids().last(), Some(&NAMESPACE_TASK));
    }

    #[tokio::test]
    async fn namespace_shared_with_another_instance_is_kept() {
        let store = Arc::new(MemoryStore::new());
        put_namespace(&store).await;
        put_secret(&store, "beta-ca", "beta").await;

        let ctx = context(store.clone());
        delete_namespace_if_unused(&ctx).await.unwrap();
        assert!(get_namespace(&store).await.is_some());
    }

    #[tokio::test]
    async fn namespace_with_only_own_leftovers_is_deleted() {
        let store = Arc::new(MemoryStore::new());
        put_namespace(&store).await;
        put_secret(&store, "alpha-ca", "alpha").await;

        let ctx = context(store.clone());
        delete_namespace_if_unused(&ctx).await.unwrap();
        assert!(get_namespace(&store).await.is_none());
    }

    async fn get_namespace(store: &MemoryStore) -> Option<Namespace> {
        canopy_common::store::get_typed::<Namespace>(store, "tenants", None)
            .await
            .unwrap()
    }
}
