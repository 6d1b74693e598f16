//! Delete flows

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Secret};
use k8s_openapi::api::storage::v1::StorageClass;
use tokio_util::sync::CancellationToken;

use canopy_common::reconcile::ensure_desired_state;
use canopy_common::store::{get_typed, identity_meta, list_typed, MemoryStore};
use canopy_common::INSTANCE_LABEL_KEY;
use canopy_provider::ProviderRegistry;

use super::{deployer, document, document_with_backup, NAMESPACE};

fn owned_by<'a>(secrets: &'a [Secret], instance: &'a str) -> impl Iterator<Item = &'a Secret> {
    secrets.iter().filter(move |s| {
        s.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(INSTANCE_LABEL_KEY))
            .is_some_and(|owner| owner == instance)
    })
}

async fn put_claim(store: &MemoryStore, name: &str, instance: &str) {
    let mut metadata = identity_meta(name, Some(NAMESPACE));
    metadata.labels = Some(BTreeMap::from([(
        INSTANCE_LABEL_KEY.to_string(),
        instance.to_string(),
    )]));
    let claim = PersistentVolumeClaim {
        metadata,
        ..Default::default()
    };
    ensure_desired_state(store, claim, Ok).await.unwrap();
}

/// Story: an instance with backup is deployed, data lands in the bucket, and
/// two deletes in a row leave nothing behind
#[tokio::test]
async fn story_delete_removes_everything_and_repeats_cleanly() {
    let store = Arc::new(MemoryStore::new());
    let registry = ProviderRegistry::new();
    let cancel = CancellationToken::new();
    let yaml = document_with_backup("alpha");

    deployer(&yaml, store.clone(), &registry)
        .reconcile(&cancel, None)
        .await
        .unwrap();
    registry
        .fake_storage()
        .put_object("alpha-backups", "snapshots/0001.db")
        .unwrap();
    put_claim(&store, "data-alpha-data-store-0", "alpha").await;

    deployer(&yaml, store.clone(), &registry)
        .delete(&cancel, None)
        .await
        .unwrap();

    assert!(get_typed::<Namespace>(&*store, NAMESPACE, None)
        .await
        .unwrap()
        .is_none());
    assert!(registry.fake_storage().bucket_names().is_empty());
    let secrets = list_typed::<Secret>(&*store, Some(NAMESPACE)).await.unwrap();
    assert_eq!(owned_by(&secrets, "alpha").count(), 0);
    assert!(list_typed::<PersistentVolumeClaim>(&*store, Some(NAMESPACE))
        .await
        .unwrap()
        .is_empty());
    assert!(get_typed::<StorageClass>(&*store, "tenants-alpha-data-store", None)
        .await
        .unwrap()
        .is_none());

    deployer(&yaml, store.clone(), &registry)
        .delete(&cancel, None)
        .await
        .unwrap();
}

/// Story: two instances share a namespace; deleting one keeps the namespace
/// and everything the other one owns
#[tokio::test]
async fn story_shared_namespace_survives_one_delete() {
    let store = Arc::new(MemoryStore::new());
    let registry = ProviderRegistry::new();
    let cancel = CancellationToken::new();
    let alpha = format!("{}deleteNamespace: true\n", document("alpha"));

    deployer(&alpha, store.clone(), &registry)
        .reconcile(&cancel, None)
        .await
        .unwrap();
    deployer(&document("beta"), store.clone(), &registry)
        .reconcile(&cancel, None)
        .await
        .unwrap();
    put_claim(&store, "data-alpha-data-store-0", "alpha").await;
    put_claim(&store, "data-beta-data-store-0", "beta").await;

    deployer(&alpha, store.clone(), &registry)
        .delete(&cancel, None)
        .await
        .unwrap();

    assert!(get_typed::<Namespace>(&*store, NAMESPACE, None)
        .await
        .unwrap()
        .is_some());

    let secrets = list_typed::<Secret>(&*store, Some(NAMESPACE)).await.unwrap();
    assert_eq!(owned_by(&secrets, "alpha").count(), 0);
    assert!(owned_by(&secrets, "beta").count() > 0);

    assert!(get_typed::<Deployment>(&*store, "alpha-front-end", Some(NAMESPACE))
        .await
        .unwrap()
        .is_none());
    assert!(get_typed::<Deployment>(&*store, "beta-front-end", Some(NAMESPACE))
        .await
        .unwrap()
        .is_some());
    assert!(get_typed::<StatefulSet>(&*store, "beta-data-store", Some(NAMESPACE))
        .await
        .unwrap()
        .is_some());

    let claims: Vec<_> = list_typed::<PersistentVolumeClaim>(&*store, Some(NAMESPACE))
        .await
        .unwrap()
        .into_iter()
        .filter_map(|c| c.metadata.name)
        .collect();
    assert_eq!(claims, vec!["data-beta-data-store-0".to_string()]);
}

/// Deleting an instance that was never deployed succeeds
#[tokio::test]
async fn delete_of_missing_instance_is_a_no_op() {
    let store = Arc::new(MemoryStore::new());

    deployer(&document("ghost"), store.clone(), &ProviderRegistry::new())
        .delete(&CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(store.writes(), 0);
}
