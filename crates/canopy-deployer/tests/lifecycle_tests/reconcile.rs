//! Reconcile flows

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::Secret;
use tokio_util::sync::CancellationToken;

use canopy_common::graph::TaskState;
use canopy_common::store::{get_typed, MemoryStore};
use canopy_common::{Error, CHECKSUM_ANNOTATION_PREFIX};
use canopy_deployer::reconcile::{BACKUP_BUCKET_TASK, DATA_STORE_TASK, FRONT_END_TASK};
use canopy_deployer::secrets::secret_value;
use canopy_infra::certificates::{CA_CERT_KEY, TLS_CERT_KEY};
use canopy_infra::kubeconfig::Kubeconfig;
use canopy_infra::pki::verify_signed_by;
use canopy_provider::ProviderRegistry;

use super::{deployer, document, document_with_backup, ProgressLog, NAMESPACE};

async fn secret(store: &MemoryStore, name: &str) -> Secret {
    get_typed::<Secret>(store, name, Some(NAMESPACE))
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("secret {name} missing"))
}

fn pod_checksums(annotations: Option<&BTreeMap<String, String>>) -> Vec<(String, String)> {
    annotations
        .into_iter()
        .flatten()
        .filter(|(k, _)| k.starts_with(CHECKSUM_ANNOTATION_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

async fn front_end_checksums(store: &MemoryStore) -> Vec<(String, String)> {
    let deployment = get_typed::<Deployment>(store, "alpha-front-end", Some(NAMESPACE))
        .await
        .unwrap()
        .unwrap();
    let template = deployment.spec.unwrap().template;
    pod_checksums(template.metadata.as_ref().and_then(|m| m.annotations.as_ref()))
}

/// Story: a fresh instance converges, exports are complete, and a second
/// pass with the same document writes nothing and exports the same values
#[tokio::test]
async fn story_second_reconcile_is_a_no_op() {
    let store = Arc::new(MemoryStore::new());
    let registry = ProviderRegistry::new();
    let cancel = CancellationToken::new();

    let first = deployer(&document("alpha"), store.clone(), &registry)
        .reconcile(&cancel, None)
        .await
        .unwrap();
    assert_eq!(first.front_end_url, "https://alpha-front-end.tenants.svc:443");
    assert_eq!(first.data_store_url, "https://alpha-data-store.tenants.svc:2379");
    assert!(first.ca_bundle.contains("BEGIN CERTIFICATE"));
    assert!(first.service_account_signing_key.contains("PRIVATE KEY"));

    let kubeconfig = Kubeconfig::from_yaml(&first.kubeconfig).unwrap();
    assert_eq!(kubeconfig.clusters[0].cluster.server, first.front_end_url);

    let checksums = front_end_checksums(&store).await;
    assert!(checksums.len() >= 5, "{checksums:?}");
    let writes = store.writes();

    let second = deployer(&document("alpha"), store.clone(), &registry)
        .reconcile(&cancel, None)
        .await
        .unwrap();
    assert_eq!(store.writes(), writes);
    assert_eq!(second, first);
    assert_eq!(front_end_checksums(&store).await, checksums);
}

/// Every leaf chains to the CA it was issued for
#[tokio::test]
async fn leaves_chain_to_their_cas() {
    let store = Arc::new(MemoryStore::new());
    deployer(&document("alpha"), store.clone(), &ProviderRegistry::new())
        .reconcile(&CancellationToken::new(), None)
        .await
        .unwrap();

    let data_store_ca =
        secret_value(&secret(&store, "alpha-data-store-ca").await, CA_CERT_KEY).unwrap();
    let front_end_ca = secret_value(&secret(&store, "alpha-ca").await, CA_CERT_KEY).unwrap();

    for (leaf, ca) in [
        ("alpha-data-store-server", &data_store_ca),
        ("alpha-data-store-peer", &data_store_ca),
        ("alpha-data-store-client", &data_store_ca),
        ("alpha-front-end-server", &front_end_ca),
        ("alpha-admin", &front_end_ca),
    ] {
        let leaf_secret = secret(&store, leaf).await;
        let cert = secret_value(&leaf_secret, TLS_CERT_KEY).unwrap();
        verify_signed_by(&cert, ca).unwrap_or_else(|e| panic!("{leaf}: {e}"));
        assert_eq!(secret_value(&leaf_secret, CA_CERT_KEY).as_ref(), Some(ca), "{leaf}");
    }
}

/// Story: with backup on, the bucket exists before the data store starts and
/// the agent is wired into every member
#[tokio::test]
async fn story_backup_bucket_precedes_data_store() {
    let store = Arc::new(MemoryStore::new());
    let registry = ProviderRegistry::new();
    let log = ProgressLog::default();
    let callback = log.callback();

    deployer(&document_with_backup("alpha"), store.clone(), &registry)
        .reconcile(&CancellationToken::new(), Some(&callback))
        .await
        .unwrap();

    let bucket_done = log.position(BACKUP_BUCKET_TASK, TaskState::Succeeded).unwrap();
    let data_store_started = log.position(DATA_STORE_TASK, TaskState::Running).unwrap();
    assert!(bucket_done < data_store_started);
    assert_eq!(registry.fake_storage().bucket_names(), vec!["alpha-backups".to_string()]);

    let set = get_typed::<StatefulSet>(&*store, "alpha-data-store", Some(NAMESPACE))
        .await
        .unwrap()
        .unwrap();
    let template = set.spec.unwrap().template;
    let checksums =
        pod_checksums(template.metadata.as_ref().and_then(|m| m.annotations.as_ref()));
    assert!(checksums.iter().any(|(k, _)| k == "checksum/backup-credentials"));
    assert_eq!(template.spec.unwrap().containers.len(), 2);
}

/// Backup off: the bucket task is skipped and its dependents still run
#[tokio::test]
async fn disabled_backup_is_skipped_not_blocking() {
    let store = Arc::new(MemoryStore::new());
    let registry = ProviderRegistry::new();
    let log = ProgressLog::default();
    let callback = log.callback();

    deployer(&document("alpha"), store.clone(), &registry)
        .reconcile(&CancellationToken::new(), Some(&callback))
        .await
        .unwrap();

    assert_eq!(log.final_state(BACKUP_BUCKET_TASK), Some(TaskState::Skipped));
    assert_eq!(log.final_state(DATA_STORE_TASK), Some(TaskState::Succeeded));
    assert_eq!(log.final_state(FRONT_END_TASK), Some(TaskState::Succeeded));
    assert!(registry.fake_storage().bucket_names().is_empty());
}

/// Story: a rotated leaf changes exactly the checksum of the secret it lives in
#[tokio::test]
async fn story_rotated_certificate_rolls_the_front_end() {
    let store = Arc::new(MemoryStore::new());
    let registry = ProviderRegistry::new();
    let cancel = CancellationToken::new();

    deployer(&document("alpha"), store.clone(), &registry)
        .reconcile(&cancel, None)
        .await
        .unwrap();
    let before = front_end_checksums(&store).await;

    // Dropping the secret forces a fresh serving certificate on the next pass
    canopy_common::reconcile::delete_if_exists::<Secret>(
        &*store,
        "alpha-front-end-server",
        Some(NAMESPACE),
    )
    .await
    .unwrap();

    deployer(&document("alpha"), store.clone(), &registry)
        .reconcile(&cancel, None)
        .await
        .unwrap();
    let after = front_end_checksums(&store).await;

    let changed: Vec<_> = before
        .iter()
        .zip(&after)
        .filter(|(b, a)| b != a)
        .map(|(b, _)| b.0.as_str())
        .collect();
    assert_eq!(changed, vec!["checksum/tls"]);
}

async fn data_store_checksums(store: &MemoryStore) -> Vec<(String, String)> {
    let set = get_typed::<StatefulSet>(store, "alpha-data-store", Some(NAMESPACE))
        .await
        .unwrap()
        .unwrap();
    let template = set.spec.unwrap().template;
    pod_checksums(template.metadata.as_ref().and_then(|m| m.annotations.as_ref()))
}

/// Story: the data store CA secret is lost; the next pass regenerates it,
/// reissues every leaf it signed and rolls both workloads
#[tokio::test]
async fn story_lost_ca_is_recovered_by_reconciling_again() {
    let store = Arc::new(MemoryStore::new());
    let registry = ProviderRegistry::new();
    let cancel = CancellationToken::new();

    let first = deployer(&document("alpha"), store.clone(), &registry)
        .reconcile(&cancel, None)
        .await
        .unwrap();
    let data_store_before = data_store_checksums(&store).await;
    let front_end_before = front_end_checksums(&store).await;

    canopy_common::reconcile::delete_if_exists::<Secret>(
        &*store,
        "alpha-data-store-ca",
        Some(NAMESPACE),
    )
    .await
    .unwrap();

    let second = deployer(&document("alpha"), store.clone(), &registry)
        .reconcile(&cancel, None)
        .await
        .unwrap();
    assert_eq!(second.ca_bundle, first.ca_bundle);

    let ca = secret_value(&secret(&store, "alpha-data-store-ca").await, CA_CERT_KEY).unwrap();
    for leaf in [
        "alpha-data-store-server",
        "alpha-data-store-peer",
        "alpha-data-store-client",
    ] {
        let cert = secret_value(&secret(&store, leaf).await, TLS_CERT_KEY).unwrap();
        verify_signed_by(&cert, &ca).unwrap_or_else(|e| panic!("{leaf}: {e}"));
    }
    assert_ne!(data_store_checksums(&store).await, data_store_before);
    assert_ne!(front_end_checksums(&store).await, front_end_before);

    let writes = store.writes();
    deployer(&document("alpha"), store.clone(), &registry)
        .reconcile(&cancel, None)
        .await
        .unwrap();
    assert_eq!(store.writes(), writes);
}

async fn autoscaler(store: &MemoryStore) -> Option<HorizontalPodAutoscaler> {
    get_typed::<HorizontalPodAutoscaler>(store, "alpha-front-end", Some(NAMESPACE))
        .await
        .unwrap()
}

/// Autoscaling on creates the autoscaler; turning it off removes it
#[tokio::test]
async fn autoscaler_follows_the_toggle() {
    let store = Arc::new(MemoryStore::new());
    let registry = ProviderRegistry::new();
    let cancel = CancellationToken::new();
    let enabled = format!("{}frontEnd:\n  autoscaling:\n    enabled: true\n", document("alpha"));

    deployer(&enabled, store.clone(), &registry)
        .reconcile(&cancel, None)
        .await
        .unwrap();
    let hpa = autoscaler(&store).await;
    assert!(hpa.is_some());

    deployer(&document("alpha"), store.clone(), &registry)
        .reconcile(&cancel, None)
        .await
        .unwrap();
    let hpa = autoscaler(&store).await;
    assert!(hpa.is_none());
}

/// A token cancelled up front stops every task before it writes
#[tokio::test]
async fn cancelled_before_start_writes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = deployer(&document("alpha"), store.clone(), &ProviderRegistry::new())
        .reconcile(&cancel, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled { .. }), "{err}");
    assert_eq!(store.writes(), 0);
}
