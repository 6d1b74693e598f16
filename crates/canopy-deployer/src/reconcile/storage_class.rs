//! Storage class for data store volumes
//!
//! Cluster-scoped, so its name carries the namespace as well as the instance.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::storage::v1::StorageClass;
use tokio_util::sync::CancellationToken;

use canopy_common::reconcile::ensure_desired_state;
use canopy_common::store::identity_meta;
use canopy_common::Result;

use super::merge_labels;
use crate::context::DeployContext;
use crate::exports::ExportsCollector;
use crate::names::DATA_STORE_COMPONENT;

/// Volumes outlive their claims
const RECLAIM_POLICY: &str = "Retain";
const BINDING_MODE: &str = "WaitForFirstConsumer";

fn apply_storage_class(
    mut observed: StorageClass,
    provisioner: &str,
    parameters: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> Result<StorageClass> {
    observed.provisioner = provisioner.to_string();
    observed.parameters = (!parameters.is_empty()).then(|| parameters.clone());
    observed.reclaim_policy = Some(RECLAIM_POLICY.to_string());
    observed.volume_binding_mode = Some(BINDING_MODE.to_string());
    observed.allow_volume_expansion = Some(true);
    merge_labels(&mut observed.metadata.labels, labels);
    Ok(observed)
}

/// Ensure the storage class matches the infrastructure provider
pub async fn run(
    ctx: Arc<DeployContext>,
    _exports: Arc<ExportsCollector>,
    _cancel: CancellationToken,
) -> Result<()> {
    let infrastructure = ctx.infrastructure();
    let provisioner = infrastructure.storage_provisioner();
    let parameters = infrastructure.storage_class_parameters();
    let labels = ctx.labels(DATA_STORE_COMPONENT);

    let identity = StorageClass {
        metadata: identity_meta(&ctx.names().storage_class(), None),
        ..Default::default()
    };
    ensure_desired_state(ctx.store(), identity, |observed| {
        apply_storage_class(observed, provisioner, &parameters, &labels)
    })
    .await?;
    Ok(())
}
