//! Instance namespace

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use tokio_util::sync::CancellationToken;

use canopy_common::reconcile::ensure_desired_state;
use canopy_common::store::identity_meta;
use canopy_common::{Result, MANAGED_BY_LABEL_KEY, MANAGED_BY_VALUE};

use super::merge_labels;
use crate::context::DeployContext;
use crate::exports::ExportsCollector;

/// Namespaces are shared between instances, so only the manager label is set
fn apply_namespace(mut observed: Namespace) -> Result<Namespace> {
    merge_labels(
        &mut observed.metadata.labels,
        &BTreeMap::from([(MANAGED_BY_LABEL_KEY.to_string(), MANAGED_BY_VALUE.to_string())]),
    );
    Ok(observed)
}

/// Ensure the namespace exists
pub async fn run(
    ctx: Arc<DeployContext>,
    _exports: Arc<ExportsCollector>,
    _cancel: CancellationToken,
) -> Result<()> {
    let identity = Namespace {
        metadata: identity_meta(ctx.namespace(), None),
        ..Default::default()
    };
    ensure_desired_state(ctx.store(), identity, apply_namespace).await?;
    Ok(())
}
