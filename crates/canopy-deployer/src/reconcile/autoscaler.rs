//! Front end autoscaler
//!
//! Present only while autoscaling is enabled; turning it off removes it and
//! hands the replica count back to the deployment.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
    MetricSpec, MetricTarget, ResourceMetricSource,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use canopy_common::reconcile::{delete_if_exists, ensure_desired_state};
use canopy_common::store::identity_meta;
use canopy_common::Result;

use super::merge_labels;
use crate::config::AutoscalingSpec;
use crate::context::DeployContext;
use crate::exports::ExportsCollector;
use crate::names::FRONT_END_COMPONENT;

fn apply_autoscaler(
    mut observed: HorizontalPodAutoscaler,
    target: &str,
    spec: &AutoscalingSpec,
    labels: &BTreeMap<String, String>,
) -> Result<HorizontalPodAutoscaler> {
    observed.spec = Some(HorizontalPodAutoscalerSpec {
        scale_target_ref: CrossVersionObjectReference {
            api_version: Some("apps/v1".to_string()),
            kind: "Deployment".to_string(),
            name: target.to_string(),
        },
        min_replicas: Some(spec.min_replicas),
        max_replicas: spec.max_replicas,
        metrics: Some(vec![MetricSpec {
            type_: "Resource".to_string(),
            resource: Some(ResourceMetricSource {
                name: "cpu".to_string(),
                target: MetricTarget {
                    type_: "Utilization".to_string(),
                    average_utilization: Some(spec.target_cpu_utilization),
                    ..Default::default()
                },
            }),
            ..Default::default()
        }]),
        ..Default::default()
    });
    merge_labels(&mut observed.metadata.labels, labels);
    Ok(observed)
}

/// Create, update or remove the autoscaler
pub async fn run(
    ctx: Arc<DeployContext>,
    _exports: Arc<ExportsCollector>,
    _cancel: CancellationToken,
) -> Result<()> {
    let name = ctx.names().front_end();
    let autoscaling = &ctx.config().front_end.autoscaling;

    if !autoscaling.enabled {
        if delete_if_exists::<HorizontalPodAutoscaler>(ctx.store(), &name, Some(ctx.namespace()))
            .await?
        {
            debug!(autoscaler = %name, "autoscaling disabled, removed autoscaler");
        }
        return Ok(());
    }

    let labels = ctx.labels(FRONT_END_COMPONENT);
    let identity = HorizontalPodAutoscaler {
        metadata: identity_meta(&name, Some(ctx.namespace())),
        ..Default::default()
    };
    ensure_desired_state(ctx.store(), identity, |observed| {
        apply_autoscaler(observed, &name, autoscaling, &labels)
    })
    .await?;
    Ok(())
}
