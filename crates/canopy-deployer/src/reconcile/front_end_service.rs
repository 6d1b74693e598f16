//! Front end load balancer
//!
//! The service is created first and polled until the infrastructure assigns
//! it an address. Certificates for the front end need that address, so the
//! front end task reads it back from the service rather than waiting again.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tokio_util::sync::CancellationToken;
use tracing::info;

use canopy_common::reconcile::ensure_desired_state;
use canopy_common::store::{get_typed, identity_meta};
use canopy_common::wait::{wait_for, LOAD_BALANCER_POLL_INTERVAL, LOAD_BALANCER_TIMEOUT};
use canopy_common::{Error, Result};
use canopy_provider::infrastructure::FRONT_END_PORT;

use super::merge_labels;
use crate::context::DeployContext;
use crate::exports::{ExportKey, ExportsCollector};
use crate::names::{FRONT_END_COMPONENT, FRONT_END_CONTAINER_PORT};

const SERVICE_TYPE: &str = "LoadBalancer";
const PORT_NAME: &str = "https";

fn apply_service(
    mut observed: Service,
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> Result<Service> {
    let spec = observed.spec.get_or_insert_with(Default::default);
    spec.type_ = Some(SERVICE_TYPE.to_string());
    spec.selector = Some(selector.clone());
    spec.ports = Some(vec![ServicePort {
        name: Some(PORT_NAME.to_string()),
        port: i32::from(FRONT_END_PORT),
        target_port: Some(IntOrString::Int(FRONT_END_CONTAINER_PORT)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }]);
    merge_labels(&mut observed.metadata.labels, labels);
    Ok(observed)
}

/// Address currently assigned to the front end service
pub async fn load_balancer_address(ctx: &DeployContext) -> Result<Option<String>> {
    let name = ctx.names().front_end();
    let service = get_typed::<Service>(ctx.store(), &name, Some(ctx.namespace())).await?;
    Ok(service.and_then(|s| ctx.infrastructure().load_balancer_address(&s)))
}

/// Address the front end must be reached at; fails when none is assigned yet
pub async fn require_address(ctx: &DeployContext) -> Result<String> {
    load_balancer_address(ctx).await?.ok_or_else(|| {
        Error::not_found(
            "load balancer address",
            format!("{}/{}", ctx.namespace(), ctx.names().front_end()),
        )
    })
}

/// Host clients connect to: the SNI hostname when set, else the address
pub fn public_host(ctx: &DeployContext, address: &str) -> String {
    ctx.config()
        .front_end
        .exposure
        .sni
        .as_ref()
        .map_or_else(|| address.to_string(), |sni| sni.hostname.clone())
}

/// Public URL of the front end at `address`
pub fn front_end_url(ctx: &DeployContext, address: &str) -> String {
    ctx.infrastructure().front_end_url(&public_host(ctx, address))
}

/// Ensure the service and wait for its address
pub async fn run(
    ctx: Arc<DeployContext>,
    exports: Arc<ExportsCollector>,
    cancel: CancellationToken,
) -> Result<()> {
    let names = ctx.names();
    let name = names.front_end();
    let selector = names.selector(&name);
    let labels = ctx.labels(FRONT_END_COMPONENT);

    let identity = Service {
        metadata: identity_meta(&name, Some(ctx.namespace())),
        ..Default::default()
    };
    ensure_desired_state(ctx.store(), identity, |observed| {
        apply_service(observed, &selector, &labels)
    })
    .await?;

    let what = format!("load balancer address of {name}");
    let address = wait_for(
        &what,
        LOAD_BALANCER_TIMEOUT,
        LOAD_BALANCER_POLL_INTERVAL,
        &cancel,
        || load_balancer_address(&ctx),
    )
    .await?;

    let url = front_end_url(&ctx, &address);
    info!(service = %name, %address, %url, "front end exposed");
    exports.record(ExportKey::FrontEndUrl, url)
}
