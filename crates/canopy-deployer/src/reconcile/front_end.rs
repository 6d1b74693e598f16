//! Front end deployment
//!
//! Runs after the data store and the load balancer. It needs the data store
//! CA for its client certificate and the load balancer address for its own
//! serving certificate and the admin kubeconfig.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, KeyToPath, PodSpec, PodTemplateSpec,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use tokio_util::sync::CancellationToken;
use tracing::info;

use canopy_common::checksum::ChecksumMap;
use canopy_common::reconcile::ensure_desired_state;
use canopy_common::store::identity_meta;
use canopy_common::{Error, Result};
use canopy_infra::{Certificate, CertificateSecretConfig, KubeconfigRequest};

use super::data_store::ca_config as data_store_ca_config;
use super::front_end_service::{front_end_url, public_host, require_address};
use super::{checkpoint, merge_labels};
use crate::context::DeployContext;
use crate::exports::{ExportKey, ExportsCollector};
use crate::names::{DataStoreRole, ResourceNames, FRONT_END_COMPONENT, FRONT_END_CONTAINER_PORT};
use crate::secrets::{
    ensure_audit_policy, ensure_encryption_config, ensure_service_account_key,
    AUDIT_POLICY_KEY, ENCRYPTION_CONFIG_KEY, SIGNING_KEY_KEY, SIGNING_PUB_KEY,
};

const CONTAINER: &str = "front-end";
const ADMIN_USER: &str = "admin";
const ADMIN_GROUP: &str = "system:masters";

const TLS_DIR: &str = "/etc/front-end/tls";
const DATA_STORE_TLS_DIR: &str = "/etc/front-end/data-store";
const SERVICE_ACCOUNT_DIR: &str = "/etc/front-end/service-account";
const ENCRYPTION_DIR: &str = "/etc/front-end/encryption";
const AUDIT_DIR: &str = "/etc/front-end/audit";

/// Names the front end must answer to inside the hosting cluster
fn in_cluster_dns_names(names: &ResourceNames, domain: &str) -> Vec<String> {
    let service = names.front_end();
    let ns = names.namespace();
    vec![
        "localhost".to_string(),
        "kubernetes".to_string(),
        "kubernetes.default".to_string(),
        "kubernetes.default.svc".to_string(),
        format!("kubernetes.default.svc.{domain}"),
        service.clone(),
        format!("{service}.{ns}"),
        format!("{service}.{ns}.svc"),
        format!("{service}.{ns}.svc.{domain}"),
    ]
}

/// Serving certificate SANs: in-cluster names, the public host and the address
pub(crate) fn serving_sans(
    names: &ResourceNames,
    domain: &str,
    address: &str,
    sni_hostname: Option<&str>,
) -> (Vec<String>, Vec<IpAddr>) {
    let mut dns = in_cluster_dns_names(names, domain);
    let mut ips = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
    match address.parse::<IpAddr>() {
        Ok(ip) => ips.push(ip),
        Err(_) => dns.push(address.to_string()),
    }
    if let Some(host) = sni_hostname {
        dns.push(host.to_string());
    }
    dns.sort();
    dns.dedup();
    ips.dedup();
    (dns, ips)
}

fn secret_volume(name: &str, secret: String, items: Option<&[&str]>) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret),
            items: items.map(|keys| {
                keys.iter()
                    .map(|k| KeyToPath {
                        key: k.to_string(),
                        path: k.to_string(),
                        ..Default::default()
                    })
                    .collect()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

fn front_end_args(names: &ResourceNames, external_url: &str, external_host: &str) -> Vec<String> {
    vec![
        format!("--secure-port={FRONT_END_CONTAINER_PORT}"),
        format!("--etcd-servers={}", names.data_store_url(DataStoreRole::Main)),
        format!(
            "--etcd-servers-overrides=/events#{}",
            names.data_store_url(DataStoreRole::Events)
        ),
        format!("--etcd-cafile={DATA_STORE_TLS_DIR}/ca.crt"),
        format!("--etcd-certfile={DATA_STORE_TLS_DIR}/tls.crt"),
        format!("--etcd-keyfile={DATA_STORE_TLS_DIR}/tls.key"),
        format!("--client-ca-file={TLS_DIR}/ca.crt"),
        format!("--tls-cert-file={TLS_DIR}/tls.crt"),
        format!("--tls-private-key-file={TLS_DIR}/tls.key"),
        format!("--service-account-key-file={SERVICE_ACCOUNT_DIR}/{SIGNING_PUB_KEY}"),
        format!("--service-account-signing-key-file={SERVICE_ACCOUNT_DIR}/{SIGNING_KEY_KEY}"),
        format!("--service-account-issuer={external_url}"),
        format!("--external-hostname={external_host}"),
        format!("--encryption-provider-config={ENCRYPTION_DIR}/{ENCRYPTION_CONFIG_KEY}"),
        format!("--audit-policy-file={AUDIT_DIR}/{AUDIT_POLICY_KEY}"),
        "--audit-log-path=-".to_string(),
        "--authorization-mode=Node,RBAC".to_string(),
        "--allow-privileged=true".to_string(),
    ]
}

/// Everything the deployment mutate needs
pub(crate) struct FrontEndInputs<'a> {
    pub names: &'a ResourceNames,
    pub image: &'a str,
    pub replicas: i32,
    pub autoscaling: bool,
    pub external_url: String,
    pub external_host: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Converge the front end deployment
///
/// With autoscaling on, the replica count belongs to the autoscaler once the
/// deployment exists.
pub(crate) fn apply_deployment(
    mut observed: Deployment,
    inputs: &FrontEndInputs<'_>,
) -> Result<Deployment> {
    let names = inputs.names;
    let workload = names.front_end();
    let selector = names.selector(&workload);
    let mut pod_labels = inputs.labels.clone();
    pod_labels.extend(selector.clone());

    let container = Container {
        name: CONTAINER.to_string(),
        image: Some(inputs.image.to_string()),
        command: Some(vec!["kube-apiserver".to_string()]),
        args: Some(front_end_args(names, &inputs.external_url, &inputs.external_host)),
        ports: Some(vec![ContainerPort {
            name: Some("https".to_string()),
            container_port: FRONT_END_CONTAINER_PORT,
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            mount("tls", TLS_DIR),
            mount("data-store-tls", DATA_STORE_TLS_DIR),
            mount("service-account", SERVICE_ACCOUNT_DIR),
            mount("encryption", ENCRYPTION_DIR),
            mount("audit", AUDIT_DIR),
        ]),
        ..Default::default()
    };
    let volumes = vec![
        secret_volume("tls", names.front_end_server(), None),
        secret_volume("data-store-tls", names.data_store_client(), None),
        secret_volume(
            "service-account",
            names.service_account_key(),
            Some(&[SIGNING_KEY_KEY, SIGNING_PUB_KEY]),
        ),
        secret_volume(
            "encryption",
            names.encryption_config(),
            Some(&[ENCRYPTION_CONFIG_KEY]),
        ),
        Volume {
            name: "audit".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: names.audit_policy(),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    let existing_replicas = observed.spec.as_ref().and_then(|s| s.replicas);
    let spec = observed.spec.get_or_insert_with(DeploymentSpec::default);
    spec.replicas = match (inputs.autoscaling, existing_replicas) {
        (true, Some(current)) => Some(current),
        _ => Some(inputs.replicas),
    };
    spec.selector = LabelSelector {
        match_labels: Some(selector),
        ..Default::default()
    };
    spec.template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(pod_labels),
            annotations: (!inputs.annotations.is_empty()).then(|| inputs.annotations.clone()),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: Some(volumes),
            ..Default::default()
        }),
    };
    merge_labels(&mut observed.metadata.labels, &inputs.labels);
    Ok(observed)
}

async fn ensure_front_end_certificates(
    ctx: &DeployContext,
    address: &str,
    external_url: &str,
    checksums: &mut ChecksumMap,
) -> Result<(Arc<Certificate>, Arc<Certificate>)> {
    let names = ctx.names();
    let config = ctx.config();
    let certificates = ctx.certificates();

    let (data_store_ca, _) = certificates
        .ensure_certificate(&data_store_ca_config(names))
        .await?;
    let (_, client_sum) = certificates
        .ensure_certificate(&CertificateSecretConfig::client(
            names.data_store_client(),
            format!("{}-front-end", names.instance()),
            data_store_ca,
        ))
        .await?;
    checksums.insert("data-store-tls", client_sum);

    let (ca, ca_sum) = certificates
        .ensure_certificate(&CertificateSecretConfig::ca(
            names.front_end_ca(),
            format!("{}-ca", names.instance()),
        ))
        .await?;
    checksums.insert("ca", ca_sum);

    let sni = config.front_end.exposure.sni.as_ref().map(|s| s.hostname.as_str());
    let (dns, ips) = serving_sans(names, &config.front_end.dns_domain, address, sni);
    let (_, server_sum) = certificates
        .ensure_certificate(
            &CertificateSecretConfig::server(
                names.front_end_server(),
                format!("{}-front-end", names.instance()),
                ca.clone(),
            )
            .with_dns_names(dns)
            .with_ip_addresses(ips),
        )
        .await?;
    checksums.insert("tls", server_sum);

    let (admin, _) = certificates
        .ensure_certificate(
            &CertificateSecretConfig::client(names.admin(), ADMIN_USER, ca.clone())
                .with_organizations([ADMIN_GROUP])
                .with_kubeconfig(KubeconfigRequest {
                    cluster_name: names.instance().to_string(),
                    server: external_url.to_string(),
                    user_name: ADMIN_USER.to_string(),
                }),
        )
        .await?;

    Ok((ca, admin))
}

/// Ensure certificates, generated configuration and the deployment
pub async fn run(
    ctx: Arc<DeployContext>,
    exports: Arc<ExportsCollector>,
    cancel: CancellationToken,
) -> Result<()> {
    let names = ctx.names();
    let config = ctx.config();

    let address = require_address(&ctx).await?;
    let external_url = front_end_url(&ctx, &address);

    let mut checksums = ChecksumMap::new();
    let (ca, admin) =
        ensure_front_end_certificates(&ctx, &address, &external_url, &mut checksums).await?;

    let (signing_key, sa_sum) = ensure_service_account_key(&ctx).await?;
    checksums.insert("service-account", sa_sum);
    checksums.insert("encryption", ensure_encryption_config(&ctx).await?);
    checksums.insert("audit", ensure_audit_policy(&ctx).await?);

    let inputs = FrontEndInputs {
        names,
        image: &config.front_end.image,
        replicas: config.front_end.replicas,
        autoscaling: config.front_end.autoscaling.enabled,
        external_url,
        external_host: public_host(&ctx, &address),
        labels: ctx.labels(FRONT_END_COMPONENT),
        annotations: checksums.annotations(),
    };
    checkpoint(&cancel, &names.front_end())?;
    let identity = Deployment {
        metadata: identity_meta(&names.front_end(), Some(ctx.namespace())),
        ..Default::default()
    };
    let ensured = ensure_desired_state(ctx.store(), identity, |observed| {
        apply_deployment(observed, &inputs)
    })
    .await?;
    info!(deployment = %names.front_end(), operation = ?ensured.operation, "front end converged");

    let kubeconfig = admin
        .kubeconfig
        .clone()
        .ok_or_else(|| Error::certificate(names.admin(), "no kubeconfig was derived"))?;
    exports.record(ExportKey::CaBundle, ca.certificate_pem.clone())?;
    exports.record(ExportKey::Kubeconfig, kubeconfig)?;
    exports.record(ExportKey::ServiceAccountSigningKey, signing_key.private_key_pem)
}
