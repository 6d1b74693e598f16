//! Data store clusters
//!
//! Two StatefulSets, one per [`DataStoreRole`], each behind a headless
//! service that gives members stable DNS names. Both share one CA, one
//! serving certificate and one peer certificate. When backup is enabled each
//! member runs a backup agent sidecar configured by the backup provider.
//!
//! Pod templates carry a `checksum/*` annotation for every mounted secret so
//! a rotated certificate or changed credential rolls the members.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, SecretVolumeSource, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tokio_util::sync::CancellationToken;
use tracing::info;

use canopy_common::checksum::ChecksumMap;
use canopy_common::reconcile::ensure_desired_state;
use canopy_common::store::identity_meta;
use canopy_common::Result;
use canopy_infra::{Certificate, CertificateSecretConfig};
use canopy_provider::BackupConfig;

use super::{checkpoint, merge_labels};
use crate::context::DeployContext;
use crate::exports::{ExportKey, ExportsCollector};
use crate::names::{
    DataStoreRole, ResourceNames, DATA_STORE_CLIENT_PORT, DATA_STORE_COMPONENT,
    DATA_STORE_PEER_PORT,
};
use crate::secrets::ensure_backup_credentials;

/// Where members keep their data
pub const DATA_DIR: &str = "/var/lib/data-store";
/// Serving certificate mount
pub const SERVER_TLS_DIR: &str = "/etc/data-store/server";
/// Peer certificate mount
pub const PEER_TLS_DIR: &str = "/etc/data-store/peer";
/// Backup credentials mount
pub const BACKUP_CREDENTIALS_DIR: &str = "/etc/backup/credentials";

const DATA_VOLUME: &str = "data";
const SERVER_TLS_VOLUME: &str = "server-tls";
const PEER_TLS_VOLUME: &str = "peer-tls";
const BACKUP_CREDENTIALS_VOLUME: &str = "backup-credentials";
const DATA_STORE_CONTAINER: &str = "data-store";
const BACKUP_AGENT_CONTAINER: &str = "backup-agent";

/// CA for the data store; the front end task reloads it for its client cert
pub fn ca_config(names: &ResourceNames) -> CertificateSecretConfig {
    CertificateSecretConfig::ca(
        names.data_store_ca(),
        format!("{}-data-store-ca", names.instance()),
    )
}

/// Service DNS names of a role, short to fully qualified
fn service_dns_names(names: &ResourceNames, role: DataStoreRole, domain: &str) -> Vec<String> {
    let service = names.data_store(role);
    let ns = names.namespace();
    vec![
        service.clone(),
        format!("{service}.{ns}"),
        format!("{service}.{ns}.svc"),
        format!("{service}.{ns}.svc.{domain}"),
    ]
}

/// Per-member DNS names of a role
fn member_dns_names(names: &ResourceNames, role: DataStoreRole, domain: &str) -> Vec<String> {
    let service = names.data_store(role);
    let ns = names.namespace();
    vec![
        format!("*.{service}.{ns}.svc"),
        format!("*.{service}.{ns}.svc.{domain}"),
    ]
}

fn server_config(
    names: &ResourceNames,
    domain: &str,
    ca: Arc<Certificate>,
) -> CertificateSecretConfig {
    let mut dns = vec!["localhost".to_string()];
    for role in DataStoreRole::ALL {
        dns.extend(service_dns_names(names, role, domain));
        dns.extend(member_dns_names(names, role, domain));
    }
    CertificateSecretConfig::server(
        names.data_store_server(),
        format!("{}-data-store", names.instance()),
        ca,
    )
    .with_dns_names(dns)
    .with_ip_addresses([IpAddr::V4(Ipv4Addr::LOCALHOST)])
}

fn peer_config(
    names: &ResourceNames,
    domain: &str,
    ca: Arc<Certificate>,
) -> CertificateSecretConfig {
    let dns = DataStoreRole::ALL
        .into_iter()
        .flat_map(|role| member_dns_names(names, role, domain));
    CertificateSecretConfig::peer(
        names.data_store_peer(),
        format!("{}-data-store-peer", names.instance()),
        ca,
    )
    .with_dns_names(dns)
}

/// Inputs shared by both roles' workload builders
pub(crate) struct DataStoreInputs<'a> {
    pub names: &'a ResourceNames,
    pub replicas: i32,
    pub image: &'a str,
    pub storage_size: &'a str,
    pub storage_class: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub backup: Option<(&'a str, &'a BackupConfig)>,
}

fn headless_service(
    mut observed: Service,
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> Result<Service> {
    let spec = observed.spec.get_or_insert_with(ServiceSpec::default);
    spec.cluster_ip = Some("None".to_string());
    spec.publish_not_ready_addresses = Some(true);
    spec.selector = Some(selector.clone());
    spec.ports = Some(vec![
        ServicePort {
            name: Some("client".to_string()),
            port: DATA_STORE_CLIENT_PORT,
            target_port: Some(IntOrString::Int(DATA_STORE_CLIENT_PORT)),
            ..Default::default()
        },
        ServicePort {
            name: Some("peer".to_string()),
            port: DATA_STORE_PEER_PORT,
            target_port: Some(IntOrString::Int(DATA_STORE_PEER_PORT)),
            ..Default::default()
        },
    ]);
    merge_labels(&mut observed.metadata.labels, labels);
    Ok(observed)
}

fn member_url(member: &str, service: &str, ns: &str, port: i32) -> String {
    format!("https://{member}.{service}.{ns}.svc:{port}")
}

fn data_store_args(names: &ResourceNames, role: DataStoreRole, replicas: i32) -> Vec<String> {
    let service = names.data_store(role);
    let ns = names.namespace();
    let initial_cluster = (0..replicas)
        .map(|i| {
            let member = format!("{service}-{i}");
            format!("{member}={}", member_url(&member, &service, ns, DATA_STORE_PEER_PORT))
        })
        .collect::<Vec<_>>()
        .join(",");

    vec![
        "--name=$(POD_NAME)".to_string(),
        format!("--data-dir={DATA_DIR}"),
        format!("--listen-client-urls=https://0.0.0.0:{DATA_STORE_CLIENT_PORT}"),
        format!(
            "--advertise-client-urls={}",
            member_url("$(POD_NAME)", &service, ns, DATA_STORE_CLIENT_PORT)
        ),
        format!("--listen-peer-urls=https://0.0.0.0:{DATA_STORE_PEER_PORT}"),
        format!(
            "--initial-advertise-peer-urls={}",
            member_url("$(POD_NAME)", &service, ns, DATA_STORE_PEER_PORT)
        ),
        format!("--initial-cluster={initial_cluster}"),
        format!("--initial-cluster-token={service}"),
        "--initial-cluster-state=new".to_string(),
        "--client-cert-auth".to_string(),
        format!("--trusted-ca-file={SERVER_TLS_DIR}/ca.crt"),
        format!("--cert-file={SERVER_TLS_DIR}/tls.crt"),
        format!("--key-file={SERVER_TLS_DIR}/tls.key"),
        "--peer-client-cert-auth".to_string(),
        format!("--peer-trusted-ca-file={PEER_TLS_DIR}/ca.crt"),
        format!("--peer-cert-file={PEER_TLS_DIR}/tls.crt"),
        format!("--peer-key-file={PEER_TLS_DIR}/tls.key"),
    ]
}

fn secret_volume(name: &str, secret: String) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn pod_name_env() -> EnvVar {
    EnvVar {
        name: "POD_NAME".to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "metadata.name".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn backup_agent(
    names: &ResourceNames,
    role: DataStoreRole,
    image: &str,
    config: &BackupConfig,
) -> Container {
    let mut env_vars = vec![
        pod_name_env(),
        env("BACKUP_PROVIDER", config.provider_name.clone()),
        env("DATA_STORE_ENDPOINT", names.data_store_url(role)),
        env("DATA_STORE_CA_FILE", format!("{PEER_TLS_DIR}/ca.crt")),
        env("DATA_STORE_CERT_FILE", format!("{PEER_TLS_DIR}/tls.crt")),
        env("DATA_STORE_KEY_FILE", format!("{PEER_TLS_DIR}/tls.key")),
    ];
    env_vars.extend(config.env.iter().map(|(k, v)| env(k, v.clone())));

    Container {
        name: BACKUP_AGENT_CONTAINER.to_string(),
        image: Some(image.to_string()),
        env: Some(env_vars),
        volume_mounts: Some(vec![
            mount(PEER_TLS_VOLUME, PEER_TLS_DIR, true),
            mount(BACKUP_CREDENTIALS_VOLUME, BACKUP_CREDENTIALS_DIR, true),
        ]),
        ..Default::default()
    }
}

/// Claims carry the instance labels deletion selects on
fn volume_claim(
    storage_class: &str,
    size: &str,
    labels: &BTreeMap<String, String>,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some(storage_class.to_string()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Converge a role's StatefulSet toward the inputs
///
/// Volume claim templates are immutable once created, so an existing set
/// keeps the ones it was created with.
pub(crate) fn apply_stateful_set(
    mut observed: StatefulSet,
    role: DataStoreRole,
    inputs: &DataStoreInputs<'_>,
) -> Result<StatefulSet> {
    let names = inputs.names;
    let workload = names.data_store(role);
    let selector = names.selector(&workload);
    let mut pod_labels = inputs.labels.clone();
    pod_labels.extend(selector.clone());

    let mut containers = vec![Container {
        name: DATA_STORE_CONTAINER.to_string(),
        image: Some(inputs.image.to_string()),
        args: Some(data_store_args(names, role, inputs.replicas)),
        env: Some(vec![pod_name_env()]),
        ports: Some(vec![
            ContainerPort {
                name: Some("client".to_string()),
                container_port: DATA_STORE_CLIENT_PORT,
                ..Default::default()
            },
            ContainerPort {
                name: Some("peer".to_string()),
                container_port: DATA_STORE_PEER_PORT,
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![
            mount(DATA_VOLUME, DATA_DIR, false),
            mount(SERVER_TLS_VOLUME, SERVER_TLS_DIR, true),
            mount(PEER_TLS_VOLUME, PEER_TLS_DIR, true),
        ]),
        ..Default::default()
    }];
    let mut volumes = vec![
        secret_volume(SERVER_TLS_VOLUME, names.data_store_server()),
        secret_volume(PEER_TLS_VOLUME, names.data_store_peer()),
    ];
    if let Some((image, config)) = inputs.backup {
        containers.push(backup_agent(names, role, image, config));
        volumes.push(secret_volume(
            BACKUP_CREDENTIALS_VOLUME,
            names.backup_credentials(),
        ));
    }

    let claims = observed
        .spec
        .as_ref()
        .and_then(|s| s.volume_claim_templates.clone())
        .unwrap_or_else(|| {
            vec![volume_claim(
                &inputs.storage_class,
                inputs.storage_size,
                &inputs.labels,
            )]
        });

    let spec = observed.spec.get_or_insert_with(StatefulSetSpec::default);
    spec.replicas = Some(inputs.replicas);
    spec.service_name = workload;
    spec.pod_management_policy = Some("Parallel".to_string());
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
            containers,
            volumes: Some(volumes),
            ..Default::default()
        }),
    };
    spec.volume_claim_templates = Some(claims);
    merge_labels(&mut observed.metadata.labels, &inputs.labels);
    Ok(observed)
}

/// Ensure certificates, credentials and both data store clusters
pub async fn run(
    ctx: Arc<DeployContext>,
    exports: Arc<ExportsCollector>,
    cancel: CancellationToken,
) -> Result<()> {
    let config = ctx.config();
    let names = ctx.names();
    let domain = config.front_end.dns_domain.as_str();
    let certificates = ctx.certificates();

    let (ca, ca_sum) = certificates.ensure_certificate(&ca_config(names)).await?;
    let (_, server_sum) = certificates
        .ensure_certificate(&server_config(names, domain, ca.clone()))
        .await?;
    let (_, peer_sum) = certificates
        .ensure_certificate(&peer_config(names, domain, ca))
        .await?;

    let mut checksums = ChecksumMap::new()
        .with("data-store-ca", ca_sum)
        .with("server-tls", server_sum)
        .with("peer-tls", peer_sum);

    let backup_config = match ctx.backup_provider()? {
        Some(provider) => {
            let backup = provider.compute_backup_config(BACKUP_CREDENTIALS_DIR)?;
            let sum = ensure_backup_credentials(&ctx, &backup).await?;
            checksums.insert("backup-credentials", sum);
            Some(backup)
        }
        None => None,
    };

    let labels = ctx.labels(DATA_STORE_COMPONENT);
    let inputs = DataStoreInputs {
        names,
        replicas: config.data_store.replicas,
        image: &config.data_store.image,
        storage_size: &config.data_store.storage_size,
        storage_class: names.storage_class(),
        labels: labels.clone(),
        annotations: checksums.annotations(),
        backup: backup_config
            .as_ref()
            .map(|b| (config.data_store.backup_agent_image.as_str(), b)),
    };

    for role in DataStoreRole::ALL {
        let name = names.data_store(role);
        let selector = names.selector(&name);
        checkpoint(&cancel, &name)?;

        let service = Service {
            metadata: identity_meta(&name, Some(ctx.namespace())),
            ..Default::default()
        };
        ensure_desired_state(ctx.store(), service, |observed| {
            headless_service(observed, &selector, &labels)
        })
        .await?;

        let identity = StatefulSet {
            metadata: identity_meta(&name, Some(ctx.namespace())),
            ..Default::default()
        };
        let ensured = ensure_desired_state(ctx.store(), identity, |observed| {
            apply_stateful_set(observed, role, &inputs)
        })
        .await?;
        info!(statefulset = %name, operation = ?ensured.operation, "data store converged");
    }

    exports.record(ExportKey::DataStoreUrl, names.data_store_url(DataStoreRole::Main))
}
