//! Generated secrets and config maps
//!
//! Stable generated material (the token signing key, the encryption key) is
//! read before the reconcile so the mutate step stays a plain function of its
//! inputs. A value is generated only when no stored one exists.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use rand::RngCore;
use tracing::info;

use canopy_common::checksum::{checksum_config_map, checksum_secret};
use canopy_common::reconcile::ensure_desired_state;
use canopy_common::store::{get_typed, identity_meta};
use canopy_common::{Error, Result};
use canopy_infra::certificates::SECRET_TYPE_OPAQUE;
use canopy_infra::pki::{generate_signing_key, load_signing_key};
use canopy_infra::SigningKey;
use canopy_provider::BackupConfig;

use crate::context::DeployContext;
use crate::names::{DATA_STORE_COMPONENT, FRONT_END_COMPONENT};
use crate::reconcile::merge_labels;

/// Private key entry of the signing key secret
pub const SIGNING_KEY_KEY: &str = "sa.key";
/// Public key entry of the signing key secret
pub const SIGNING_PUB_KEY: &str = "sa.pub";
/// Rendered configuration entry of the encryption secret
pub const ENCRYPTION_CONFIG_KEY: &str = "encryption-config.yaml";
/// Raw key entry of the encryption secret
pub const ENCRYPTION_KEY_KEY: &str = "key";
/// Policy entry of the audit config map
pub const AUDIT_POLICY_KEY: &str = "audit-policy.yaml";

const ENCRYPTION_KEY_NAME: &str = "key1";
const ENCRYPTION_KEY_BYTES: usize = 32;

/// A string entry of a secret's data
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()?
        .get(key)
        .and_then(|v| String::from_utf8(v.0.clone()).ok())
        .filter(|v| !v.is_empty())
}

/// Set a secret's type, data and labels, keeping everything else
pub fn apply_secret(
    mut observed: Secret,
    secret_type: &str,
    data: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> Result<Secret> {
    observed.type_ = Some(secret_type.to_string());
    observed.data = Some(
        data.iter()
            .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
            .collect(),
    );
    observed.string_data = None;
    merge_labels(&mut observed.metadata.labels, labels);
    Ok(observed)
}

/// Set a config map's data and labels, keeping everything else
pub fn apply_config_map(
    mut observed: ConfigMap,
    data: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> Result<ConfigMap> {
    observed.data = Some(data.clone());
    merge_labels(&mut observed.metadata.labels, labels);
    Ok(observed)
}

/// Converge an opaque secret and return its checksum
pub async fn ensure_secret(
    ctx: &DeployContext,
    name: &str,
    component: &str,
    data: &BTreeMap<String, String>,
) -> Result<String> {
    let labels = ctx.labels(component);
    let identity = Secret {
        metadata: identity_meta(name, Some(ctx.namespace())),
        ..Default::default()
    };
    let ensured = ensure_desired_state(ctx.store(), identity, |observed| {
        apply_secret(observed, SECRET_TYPE_OPAQUE, data, &labels)
    })
    .await?;
    Ok(checksum_secret(&ensured.object))
}

/// Converge a config map and return its checksum
pub async fn ensure_config_map(
    ctx: &DeployContext,
    name: &str,
    component: &str,
    data: &BTreeMap<String, String>,
) -> Result<String> {
    let labels = ctx.labels(component);
    let identity = ConfigMap {
        metadata: identity_meta(name, Some(ctx.namespace())),
        ..Default::default()
    };
    let ensured = ensure_desired_state(ctx.store(), identity, |observed| {
        apply_config_map(observed, data, &labels)
    })
    .await?;
    Ok(checksum_config_map(&ensured.object))
}

async fn stored_secret(ctx: &DeployContext, name: &str) -> Result<Option<Secret>> {
    get_typed::<Secret>(ctx.store(), name, Some(ctx.namespace())).await
}

/// Load or generate the service account signing key
pub async fn ensure_service_account_key(ctx: &DeployContext) -> Result<(SigningKey, String)> {
    let name = ctx.names().service_account_key();
    let stored = stored_secret(ctx, &name)
        .await?
        .and_then(|s| secret_value(&s, SIGNING_KEY_KEY));

    let key = match stored {
        Some(pem) => load_signing_key(&pem).map_err(|e| Error::certificate(&name, e.to_string()))?,
        None => {
            info!(secret = %name, "generating service account signing key");
            generate_signing_key().map_err(|e| Error::certificate(&name, e.to_string()))?
        }
    };

    let data = BTreeMap::from([
        (SIGNING_KEY_KEY.to_string(), key.private_key_pem.clone()),
        (SIGNING_PUB_KEY.to_string(), key.public_key_pem.clone()),
    ]);
    let sum = ensure_secret(ctx, &name, FRONT_END_COMPONENT, &data).await?;
    Ok((key, sum))
}

fn generate_encryption_key() -> String {
    let mut key = [0u8; ENCRYPTION_KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut key);
    STANDARD.encode(key)
}

/// Load or generate the encryption key and converge the rendered config
pub async fn ensure_encryption_config(ctx: &DeployContext) -> Result<String> {
    let name = ctx.names().encryption_config();
    let key = match stored_secret(ctx, &name)
        .await?
        .and_then(|s| secret_value(&s, ENCRYPTION_KEY_KEY))
    {
        Some(key) => key,
        None => {
            info!(secret = %name, "generating encryption key");
            generate_encryption_key()
        }
    };

    let rendered = ctx
        .templates()
        .encryption_config(ENCRYPTION_KEY_NAME, &key)?;
    let data = BTreeMap::from([
        (ENCRYPTION_CONFIG_KEY.to_string(), rendered),
        (ENCRYPTION_KEY_KEY.to_string(), key),
    ]);
    ensure_secret(ctx, &name, FRONT_END_COMPONENT, &data).await
}

/// Converge the rendered audit policy
pub async fn ensure_audit_policy(ctx: &DeployContext) -> Result<String> {
    let policy = ctx
        .templates()
        .audit_policy(ctx.names().instance(), &ctx.config().front_end.audit_level)?;
    let data = BTreeMap::from([(AUDIT_POLICY_KEY.to_string(), policy)]);
    ensure_config_map(ctx, &ctx.names().audit_policy(), FRONT_END_COMPONENT, &data).await
}

/// Converge the backup agent's credentials secret
pub async fn ensure_backup_credentials(
    ctx: &DeployContext,
    config: &BackupConfig,
) -> Result<String> {
    ensure_secret(
        ctx,
        &ctx.names().backup_credentials(),
        DATA_STORE_COMPONENT,
        &config.secret_data,
    )
    .await
}
