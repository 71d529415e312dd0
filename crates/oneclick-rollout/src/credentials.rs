//! Registry pull-credential provisioning
//!
//! Turns an image's registry username and password into a
//! `kubernetes.io/dockerconfigjson` Secret owned by the rollout, so the
//! workload or a scheduled task can reference it in `imagePullSecrets`.

use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use tracing::debug;

use oneclick_common::crd::{ImageSpec, Rollout};
use oneclick_common::kube_utils::{owned_metadata, pull_secret_name};
use oneclick_common::{Error, Result};

use crate::managed::{collect_garbage, ensure, OwnedFields, PassContext};

/// Secret type for registry credentials
pub const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";

/// Data key holding the serialized registry config
pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

impl OwnedFields for Secret {
    const KIND: &'static str = "Secret";

    fn drifted(live: &Self, desired: &Self) -> bool {
        live.data != desired.data
    }

    fn overwrite(live: &mut Self, desired: &Self) {
        live.data = desired.data.clone();
        live.string_data = None;
    }
}

/// Serialized `{"auths": {registry: {username, password, auth}}}` payload
pub fn docker_config_json(image: &ImageSpec) -> Result<Vec<u8>> {
    let auth = STANDARD.encode(format!("{}:{}", image.username, image.password));
    let config = serde_json::json!({
        "auths": {
            (image.registry.as_str()): {
                "username": image.username,
                "password": image.password,
                "auth": auth,
            }
        }
    });
    serde_json::to_vec(&config)
        .map_err(|e| Error::serialization_for_kind("Secret", e.to_string()))
}

/// Desired pull-credential Secret named after `owner`
pub fn build_pull_secret(rollout: &Rollout, owner: &str, image: &ImageSpec) -> Result<Secret> {
    Ok(Secret {
        metadata: owned_metadata(rollout, pull_secret_name(owner))?,
        type_: Some(DOCKER_CONFIG_JSON_TYPE.to_string()),
        data: Some(BTreeMap::from([(
            DOCKER_CONFIG_JSON_KEY.to_string(),
            ByteString(docker_config_json(image)?),
        )])),
        ..Default::default()
    })
}

/// Provision the pull secret for `owner` when the image carries credentials
///
/// Returns the secret name to reference, or `None` when there are no
/// credentials. Secrets left behind by removed tasks or dropped credentials
/// are removed by [`collect_pull_secrets`].
pub async fn ensure_pull_secret(
    ctx: &PassContext<'_>,
    owner: &str,
    image: &ImageSpec,
) -> Result<Option<String>> {
    if !image.has_credentials() {
        return Ok(None);
    }
    let secret = build_pull_secret(ctx.rollout, owner, image)?;
    let name = pull_secret_name(owner);
    let outcome = ensure(ctx, secret).await?;
    debug!(secret = %name, ?outcome, "pull secret reconciled");
    Ok(Some(name))
}

/// Names of the pull secrets the rollout currently calls for
pub fn expected_pull_secrets(rollout: &Rollout) -> BTreeSet<String> {
    let workload = rollout
        .spec
        .image
        .has_credentials()
        .then(|| pull_secret_name(&rollout.name_any()));
    let tasks = rollout
        .spec
        .cron_jobs
        .iter()
        .filter(|task| task.image.has_credentials())
        .map(|task| pull_secret_name(&task.name));
    workload.into_iter().chain(tasks).collect()
}

/// Remove label-owned pull secrets no image references any more
///
/// Only Secrets carrying the rollout's ownership labels are considered, so
/// the bulk environment secret and TLS secrets are never touched.
pub async fn collect_pull_secrets(ctx: &PassContext<'_>) -> Result<usize> {
    collect_garbage::<Secret>(ctx, &expected_pull_secrets(ctx.rollout)).await
}
