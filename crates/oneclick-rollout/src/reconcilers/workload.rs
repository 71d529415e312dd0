//! Workload (Deployment) reconciler
//!
//! One Deployment named after the rollout. The replica count belongs to the
//! autoscaler: it is never part of the comparison and every overwrite keeps
//! whatever value is live.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EnvFromSource, LocalObjectReference,
    PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec,
    SecretEnvSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use oneclick_common::checksum::secrets_checksum;
use oneclick_common::crd::{Rollout, SecurityContextSpec};
use oneclick_common::kube_utils::{
    claim_name, env_secret_name, owned_metadata, ownership_labels, workload_name,
};
use oneclick_common::{Result, SECRETS_CHECKSUM_ANNOTATION};

use super::{container_resources, env_vars, list_eq, map_eq, non_empty, resources_equal, str_eq};
use crate::credentials::ensure_pull_secret;
use crate::managed::{ensure, OwnedFields, Outcome, PassContext};

fn pod_security_context(sc: &SecurityContextSpec) -> Option<PodSecurityContext> {
    let pod = PodSecurityContext {
        fs_group: sc.fs_group,
        run_as_user: sc.run_as_user,
        run_as_group: sc.run_as_group,
        ..Default::default()
    };
    (pod != PodSecurityContext::default()).then_some(pod)
}

fn container_security_context(sc: &SecurityContextSpec) -> SecurityContext {
    let capabilities = (!sc.capabilities.add.is_empty() || !sc.capabilities.drop.is_empty())
        .then(|| Capabilities {
            add: non_empty(sc.capabilities.add.clone()),
            drop: non_empty(sc.capabilities.drop.clone()),
        });
    SecurityContext {
        allow_privilege_escalation: Some(sc.allow_privilege_escalation),
        privileged: Some(sc.privileged),
        read_only_root_filesystem: Some(sc.read_only_root_filesystem),
        run_as_non_root: Some(sc.run_as_non_root),
        capabilities,
        ..Default::default()
    }
}

/// Desired Deployment for a rollout
///
/// `pull_secret` is the provisioned credential secret, if any. Replicas are
/// left unset; the autoscaler sizes the workload.
pub fn build_deployment(rollout: &Rollout, pull_secret: Option<String>) -> Result<Deployment> {
    let name = rollout.metadata.name.clone().unwrap_or_default();
    let spec = &rollout.spec;
    let labels = ownership_labels(rollout);

    let ports = non_empty(
        spec.interfaces
            .iter()
            .map(|intf| ContainerPort {
                name: Some(intf.name.clone()),
                container_port: intf.port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            })
            .collect(),
    );

    let (volumes, volume_mounts) = if spec.volumes.is_empty() {
        (None, None)
    } else {
        let volumes = spec
            .volumes
            .iter()
            .map(|v| Volume {
                name: claim_name(&name, &v.name),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim_name(&name, &v.name),
                    read_only: None,
                }),
                ..Default::default()
            })
            .collect();
        let mounts = spec
            .volumes
            .iter()
            .map(|v| VolumeMount {
                name: claim_name(&name, &v.name),
                mount_path: v.mount_path.clone(),
                ..Default::default()
            })
            .collect();
        (Some(volumes), Some(mounts))
    };

    let env_from = (!spec.secrets.is_empty()).then(|| {
        vec![EnvFromSource {
            secret_ref: Some(SecretEnvSource {
                name: env_secret_name(&name),
                optional: None,
            }),
            ..Default::default()
        }]
    });

    let security_declared = !spec.security_context.is_default();

    let container = Container {
        name: name.clone(),
        image: Some(spec.image.reference()),
        command: non_empty(spec.command.clone()),
        args: non_empty(spec.args.clone()),
        env: env_vars(&spec.env),
        env_from,
        resources: container_resources("spec.resources", &spec.resources)?,
        ports,
        volume_mounts,
        security_context: security_declared
            .then(|| container_security_context(&spec.security_context)),
        ..Default::default()
    };

    let annotations = BTreeMap::from([(
        SECRETS_CHECKSUM_ANNOTATION.to_string(),
        secrets_checksum(&spec.secrets),
    )]);

    let pod_spec = PodSpec {
        containers: vec![container],
        volumes,
        service_account_name: (!spec.service_account_name.is_empty())
            .then(|| spec.service_account_name.clone()),
        image_pull_secrets: pull_secret.map(|name| vec![LocalObjectReference { name }]),
        node_selector: (!spec.node_selector.is_empty()).then(|| spec.node_selector.clone()),
        tolerations: non_empty(spec.tolerations.clone()),
        host_aliases: non_empty(spec.host_aliases.clone()),
        security_context: if security_declared {
            pod_security_context(&spec.security_context)
        } else {
            None
        },
        ..Default::default()
    };

    Ok(Deployment {
        metadata: owned_metadata(rollout, workload_name(&name))?,
        spec: Some(DeploymentSpec {
            replicas: None,
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some(spec.strategy().deployment_type().to_string()),
                rolling_update: None,
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn pod_spec(d: &Deployment) -> Option<&PodSpec> {
    d.spec.as_ref()?.template.spec.as_ref()
}

fn first_container(d: &Deployment) -> Option<&Container> {
    pod_spec(d)?.containers.first()
}

fn strategy_type(d: &Deployment) -> &str {
    d.spec
        .as_ref()
        .and_then(|s| s.strategy.as_ref())
        .and_then(|s| s.type_.as_deref())
        .unwrap_or("RollingUpdate")
}

fn checksum(d: &Deployment) -> Option<&String> {
    d.spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(SECRETS_CHECKSUM_ANNOTATION)
}

fn pod_security_eq(a: Option<&PodSecurityContext>, b: Option<&PodSecurityContext>) -> bool {
    let empty = PodSecurityContext::default();
    a.unwrap_or(&empty) == b.unwrap_or(&empty)
}

fn port_list(c: &Container) -> Vec<(Option<&str>, i32)> {
    c.ports
        .iter()
        .flatten()
        .map(|p| (p.name.as_deref(), p.container_port))
        .collect()
}

fn volume_list(p: &PodSpec) -> Vec<(&str, Option<&str>)> {
    p.volumes
        .iter()
        .flatten()
        .map(|v| {
            (
                v.name.as_str(),
                v.persistent_volume_claim
                    .as_ref()
                    .map(|pvc| pvc.claim_name.as_str()),
            )
        })
        .collect()
}

fn mount_list(c: &Container) -> Vec<(&str, &str)> {
    c.volume_mounts
        .iter()
        .flatten()
        .map(|m| (m.name.as_str(), m.mount_path.as_str()))
        .collect()
}

impl OwnedFields for Deployment {
    const KIND: &'static str = "Deployment";

    fn drifted(live: &Self, desired: &Self) -> bool {
        let (Some(lp), Some(dp)) = (pod_spec(live), pod_spec(desired)) else {
            return true;
        };
        let (Some(lc), Some(dc)) = (first_container(live), first_container(desired)) else {
            return true;
        };

        let mismatches = [
            ("podSecurityContext", !pod_security_eq(lp.security_context.as_ref(), dp.security_context.as_ref())),
            ("securityContext", lc.security_context != dc.security_context),
            ("image", lc.image != dc.image),
            ("envFrom", !list_eq(lc.env_from.as_ref(), dc.env_from.as_ref())),
            ("env", !list_eq(lc.env.as_ref(), dc.env.as_ref())),
            ("resources", !resources_equal(lc.resources.as_ref(), dc.resources.as_ref())),
            ("ports", port_list(lc) != port_list(dc)),
            ("volumes", volume_list(lp) != volume_list(dp)),
            ("volumeMounts", mount_list(lc) != mount_list(dc)),
            ("serviceAccountName", !str_eq(lp.service_account_name.as_ref(), dp.service_account_name.as_ref())),
            ("command", dc.command.is_some() && lc.command != dc.command),
            ("args", dc.args.is_some() && lc.args != dc.args),
            ("strategy", strategy_type(live) != strategy_type(desired)),
            ("nodeSelector", !map_eq(lp.node_selector.as_ref(), dp.node_selector.as_ref())),
            ("tolerations", !list_eq(lp.tolerations.as_ref(), dp.tolerations.as_ref())),
            ("hostAliases", !list_eq(lp.host_aliases.as_ref(), dp.host_aliases.as_ref())),
            ("imagePullSecrets", !list_eq(lp.image_pull_secrets.as_ref(), dp.image_pull_secrets.as_ref())),
            ("secretsChecksum", checksum(live) != checksum(desired)),
        ];

        let drifted: Vec<&str> = mismatches
            .iter()
            .filter(|(_, differs)| *differs)
            .map(|(field, _)| *field)
            .collect();
        if !drifted.is_empty() {
            tracing::debug!(fields = ?drifted, "deployment drifted");
        }
        !drifted.is_empty()
    }

    fn overwrite(live: &mut Self, desired: &Self) {
        let Some(mut spec) = desired.spec.clone() else {
            return;
        };
        let live_spec = live.spec.as_ref();
        spec.replicas = live_spec.and_then(|s| s.replicas);

        // Empty command/args are not owned; keep whatever is running
        let live_container = live_spec
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.first());
        if let (Some(lc), Some(dc)) = (
            live_container,
            spec.template
                .spec
                .as_mut()
                .and_then(|p| p.containers.first_mut()),
        ) {
            if dc.command.is_none() {
                dc.command = lc.command.clone();
            }
            if dc.args.is_none() {
                dc.args = lc.args.clone();
            }
        }

        // Keep foreign template annotations (e.g. restartedAt) alongside ours
        let live_annotations = live_spec
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.annotations.clone())
            .unwrap_or_default();
        if let Some(meta) = spec.template.metadata.as_mut() {
            let mut merged = live_annotations;
            merged.extend(meta.annotations.take().unwrap_or_default());
            meta.annotations = Some(merged);
        }

        live.spec = Some(spec);
    }
}

/// Converge the rollout's Deployment
pub async fn reconcile(ctx: &PassContext<'_>) -> Result<Outcome> {
    let name = ctx.name();
    let pull_secret = ensure_pull_secret(ctx, &name, &ctx.rollout.spec.image).await?;
    let desired = build_deployment(ctx.rollout, pull_secret)?;
    ensure(ctx, desired).await
}
