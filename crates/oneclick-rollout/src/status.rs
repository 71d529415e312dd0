//! Rollout status summary
//!
//! Runs after every reconciler succeeded. Reads back what the cluster
//! reports for the managed objects and writes the summary onto the Rollout's
//! status subresource, but only when it changed.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, info};

use oneclick_common::crd::{
    DeploymentResources, DeploymentStatus, IngressStatus, Resources, Rollout, RolloutStatus,
    ServiceStatus, VolumeStatus,
};
use oneclick_common::kube_utils::workload_name;
use oneclick_common::quantity::ParsedQuantity;
use oneclick_common::Result;

use crate::managed::PassContext;

const RUNNING: &str = "Running";
const SCALING: &str = "Scaling";
const PENDING: &str = "Pending";
const AVAILABLE: &str = "Available";
const READY: &str = "Ready";

/// Running sums of CPU and memory across containers
#[derive(Default)]
struct ResourceSum {
    cpu: ParsedQuantity,
    memory: ParsedQuantity,
}

impl ResourceSum {
    fn add(&mut self, list: Option<&std::collections::BTreeMap<String, Quantity>>) {
        let Some(list) = list else {
            return;
        };
        if let Some(q) = list.get("cpu") {
            match ParsedQuantity::from_quantity("cpu", q) {
                Ok(v) => self.cpu = self.cpu + v,
                Err(e) => debug!(error = %e, "ignoring unparsable pod cpu"),
            }
        }
        if let Some(q) = list.get("memory") {
            match ParsedQuantity::from_quantity("memory", q) {
                Ok(v) => self.memory = self.memory + v,
                Err(e) => debug!(error = %e, "ignoring unparsable pod memory"),
            }
        }
    }

    fn render(&self) -> Resources {
        Resources {
            cpu: format!("{}m", self.cpu.millis_ceil()),
            memory: self.memory.units_ceil().to_string(),
        }
    }
}

/// Workload phase from desired and ready replica counts
pub fn workload_phase(desired: i32, ready: i32) -> &'static str {
    if ready > 0 && ready >= desired {
        RUNNING
    } else if ready > 0 {
        SCALING
    } else {
        PENDING
    }
}

fn deployment_status(deployment: Option<&Deployment>, pods: &[Pod]) -> DeploymentStatus {
    let observed = deployment.and_then(|d| d.status.as_ref());
    let replicas = observed.and_then(|s| s.replicas).unwrap_or(0);
    let ready = observed.and_then(|s| s.ready_replicas).unwrap_or(0);
    let desired = deployment
        .and_then(|d| d.spec.as_ref())
        .and_then(|s| s.replicas)
        .unwrap_or(1);

    let mut pod_names: Vec<String> = pods.iter().map(|p| p.name_any()).collect();
    pod_names.sort();

    let (mut requests, mut limits) = (ResourceSum::default(), ResourceSum::default());
    for container in pods
        .iter()
        .filter_map(|p| p.spec.as_ref())
        .flat_map(|s| s.containers.iter())
    {
        let resources = container.resources.as_ref();
        requests.add(resources.and_then(|r| r.requests.as_ref()));
        limits.add(resources.and_then(|r| r.limits.as_ref()));
    }

    DeploymentStatus {
        replicas,
        pod_names,
        resources: DeploymentResources {
            request_sum: requests.render(),
            limit_sum: limits.render(),
        },
        status: workload_phase(desired, ready).to_string(),
    }
}

fn service_status(svc: &Service) -> ServiceStatus {
    ServiceStatus {
        name: svc.name_any(),
        ports: svc
            .spec
            .iter()
            .flat_map(|s| s.ports.iter().flatten())
            .map(|p| p.port)
            .collect(),
        status: AVAILABLE.to_string(),
    }
}

fn ingress_status(route: &Ingress) -> IngressStatus {
    let assigned = route
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .is_some_and(|ingress| !ingress.is_empty());
    IngressStatus {
        name: route.name_any(),
        hosts: route
            .spec
            .iter()
            .flat_map(|s| s.rules.iter().flatten())
            .filter_map(|r| r.host.clone())
            .collect(),
        status: if assigned { READY } else { PENDING }.to_string(),
    }
}

fn volume_status(claim: &PersistentVolumeClaim) -> VolumeStatus {
    VolumeStatus {
        name: claim.name_any(),
        status: claim
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| PENDING.to_string()),
    }
}

fn by_name<K: ResourceExt>(mut items: Vec<K>) -> Vec<K> {
    items.sort_by_key(|k| k.name_any());
    items
}

/// Summarise the observed state of everything the rollout owns
pub async fn observe(ctx: &PassContext<'_>) -> Result<RolloutStatus> {
    let (namespace, selector) = (ctx.namespace(), ctx.selector());
    let store = ctx.store;

    let deployment: Option<Deployment> = store.get(&ctx.key(workload_name(&ctx.name()))).await?;
    let pods: Vec<Pod> = store.list(&namespace, &selector).await?;
    let services: Vec<Service> = store.list(&namespace, &selector).await?;
    let routes: Vec<Ingress> = store.list(&namespace, &selector).await?;
    let claims: Vec<PersistentVolumeClaim> = store.list(&namespace, &selector).await?;

    Ok(RolloutStatus {
        deployment: deployment_status(deployment.as_ref(), &pods),
        services: by_name(services).iter().map(service_status).collect(),
        ingresses: by_name(routes).iter().map(ingress_status).collect(),
        volumes: by_name(claims).iter().map(volume_status).collect(),
    })
}

/// Status patch that also clears lists which became empty
fn status_patch(status: &RolloutStatus) -> Result<Value> {
    let mut value = serde_json::to_value(status)?;
    if let Some(fields) = value.as_object_mut() {
        for list in ["services", "ingresses", "volumes"] {
            fields
                .entry(list)
                .or_insert_with(|| Value::Array(Vec::new()));
        }
    }
    Ok(value)
}

/// Write the observed status when it differs from the recorded one
///
/// Returns whether a write happened.
pub async fn reconcile(ctx: &PassContext<'_>) -> Result<bool> {
    let observed = observe(ctx).await?;
    let current = ctx.rollout.status.clone().unwrap_or_default();
    if observed == current {
        debug!("status unchanged");
        return Ok(false);
    }

    let key = ctx.key(ctx.name());
    ctx.store
        .patch_status::<Rollout, _>(&key, &status_patch(&observed)?)
        .await?;
    info!(
        replicas = observed.deployment.replicas,
        phase = %observed.deployment.status,
        "updated rollout status"
    );
    Ok(true)
}
