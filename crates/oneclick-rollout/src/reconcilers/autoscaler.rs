//! Autoscaler (HorizontalPodAutoscaler) reconciler
//!
//! Scales the rollout's Deployment on CPU utilization. The scaling behavior
//! is fixed; only the replica bounds and the target come from the rollout, and
//! only those are compared.

use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HPAScalingPolicy, HPAScalingRules, HorizontalPodAutoscaler,
    HorizontalPodAutoscalerBehavior, HorizontalPodAutoscalerSpec, MetricSpec, MetricTarget,
    ResourceMetricSource,
};

use oneclick_common::crd::Rollout;
use oneclick_common::kube_utils::{owned_metadata, workload_name};
use oneclick_common::Result;

use crate::managed::{ensure, OwnedFields, Outcome, PassContext};

const SCALE_UP_PERIOD_SECONDS: i32 = 15;
const SCALE_UP_STABILIZATION_SECONDS: i32 = 0;
const SCALE_DOWN_PERIOD_SECONDS: i32 = 60;
const SCALE_DOWN_STABILIZATION_SECONDS: i32 = 300;

fn percent_rule(period_seconds: i32, stabilization_seconds: i32) -> HPAScalingRules {
    HPAScalingRules {
        stabilization_window_seconds: Some(stabilization_seconds),
        policies: Some(vec![HPAScalingPolicy {
            type_: "Percent".to_string(),
            value: 100,
            period_seconds,
        }]),
        ..Default::default()
    }
}

fn cpu_metric(target_percent: i32) -> MetricSpec {
    MetricSpec {
        type_: "Resource".to_string(),
        resource: Some(ResourceMetricSource {
            name: "cpu".to_string(),
            target: MetricTarget {
                type_: "Utilization".to_string(),
                average_utilization: Some(target_percent),
                ..Default::default()
            },
        }),
        ..Default::default()
    }
}

/// Desired autoscaler for a rollout
pub fn build_autoscaler(rollout: &Rollout) -> Result<HorizontalPodAutoscaler> {
    let name = rollout.metadata.name.clone().unwrap_or_default();
    let scale = &rollout.spec.horizontal_scale;
    Ok(HorizontalPodAutoscaler {
        metadata: owned_metadata(rollout, workload_name(&name))?,
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: workload_name(&name),
            },
            min_replicas: Some(scale.min_replicas),
            max_replicas: scale.max_replicas,
            metrics: Some(vec![cpu_metric(scale.target_cpu_utilization_percentage)]),
            behavior: Some(HorizontalPodAutoscalerBehavior {
                scale_up: Some(percent_rule(
                    SCALE_UP_PERIOD_SECONDS,
                    SCALE_UP_STABILIZATION_SECONDS,
                )),
                scale_down: Some(percent_rule(
                    SCALE_DOWN_PERIOD_SECONDS,
                    SCALE_DOWN_STABILIZATION_SECONDS,
                )),
            }),
        }),
        ..Default::default()
    })
}

/// (min, max, CPU target) as carried by an autoscaler
fn owned_bounds(hpa: &HorizontalPodAutoscaler) -> (Option<i32>, Option<i32>, Option<i32>) {
    let Some(spec) = hpa.spec.as_ref() else {
        return (None, None, None);
    };
    let target = spec
        .metrics
        .iter()
        .flatten()
        .filter_map(|m| m.resource.as_ref())
        .find(|r| r.name == "cpu")
        .and_then(|r| r.target.average_utilization);
    (spec.min_replicas, Some(spec.max_replicas), target)
}

impl OwnedFields for HorizontalPodAutoscaler {
    const KIND: &'static str = "HorizontalPodAutoscaler";

    fn drifted(live: &Self, desired: &Self) -> bool {
        owned_bounds(live) != owned_bounds(desired)
    }

    fn overwrite(live: &mut Self, desired: &Self) {
        let Some(want) = desired.spec.as_ref() else {
            return;
        };
        let spec = live.spec.get_or_insert_with(|| want.clone());
        spec.min_replicas = want.min_replicas;
        spec.max_replicas = want.max_replicas;
        spec.metrics = want.metrics.clone();
    }
}

/// Converge the rollout's autoscaler
pub async fn reconcile(ctx: &PassContext<'_>) -> Result<Outcome> {
    ensure(ctx, build_autoscaler(ctx.rollout)?).await
}
