//! Network-endpoint (Service) reconciler
//!
//! One ClusterIP Service per declared interface, forwarding the interface
//! port to the same container port.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use oneclick_common::crd::{InterfaceSpec, Rollout};
use oneclick_common::kube_utils::{owned_metadata, ownership_labels, service_name};
use oneclick_common::Result;

use crate::managed::{collect_garbage, ensure, OwnedFields, PassContext};

fn service_ports(intf: &InterfaceSpec) -> Vec<ServicePort> {
    vec![ServicePort {
        name: Some(intf.name.clone()),
        port: intf.port,
        target_port: Some(IntOrString::Int(intf.port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }]
}

/// Desired Service for one interface
pub fn build_service(rollout: &Rollout, intf: &InterfaceSpec) -> Result<Service> {
    let name = rollout.metadata.name.clone().unwrap_or_default();
    Ok(Service {
        metadata: owned_metadata(rollout, service_name(&name, &intf.name))?,
        spec: Some(ServiceSpec {
            selector: Some(ownership_labels(rollout)),
            ports: Some(service_ports(intf)),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn port_list(svc: &Service) -> Vec<(Option<&str>, i32, Option<&IntOrString>, &str)> {
    svc.spec
        .iter()
        .flat_map(|s| s.ports.iter().flatten())
        .map(|p| {
            (
                p.name.as_deref(),
                p.port,
                p.target_port.as_ref(),
                p.protocol.as_deref().unwrap_or("TCP"),
            )
        })
        .collect()
}

impl OwnedFields for Service {
    const KIND: &'static str = "Service";

    fn drifted(live: &Self, desired: &Self) -> bool {
        port_list(live) != port_list(desired)
    }

    fn overwrite(live: &mut Self, desired: &Self) {
        let ports = desired.spec.as_ref().and_then(|s| s.ports.clone());
        live.spec.get_or_insert_with(Default::default).ports = ports;
    }
}

/// Converge one Service per interface and remove the rest
pub async fn reconcile(ctx: &PassContext<'_>) -> Result<()> {
    let name = ctx.name();
    let mut expected = BTreeSet::new();
    for intf in &ctx.rollout.spec.interfaces {
        expected.insert(service_name(&name, &intf.name));
        ensure(ctx, build_service(ctx.rollout, intf)?).await?;
    }
    collect_garbage::<Service>(ctx, &expected).await?;
    Ok(())
}
