//! Ingress-route reconciler
//!
//! Interfaces that name an ingress class or declare at least one rule get a
//! route pointing at their Service. Routes for interfaces whose ingress
//! config became empty are removed by name, and any other label-owned route
//! the rollout no longer names is collected.

use std::collections::BTreeSet;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule as RouteRule,
    IngressServiceBackend, IngressSpec as RouteSpec, IngressTLS, ServiceBackendPort,
};

use oneclick_common::crd::{IngressRule, InterfaceSpec, Rollout};
use oneclick_common::kube_utils::{
    default_tls_secret_name, ingress_name, owned_metadata, service_name,
};
use oneclick_common::Result;

use crate::managed::{collect_garbage, delete_owned, ensure, OwnedFields, PassContext};
use crate::reconcilers::{list_eq, map_eq, non_empty};

const PATH_TYPE: &str = "ImplementationSpecific";

fn route_rule(rollout: &str, intf: &InterfaceSpec, rule: &IngressRule) -> RouteRule {
    let path = if rule.path.is_empty() { "/" } else { &rule.path };
    RouteRule {
        host: Some(rule.host.clone()),
        http: Some(HTTPIngressRuleValue {
            paths: vec![HTTPIngressPath {
                path: Some(path.to_string()),
                path_type: PATH_TYPE.to_string(),
                backend: IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: service_name(rollout, &intf.name),
                        port: Some(ServiceBackendPort {
                            number: Some(intf.port),
                            name: None,
                        }),
                    }),
                    resource: None,
                },
            }],
        }),
    }
}

fn tls_entry(rollout: &str, intf: &InterfaceSpec, rule: &IngressRule) -> IngressTLS {
    let secret = if rule.tls_secret_name.is_empty() {
        default_tls_secret_name(rollout, &intf.name)
    } else {
        rule.tls_secret_name.clone()
    };
    IngressTLS {
        hosts: Some(vec![rule.host.clone()]),
        secret_name: Some(secret),
    }
}

/// Desired route for one interface
pub fn build_ingress(rollout: &Rollout, intf: &InterfaceSpec) -> Result<Ingress> {
    let name = rollout.metadata.name.clone().unwrap_or_default();
    let config = &intf.ingress;

    let mut metadata = owned_metadata(rollout, ingress_name(&name, &intf.name))?;
    metadata.annotations = (!config.annotations.is_empty()).then(|| config.annotations.clone());

    let rules = config
        .rules
        .iter()
        .map(|rule| route_rule(&name, intf, rule))
        .collect();
    let tls = config
        .rules
        .iter()
        .filter(|rule| rule.tls)
        .map(|rule| tls_entry(&name, intf, rule))
        .collect();

    Ok(Ingress {
        metadata,
        spec: Some(RouteSpec {
            ingress_class_name: (!config.ingress_class.is_empty())
                .then(|| config.ingress_class.clone()),
            rules: non_empty(rules),
            tls: non_empty(tls),
            default_backend: None,
        }),
        ..Default::default()
    })
}

impl OwnedFields for Ingress {
    const KIND: &'static str = "Ingress";

    fn drifted(live: &Self, desired: &Self) -> bool {
        let (l, d) = (live.spec.as_ref(), desired.spec.as_ref());
        l.and_then(|s| s.ingress_class_name.as_ref()) != d.and_then(|s| s.ingress_class_name.as_ref())
            || !list_eq(l.and_then(|s| s.rules.as_ref()), d.and_then(|s| s.rules.as_ref()))
            || !list_eq(l.and_then(|s| s.tls.as_ref()), d.and_then(|s| s.tls.as_ref()))
            || !map_eq(
                live.metadata.annotations.as_ref(),
                desired.metadata.annotations.as_ref(),
            )
    }

    fn overwrite(live: &mut Self, desired: &Self) {
        let want = desired.spec.clone().unwrap_or_default();
        let spec = live.spec.get_or_insert_with(Default::default);
        spec.ingress_class_name = want.ingress_class_name;
        spec.rules = want.rules;
        spec.tls = want.tls;
        live.metadata.annotations = desired.metadata.annotations.clone();
    }
}

/// Converge one route per routed interface and remove the rest
pub async fn reconcile(ctx: &PassContext<'_>) -> Result<()> {
    let name = ctx.name();
    let mut expected = BTreeSet::new();
    for intf in &ctx.rollout.spec.interfaces {
        let route = ingress_name(&name, &intf.name);
        if intf.ingress.is_empty() {
            delete_owned::<Ingress>(ctx, &route).await?;
            continue;
        }
        expected.insert(route);
        ensure(ctx, build_ingress(ctx.rollout, intf)?).await?;
    }
    collect_garbage::<Ingress>(ctx, &expected).await?;
    Ok(())
}
