//! Per-kind reconcilers
//!
//! Each module pairs a pure builder (spec fragment to desired object) with an
//! [`OwnedFields`](crate::managed::OwnedFields) impl and a `reconcile` entry
//! point that runs the shared ensure and garbage-collection steps.

pub mod autoscaler;
pub mod cronjob;
pub mod ingress;
pub mod network;
pub mod storage;
pub mod workload;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use oneclick_common::crd::{EnvVar, ResourceList, ResourceRequirements};
use oneclick_common::quantity::{quantities_equal, ParsedQuantity};
use oneclick_common::Result;

/// Container environment from declared variables
pub(crate) fn env_vars(env: &[EnvVar]) -> Option<Vec<corev1::EnvVar>> {
    non_empty(
        env.iter()
            .map(|e| corev1::EnvVar {
                name: e.name.clone(),
                value: (!e.value.is_empty()).then(|| e.value.clone()),
                value_from: None,
            })
            .collect(),
    )
}

fn quantity_map(field: &str, list: &ResourceList) -> Result<Option<BTreeMap<String, Quantity>>> {
    let mut map = BTreeMap::new();
    for (name, raw) in [("cpu", &list.cpu), ("memory", &list.memory)] {
        if ParsedQuantity::parse_declared(&format!("{field}.{name}"), raw)?.is_some() {
            map.insert(name.to_string(), Quantity(raw.clone()));
        }
    }
    Ok((!map.is_empty()).then_some(map))
}

/// Container resources from declared quantities
///
/// Empty strings are omitted; anything else must parse.
pub(crate) fn container_resources(
    field: &str,
    declared: &ResourceRequirements,
) -> Result<Option<corev1::ResourceRequirements>> {
    let requests = quantity_map(&format!("{field}.requests"), &declared.requests)?;
    let limits = quantity_map(&format!("{field}.limits"), &declared.limits)?;
    if requests.is_none() && limits.is_none() {
        return Ok(None);
    }
    Ok(Some(corev1::ResourceRequirements {
        requests,
        limits,
        ..Default::default()
    }))
}

fn quantity_maps_equal(
    a: Option<&BTreeMap<String, Quantity>>,
    b: Option<&BTreeMap<String, Quantity>>,
) -> bool {
    let empty = BTreeMap::new();
    let (a, b) = (a.unwrap_or(&empty), b.unwrap_or(&empty));
    a.len() == b.len()
        && a.iter()
            .all(|(k, qa)| b.get(k).is_some_and(|qb| quantities_equal(qa, qb)))
}

/// Numeric comparison of requests and limits; unset equals empty
pub(crate) fn resources_equal(
    a: Option<&corev1::ResourceRequirements>,
    b: Option<&corev1::ResourceRequirements>,
) -> bool {
    quantity_maps_equal(
        a.and_then(|r| r.requests.as_ref()),
        b.and_then(|r| r.requests.as_ref()),
    ) && quantity_maps_equal(
        a.and_then(|r| r.limits.as_ref()),
        b.and_then(|r| r.limits.as_ref()),
    )
}

/// `None` for an empty vector
pub(crate) fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

/// Compare optional lists treating unset as empty
pub(crate) fn list_eq<T: PartialEq>(a: Option<&Vec<T>>, b: Option<&Vec<T>>) -> bool {
    a.map(Vec::as_slice).unwrap_or_default() == b.map(Vec::as_slice).unwrap_or_default()
}

/// Compare optional maps treating unset as empty
pub(crate) fn map_eq(
    a: Option<&BTreeMap<String, String>>,
    b: Option<&BTreeMap<String, String>>,
) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        (Some(m), None) | (None, Some(m)) => m.is_empty(),
        (None, None) => true,
    }
}

/// Compare optional strings treating unset as empty
pub(crate) fn str_eq(a: Option<&String>, b: Option<&String>) -> bool {
    a.map(String::as_str).unwrap_or_default() == b.map(String::as_str).unwrap_or_default()
}
