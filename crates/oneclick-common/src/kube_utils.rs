//! Ownership labels, naming conventions and metadata helpers
//!
//! Every object the controller manages carries a controller owner reference
//! back to its Rollout plus two ownership labels. Listing and garbage
//! collection go through the labels; the owner reference lets the API
//! server cascade deletion when the Rollout goes away.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::crd::Rollout;
use crate::{Error, Result, DEPLOYMENT_ID_LABEL, PROJECT_ID_LABEL};

// =============================================================================
// Naming
// =============================================================================

/// Workload (Deployment) and autoscaler name
pub fn workload_name(rollout: &str) -> String {
    rollout.to_string()
}

/// Network endpoint (Service) name for an interface
pub fn service_name(rollout: &str, interface: &str) -> String {
    format!("{rollout}-{interface}-svc")
}

/// Ingress route name for an interface
pub fn ingress_name(rollout: &str, interface: &str) -> String {
    format!("{interface}-{rollout}-ingress")
}

/// Default TLS secret name for an interface's routes
pub fn default_tls_secret_name(rollout: &str, interface: &str) -> String {
    format!("{interface}-{rollout}-tls-secret")
}

/// Storage claim name for a volume
pub fn claim_name(rollout: &str, volume: &str) -> String {
    format!("{volume}-{rollout}")
}

/// Pull-credential secret name for a workload or scheduled task
pub fn pull_secret_name(owner: &str) -> String {
    format!("{owner}-imagepullsecret")
}

/// Bulk environment secret consumed by the workload (not managed here)
pub fn env_secret_name(rollout: &str) -> String {
    format!("{rollout}-secrets")
}

// =============================================================================
// Ownership
// =============================================================================

/// Namespace of a rollout, empty when unset
pub fn rollout_namespace(rollout: &Rollout) -> String {
    rollout.namespace().unwrap_or_default()
}

/// The two ownership labels for a rollout
pub fn ownership_labels(rollout: &Rollout) -> BTreeMap<String, String> {
    BTreeMap::from([
        (PROJECT_ID_LABEL.to_string(), rollout_namespace(rollout)),
        (DEPLOYMENT_ID_LABEL.to_string(), rollout.name_any()),
    ])
}

/// Label selector matching objects owned by a rollout
pub fn ownership_selector(rollout: &Rollout) -> String {
    format!(
        "{}={},{}={}",
        PROJECT_ID_LABEL,
        rollout_namespace(rollout),
        DEPLOYMENT_ID_LABEL,
        rollout.name_any()
    )
}

/// Whether `meta` carries both of `rollout`'s ownership labels
pub fn carries_ownership_labels(meta: &ObjectMeta, rollout: &Rollout) -> bool {
    let Some(labels) = meta.labels.as_ref() else {
        return false;
    };
    ownership_labels(rollout)
        .iter()
        .all(|(k, v)| labels.get(k) == Some(v))
}

/// Metadata for a new managed object: name, namespace, ownership labels and
/// a controller owner reference to the rollout
///
/// Fails when the rollout has no uid yet, since an owner reference without
/// one is rejected by the API server.
pub fn owned_metadata(rollout: &Rollout, name: impl Into<String>) -> Result<ObjectMeta> {
    let owner = rollout.controller_owner_ref(&()).ok_or_else(|| {
        Error::validation_for(rollout.name_any(), "rollout has no uid; cannot own objects")
    })?;
    Ok(ObjectMeta {
        name: Some(name.into()),
        namespace: rollout.namespace(),
        labels: Some(ownership_labels(rollout)),
        owner_references: Some(vec![owner]),
        ..Default::default()
    })
}

/// Object reference for publishing events on a rollout
pub fn rollout_reference(rollout: &Rollout) -> ObjectReference {
    rollout.object_ref(&())
}
