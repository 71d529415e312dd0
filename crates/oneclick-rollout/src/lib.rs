//! Rollout reconciliation engine
//!
//! Converges the Deployments, autoscalers, Services, Ingresses, CronJobs,
//! PersistentVolumeClaims and pull secrets a `Rollout` declares, then
//! summarises what the cluster reports back into the Rollout's status.

#![warn(missing_docs)]

pub mod controller;
pub mod credentials;
pub mod managed;
pub mod reconcilers;
pub mod status;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{
    error_policy, reconcile, reconcile_until_cancelled, run_pass, RolloutConfig, RolloutContext,
};
pub use managed::{Outcome, OwnedFields, PassContext};
pub use store::{ClusterStore, KubeStore, ObjectKey, Store};
