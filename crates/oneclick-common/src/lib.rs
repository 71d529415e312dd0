//! Common types for the one-click operator: the Rollout CRD, errors and utilities

#![warn(missing_docs)]

pub mod checksum;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod quantity;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label key carrying the owning rollout's namespace on every managed object
pub const PROJECT_ID_LABEL: &str = "one-click.dev/projectId";

/// Label key carrying the owning rollout's name on every managed object
pub const DEPLOYMENT_ID_LABEL: &str = "one-click.dev/deploymentId";

/// Pod-template annotation holding the digest of the rollout's secret entries
pub const SECRETS_CHECKSUM_ANNOTATION: &str = "one-click.dev/secrets-checksum";

/// Field manager / reporting component name
pub const CONTROLLER_NAME: &str = "oneclick-rollout-controller";
