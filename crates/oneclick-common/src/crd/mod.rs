//! Custom Resource Definitions for the one-click operator

mod rollout;

pub use rollout::{
    CapabilitiesSpec, DeploymentResources, DeploymentStatus, EnvVar, HorizontalScaleSpec,
    ImageSpec, IngressRule, IngressSpec, IngressStatus, InterfaceSpec, ResourceList,
    ResourceRequirements, Resources, Rollout, RolloutSpec, RolloutStatus, RolloutStrategy,
    ScheduledTaskSpec, SecretItem, SecurityContextSpec, ServiceStatus, VolumeSpec, VolumeStatus,
};
