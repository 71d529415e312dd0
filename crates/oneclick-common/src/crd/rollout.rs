//! Rollout CRD types
//!
//! A `Rollout` declares one application's deployment topology: the container
//! image, scaling bounds, network interfaces, volumes, scheduled tasks and
//! registry credentials. The controller converges the cluster to it.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{HostAlias, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Image
// =============================================================================

/// Container image reference with optional registry credentials
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Registry host (e.g. "docker.io", "ghcr.io")
    pub registry: String,
    /// Repository path within the registry
    pub repository: String,
    /// Image tag
    pub tag: String,
    /// Registry username, only used together with `password`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// Registry password, only used together with `username`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

impl ImageSpec {
    /// Full image string in `registry/repository:tag` form
    pub fn reference(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }

    /// Whether both username and password are set
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

// =============================================================================
// Security
// =============================================================================

/// Linux capabilities to add or drop
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CapabilitiesSpec {
    /// Capabilities to add
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add: Vec<String>,
    /// Capabilities to drop
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drop: Vec<String>,
}

/// Pod and container security settings
///
/// When every field holds its default value no security context is set on
/// the workload at all.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContextSpec {
    /// Supplemental group applied to mounted volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_group: Option<i64>,
    /// UID the container process runs as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
    /// GID the container process runs as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_group: Option<i64>,
    /// Allow the process to gain more privileges than its parent
    #[serde(default)]
    pub allow_privilege_escalation: bool,
    /// Refuse to start the container as UID 0
    #[serde(default)]
    pub run_as_non_root: bool,
    /// Mount the root filesystem read-only
    #[serde(default)]
    pub read_only_root_filesystem: bool,
    /// Run the container privileged
    #[serde(default)]
    pub privileged: bool,
    /// Capability changes
    #[serde(default)]
    pub capabilities: CapabilitiesSpec,
}

impl SecurityContextSpec {
    /// True when nothing was declared
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

// =============================================================================
// Scaling and resources
// =============================================================================

/// Horizontal scaling bounds
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalScaleSpec {
    /// Lower replica bound
    pub min_replicas: i32,
    /// Upper replica bound
    pub max_replicas: i32,
    /// Average CPU utilization the autoscaler aims for
    #[serde(rename = "targetCPUUtilizationPercentage")]
    pub target_cpu_utilization_percentage: i32,
}

/// CPU and memory quantities
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ResourceList {
    /// CPU quantity (e.g. "500m")
    #[serde(default)]
    pub cpu: String,
    /// Memory quantity (e.g. "256Mi")
    #[serde(default)]
    pub memory: String,
}

/// Requests and limits for a container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ResourceRequirements {
    /// Guaranteed resources
    #[serde(default)]
    pub requests: ResourceList,
    /// Resource ceilings
    #[serde(default)]
    pub limits: ResourceList,
}

/// Plain environment variable
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EnvVar {
    /// Variable name
    pub name: String,
    /// Variable value
    #[serde(default)]
    pub value: String,
}

/// Secret entry, only hashed by the controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SecretItem {
    /// Secret key
    pub name: String,
    /// Secret value
    #[serde(default)]
    pub value: String,
}

// =============================================================================
// Storage
// =============================================================================

/// Persistent volume declaration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Volume name, combined with the rollout name for the claim name
    pub name: String,
    /// Path the volume is mounted at inside the container
    pub mount_path: String,
    /// Requested size (e.g. "10Gi")
    pub size: String,
    /// Storage class; the cluster default is used when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_class: String,
}

// =============================================================================
// Network
// =============================================================================

/// One host/path routing rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    /// Hostname to route
    pub host: String,
    /// Path prefix to route
    #[serde(default)]
    pub path: String,
    /// Terminate TLS for this host
    #[serde(default)]
    pub tls: bool,
    /// Explicit TLS secret; a conventional name is used when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tls_secret_name: String,
}

/// Ingress exposure for an interface
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// Ingress class name
    #[serde(default)]
    pub ingress_class: String,
    /// Annotations copied onto the route
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Routing rules
    #[serde(default)]
    pub rules: Vec<IngressRule>,
}

impl IngressSpec {
    /// An interface is routed when it names a class or has at least one rule
    pub fn is_empty(&self) -> bool {
        self.ingress_class.is_empty() && self.rules.is_empty()
    }
}

/// Network interface exposed by the workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct InterfaceSpec {
    /// Interface name
    pub name: String,
    /// Container and service port
    pub port: i32,
    /// Optional ingress exposure
    #[serde(default)]
    pub ingress: IngressSpec,
}

// =============================================================================
// Scheduled tasks
// =============================================================================

/// CronJob-style scheduled task
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTaskSpec {
    /// Task name, used verbatim as the CronJob name
    pub name: String,
    /// Pause scheduling
    #[serde(default)]
    pub suspend: bool,
    /// Task image
    pub image: ImageSpec,
    /// Cron schedule expression
    pub schedule: String,
    /// Entrypoint override
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Entrypoint arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Retries before a run is marked failed, used when `backoffLimit` is unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<i32>,
    /// Job backoff limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Resource requests and limits
    #[serde(default)]
    pub resources: ResourceRequirements,
}

impl ScheduledTaskSpec {
    /// Effective job backoff limit
    pub fn effective_backoff_limit(&self) -> Option<i32> {
        self.backoff_limit.or(self.max_retries)
    }
}

// =============================================================================
// Strategy
// =============================================================================

/// How pods are replaced when the workload template changes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RolloutStrategy {
    /// Replace pods gradually
    #[default]
    RollingUpdate,
    /// Terminate all pods before starting new ones
    Recreate,
}

impl RolloutStrategy {
    /// Kubernetes Deployment strategy type string
    pub fn deployment_type(&self) -> &'static str {
        match self {
            Self::RollingUpdate => "RollingUpdate",
            Self::Recreate => "Recreate",
        }
    }
}

impl std::fmt::Display for RolloutStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.deployment_type())
    }
}

// =============================================================================
// CRD
// =============================================================================

/// Desired deployment topology of one application
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "one-click.dev",
    version = "v1alpha1",
    kind = "Rollout",
    plural = "rollouts",
    namespaced,
    status = "RolloutStatus",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image.repository"}"#,
    printcolumn = r#"{"name":"ImageTag","type":"string","jsonPath":".spec.image.tag"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.horizontalScale.minReplicas"}"#,
    printcolumn = r#"{"name":"Deployment Status","type":"string","jsonPath":".status.deployment.status"}"#,
    printcolumn = r#"{"name":"Service Status","type":"string","jsonPath":".status.services[*].status"}"#,
    printcolumn = r#"{"name":"Ingress Status","type":"string","jsonPath":".status.ingresses[*].status"}"#,
    printcolumn = r#"{"name":"Volume Status","type":"string","jsonPath":".status.volumes[*].status"}"#,
    printcolumn = r#"{"name":"Service Account","type":"string","jsonPath":".spec.serviceAccountName"}"#,
    printcolumn = r#"{"name":"Rollout Strategy","type":"string","jsonPath":".spec.rolloutStrategy"}"#,
    printcolumn = r#"{"name":"Creation Timestamp","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RolloutSpec {
    /// Container entrypoint arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Container entrypoint override
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// "recreate" or "rollingUpdate"; anything else means rolling update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_strategy: Option<String>,
    /// Container image
    pub image: ImageSpec,
    /// Pod and container security settings
    #[serde(default)]
    pub security_context: SecurityContextSpec,
    /// Autoscaler bounds
    pub horizontal_scale: HorizontalScaleSpec,
    /// Container resources
    #[serde(default)]
    pub resources: ResourceRequirements,
    /// Plain environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Secret entries exposed through the `<rollout>-secrets` Secret
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretItem>,
    /// Persistent volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeSpec>,
    /// Network interfaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<InterfaceSpec>,
    /// Service account the pods run as
    #[serde(default)]
    pub service_account_name: String,
    /// Scheduled tasks
    #[serde(default, rename = "cronjobs", skip_serializing_if = "Vec::is_empty")]
    pub cron_jobs: Vec<ScheduledTaskSpec>,
    /// Node selector passed through to the pod template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    /// Tolerations passed through to the pod template
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    /// Host aliases passed through to the pod template
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_aliases: Vec<HostAlias>,
}

impl RolloutSpec {
    /// Parsed rollout strategy
    pub fn strategy(&self) -> RolloutStrategy {
        match self.rollout_strategy.as_deref() {
            Some("recreate") => RolloutStrategy::Recreate,
            _ => RolloutStrategy::RollingUpdate,
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Summed CPU and memory
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Resources {
    /// CPU in millicores (e.g. "1500m")
    pub cpu: String,
    /// Memory in bytes
    pub memory: String,
}

/// Request and limit sums across the workload's pods
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentResources {
    /// Sum of requests
    pub request_sum: Resources,
    /// Sum of limits
    pub limit_sum: Resources,
}

/// Observed workload state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    /// Current replica count
    pub replicas: i32,
    /// Pods belonging to the workload
    #[serde(default)]
    pub pod_names: Vec<String>,
    /// Aggregated pod resources
    #[serde(default)]
    pub resources: DeploymentResources,
    /// Running, Scaling or Pending
    #[serde(default)]
    pub status: String,
}

/// Observed network endpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ServiceStatus {
    /// Endpoint name
    pub name: String,
    /// Exposed ports
    #[serde(default)]
    pub ports: Vec<i32>,
    /// Endpoint status
    #[serde(default)]
    pub status: String,
}

/// Observed ingress route
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct IngressStatus {
    /// Route name
    pub name: String,
    /// Routed hosts
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Ready once a load balancer address is assigned
    #[serde(default)]
    pub status: String,
}

/// Observed storage claim
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct VolumeStatus {
    /// Claim name
    pub name: String,
    /// Claim phase
    #[serde(default)]
    pub status: String,
}

/// Observed state of a Rollout
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct RolloutStatus {
    /// Workload summary
    #[serde(default)]
    pub deployment: DeploymentStatus,
    /// Network endpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceStatus>,
    /// Ingress routes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingresses: Vec<IngressStatus>,
    /// Storage claims
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> RolloutSpec {
        serde_yaml::from_str(yaml).expect("spec should parse")
    }

    #[test]
    fn parses_wire_field_names() {
        let spec = parse(
            r#"
image:
  registry: docker.io
  repository: library/nginx
  tag: "1.27"
horizontalScale:
  minReplicas: 1
  maxReplicas: 3
  targetCPUUtilizationPercentage: 80
serviceAccountName: web
rolloutStrategy: recreate
cronjobs:
  - name: nightly
    schedule: "0 3 * * *"
    image:
      registry: docker.io
      repository: library/busybox
      tag: latest
    maxRetries: 2
interfaces:
  - name: http
    port: 8080
    ingress:
      ingressClass: nginx
      rules:
        - host: app.example.com
          path: /
          tls: true
          tlsSecretName: app-tls
"#,
        );

        assert_eq!(spec.horizontal_scale.target_cpu_utilization_percentage, 80);
        assert_eq!(spec.cron_jobs.len(), 1);
        assert_eq!(spec.cron_jobs[0].effective_backoff_limit(), Some(2));
        assert_eq!(spec.interfaces[0].ingress.rules[0].tls_secret_name, "app-tls");
        assert_eq!(spec.strategy(), RolloutStrategy::Recreate);
    }

    #[test]
    fn unknown_strategy_falls_back_to_rolling_update() {
        let mut spec = RolloutSpec::default();
        assert_eq!(spec.strategy(), RolloutStrategy::RollingUpdate);

        spec.rollout_strategy = Some("rollingUpdate".to_string());
        assert_eq!(spec.strategy(), RolloutStrategy::RollingUpdate);

        spec.rollout_strategy = Some("blue-green".to_string());
        assert_eq!(spec.strategy().deployment_type(), "RollingUpdate");
    }

    #[test]
    fn image_reference_and_credentials() {
        let mut image = ImageSpec {
            registry: "ghcr.io".to_string(),
            repository: "acme/api".to_string(),
            tag: "v2".to_string(),
            ..Default::default()
        };
        assert_eq!(image.reference(), "ghcr.io/acme/api:v2");
        assert!(!image.has_credentials());

        image.username = "bot".to_string();
        assert!(!image.has_credentials());
        image.password = "hunter2".to_string();
        assert!(image.has_credentials());
    }

    #[test]
    fn empty_ingress_and_default_security_context() {
        assert!(IngressSpec::default().is_empty());
        let ingress = IngressSpec {
            ingress_class: "nginx".to_string(),
            ..Default::default()
        };
        assert!(!ingress.is_empty());

        assert!(SecurityContextSpec::default().is_default());
        let sc = SecurityContextSpec {
            run_as_non_root: true,
            ..Default::default()
        };
        assert!(!sc.is_default());
    }

    #[test]
    fn backoff_limit_takes_precedence_over_max_retries() {
        let task = ScheduledTaskSpec {
            max_retries: Some(2),
            backoff_limit: Some(5),
            ..Default::default()
        };
        assert_eq!(task.effective_backoff_limit(), Some(5));
        assert_eq!(ScheduledTaskSpec::default().effective_backoff_limit(), None);
    }

    #[test]
    fn kubectl_columns_show_every_status_list() {
        use kube::CustomResourceExt;

        let crd = Rollout::crd();
        let columns = crd.spec.versions[0]
            .additional_printer_columns
            .clone()
            .unwrap_or_default();
        let paths: Vec<&str> = columns.iter().map(|c| c.json_path.as_str()).collect();
        for path in [
            ".status.deployment.status",
            ".status.services[*].status",
            ".status.ingresses[*].status",
            ".status.volumes[*].status",
            ".metadata.creationTimestamp",
        ] {
            assert!(paths.contains(&path), "missing column for {path}");
        }
    }
}
