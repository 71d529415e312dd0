//! One-click operator - reconciles Rollout resources into workloads

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use oneclick_common::crd::Rollout;
use oneclick_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use oneclick_rollout::{error_policy, reconcile, RolloutConfig, RolloutContext};

/// One-click - Rollout operator
#[derive(Parser, Debug)]
#[command(name = "oneclick-operator", version, about, long_about = None)]
struct Cli {
    /// Print the Rollout CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Seconds between passes for a healthy rollout
    #[arg(long, env = "ONECLICK_REQUEUE_SECS", default_value_t = 300)]
    requeue_secs: u64,

    /// Seconds before retrying a pass that failed transiently
    #[arg(long, env = "ONECLICK_ERROR_REQUEUE_SECS", default_value_t = 30)]
    error_requeue_secs: u64,

    /// Attempts for a write that keeps hitting version conflicts
    #[arg(long, env = "ONECLICK_CONFLICT_ATTEMPTS", default_value_t = 5)]
    conflict_attempts: u32,

    /// Log encoding: json or text
    #[arg(long, env = "ONECLICK_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

impl Cli {
    fn rollout_config(&self) -> RolloutConfig {
        RolloutConfig {
            requeue_secs: self.requeue_secs,
            error_requeue_secs: self.error_requeue_secs,
            conflict_attempts: self.conflict_attempts.max(1),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Rollout::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
        default_filter: None,
    })?;

    run_controller(cli.rollout_config()).await
}

/// Watch Rollouts and the kinds they own until a shutdown signal arrives
async fn run_controller(config: RolloutConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    tracing::info!(
        requeue_secs = config.requeue_secs,
        error_requeue_secs = config.error_requeue_secs,
        conflict_attempts = config.conflict_attempts,
        "Starting Rollout controller"
    );

    let ctx = Arc::new(RolloutContext::from_client(client.clone(), config));
    let rollouts: Api<Rollout> = Api::all(client.clone());

    Controller::new(rollouts, WatcherConfig::default())
        .owns(Api::<Deployment>::all(client.clone()), WatcherConfig::default())
        .owns(
            Api::<HorizontalPodAutoscaler>::all(client.clone()),
            WatcherConfig::default(),
        )
        .owns(Api::<Service>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<Ingress>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<CronJob>::all(client.clone()), WatcherConfig::default())
        .owns(
            Api::<PersistentVolumeClaim>::all(client),
            WatcherConfig::default(),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Rollout reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Rollout reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Rollout controller shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_controller_defaults() {
        let cli = Cli::parse_from(["oneclick-operator"]);
        let config = cli.rollout_config();
        let defaults = RolloutConfig::default();
        assert_eq!(config.requeue_secs, defaults.requeue_secs);
        assert_eq!(config.error_requeue_secs, defaults.error_requeue_secs);
        assert_eq!(config.conflict_attempts, defaults.conflict_attempts);
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "oneclick-operator",
            "--requeue-secs",
            "60",
            "--conflict-attempts",
            "0",
            "--log-format",
            "text",
        ]);
        let config = cli.rollout_config();
        assert_eq!(config.requeue_secs, 60);
        assert_eq!(config.conflict_attempts, 1);
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn crd_manifest_names_the_rollout_kind() {
        let crd = serde_yaml::to_string(&Rollout::crd()).unwrap();
        assert!(crd.contains("rollouts.one-click.dev"));
        assert!(crd.contains("kind: Rollout"));
    }
}
