//! Rollout controller: one reconciliation pass per Rollout
//!
//! A pass runs the per-kind reconcilers strictly in sequence and stops at
//! the first error. Nothing already written is rolled back; the next pass
//! picks up where this one stopped.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use oneclick_common::crd::Rollout;
use oneclick_common::events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
use oneclick_common::retry::ConflictRetry;
use oneclick_common::{Error, Result, CONTROLLER_NAME};

use crate::credentials;
use crate::managed::PassContext;
use crate::reconcilers::{autoscaler, cronjob, ingress, network, storage, workload};
use crate::status;
use crate::store::{ClusterStore, KubeStore, Store};

/// Requeue and retry tuning
#[derive(Clone, Debug)]
pub struct RolloutConfig {
    /// Requeue interval after a successful pass
    pub requeue_secs: u64,
    /// Requeue interval after a retryable failure
    pub error_requeue_secs: u64,
    /// Attempts for a write that keeps hitting version conflicts
    pub conflict_attempts: u32,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            requeue_secs: 300,
            error_requeue_secs: 30,
            conflict_attempts: 5,
        }
    }
}

/// Shared controller context
pub struct RolloutContext {
    /// Backing store
    pub store: Store,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Tuning
    pub config: RolloutConfig,
}

impl RolloutContext {
    /// Create a context from its parts
    pub fn new(
        store: Arc<dyn ClusterStore>,
        events: Arc<dyn EventPublisher>,
        config: RolloutConfig,
    ) -> Self {
        Self {
            store: Store::new(store),
            events,
            config,
        }
    }

    /// Create a context talking to the API server
    pub fn from_client(client: Client, config: RolloutConfig) -> Self {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
        Self::new(Arc::new(KubeStore::new(client)), events, config)
    }

    /// Context over an arbitrary store with events discarded
    #[cfg(test)]
    pub fn for_testing(store: Arc<dyn ClusterStore>) -> Self {
        Self::new(store, Arc::new(NoopEventPublisher), RolloutConfig::default())
    }

    fn conflict_retry(&self) -> ConflictRetry {
        ConflictRetry::with_max_attempts(self.config.conflict_attempts)
    }
}

/// Run every reconciler once for `rollout`, then publish its status
pub async fn run_pass(rollout: &Rollout, ctx: &RolloutContext) -> Result<()> {
    let retry = ctx.conflict_retry();
    let pass = PassContext {
        rollout,
        store: &ctx.store,
        events: ctx.events.as_ref(),
        retry: &retry,
    };

    let outcome = workload::reconcile(&pass).await?;
    debug!(?outcome, "workload reconciled");
    let outcome = autoscaler::reconcile(&pass).await?;
    debug!(?outcome, "autoscaler reconciled");
    network::reconcile(&pass).await?;
    ingress::reconcile(&pass).await?;
    cronjob::reconcile(&pass).await?;
    credentials::collect_pull_secrets(&pass).await?;
    storage::reconcile(&pass).await?;
    status::reconcile(&pass).await?;
    Ok(())
}

/// Reconcile a Rollout
#[instrument(
    skip(rollout, ctx),
    fields(rollout = %rollout.name_any(), namespace = %rollout.namespace().unwrap_or_default())
)]
pub async fn reconcile(rollout: Arc<Rollout>, ctx: Arc<RolloutContext>) -> Result<Action> {
    info!("reconciling rollout");
    run_pass(&rollout, &ctx).await?;
    info!("rollout reconciled");
    Ok(Action::requeue(Duration::from_secs(ctx.config.requeue_secs)))
}

/// Reconcile until done or until `cancel` fires
pub async fn reconcile_until_cancelled(
    rollout: Arc<Rollout>,
    ctx: Arc<RolloutContext>,
    cancel: CancellationToken,
) -> Result<Action> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = reconcile(rollout, ctx) => result,
    }
}

/// Error policy for the controller
///
/// - Retryable errors: requeue after the configured delay
/// - Everything else needs a spec change: wait for it
pub fn error_policy(rollout: Arc<Rollout>, error: &Error, ctx: Arc<RolloutContext>) -> Action {
    error!(
        ?error,
        rollout = %rollout.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(ctx.config.error_requeue_secs))
    } else {
        Action::await_change()
    }
}
