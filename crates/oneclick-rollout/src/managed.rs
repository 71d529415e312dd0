//! Desired-state reconciliation shared by every managed kind
//!
//! Each kind supplies a builder (in its own module) plus an [`OwnedFields`]
//! impl saying which fields the controller owns. [`ensure`] then fetches the
//! live object by name, creates it when absent, and overwrites the owned
//! fields under a compare-and-swap retry loop when they drifted.
//! [`collect_garbage`] removes label-owned objects the rollout no longer names.
//!
//! An object already sitting at a conventional name without the rollout's
//! labels is never adopted. It is reported with a warning event and skipped,
//! and the rest of the pass carries on.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use oneclick_common::crd::Rollout;
use oneclick_common::events::{actions, reasons, EventPublisher, RolloutEvent};
use oneclick_common::kube_utils::{
    carries_ownership_labels, ownership_selector, rollout_namespace, rollout_reference,
};
use oneclick_common::retry::{retry_on_conflict, ConflictRetry};
use oneclick_common::{Error, Result};

use crate::store::{ObjectKey, Store, StoredKind};

/// Fields of a managed kind that belong to the controller
pub trait OwnedFields: StoredKind {
    /// Kind name used in logs, events and errors
    const KIND: &'static str;

    /// Whether any owned field of `live` differs from `desired`
    fn drifted(live: &Self, desired: &Self) -> bool;

    /// Copy the owned fields of `desired` onto `live`, leaving the rest alone
    fn overwrite(live: &mut Self, desired: &Self);
}

/// What [`ensure`] did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The object did not exist and was created
    Created,
    /// Owned fields had drifted and were overwritten
    Updated,
    /// The live object already matched
    Unchanged,
    /// A same-named object not owned by this rollout was left alone
    NotOwned,
}

/// Everything a reconciler needs during one pass over one rollout
pub struct PassContext<'a> {
    /// Rollout being reconciled
    pub rollout: &'a Rollout,
    /// Backing store
    pub store: &'a Store,
    /// Event sink
    pub events: &'a dyn EventPublisher,
    /// Conflict retry budget
    pub retry: &'a ConflictRetry,
}

impl PassContext<'_> {
    /// Rollout name
    pub fn name(&self) -> String {
        self.rollout.name_any()
    }

    /// Rollout namespace
    pub fn namespace(&self) -> String {
        rollout_namespace(self.rollout)
    }

    /// Key of a namespaced object next to the rollout
    pub fn key(&self, name: impl Into<String>) -> ObjectKey {
        ObjectKey::namespaced(self.namespace(), name)
    }

    /// Label selector for objects this rollout owns
    pub fn selector(&self) -> String {
        ownership_selector(self.rollout)
    }

    fn reference(&self) -> ObjectReference {
        rollout_reference(self.rollout)
    }

    /// Publish a Normal event on the rollout
    pub async fn normal(&self, reason: &'static str, action: &'static str, note: String) {
        self.events
            .publish(&self.reference(), RolloutEvent::normal(reason, action, note))
            .await;
    }

    /// Publish a Warning event on the rollout
    pub async fn warning(&self, reason: &'static str, action: &'static str, note: String) {
        self.events
            .publish(&self.reference(), RolloutEvent::warning(reason, action, note))
            .await;
    }
}

/// Converge one object to `desired`
pub async fn ensure<K: OwnedFields>(ctx: &PassContext<'_>, desired: K) -> Result<Outcome> {
    let key = ObjectKey::of(&desired);

    let live = match ctx.store.get::<K>(&key).await {
        Ok(live) => live,
        Err(e) => {
            ctx.warning(
                reasons::GET_FAILED,
                actions::RECONCILE,
                format!("Failed to get {} {}: {}", K::KIND, key.name, e),
            )
            .await;
            return Err(e);
        }
    };

    let Some(live) = live else {
        return create(ctx, &key, &desired).await;
    };

    if !carries_ownership_labels(live.meta(), ctx.rollout) {
        warn!(kind = K::KIND, object = %key, "object exists but is not owned by this rollout");
        ctx.warning(
            reasons::CREATION_FAILED,
            actions::CREATE,
            format!("{} {} exists and is not owned by this rollout", K::KIND, key.name),
        )
        .await;
        return Ok(Outcome::NotOwned);
    }

    if !K::drifted(&live, &desired) {
        debug!(kind = K::KIND, object = %key, "object up to date");
        return Ok(Outcome::Unchanged);
    }

    let mut cached = Some(live);
    let operation = format!("update {} {}", K::KIND, key);
    let (key_ref, desired_ref) = (&key, &desired);
    let result = retry_on_conflict(ctx.retry, &operation, move || {
        let first = cached.take();
        let (key, desired) = (key_ref, desired_ref);
        async move {
            let mut live = match first {
                Some(live) => live,
                None => ctx
                    .store
                    .get::<K>(key)
                    .await?
                    .ok_or_else(|| Error::not_found(K::KIND, &key.name))?,
            };
            if !K::drifted(&live, desired) {
                return Ok(false);
            }
            K::overwrite(&mut live, desired);
            ctx.store.replace(&live).await?;
            Ok(true)
        }
    })
    .await;

    match result {
        Ok(true) => {
            info!(kind = K::KIND, object = %key, "updated object");
            ctx.normal(
                reasons::UPDATED,
                actions::UPDATE,
                format!("Updated {} {}", K::KIND, key.name),
            )
            .await;
            Ok(Outcome::Updated)
        }
        Ok(false) => Ok(Outcome::Unchanged),
        Err(e) => {
            ctx.warning(
                reasons::UPDATE_FAILED,
                actions::UPDATE,
                format!("Failed to update {} {}: {}", K::KIND, key.name, e),
            )
            .await;
            Err(e)
        }
    }
}

async fn create<K: OwnedFields>(
    ctx: &PassContext<'_>,
    key: &ObjectKey,
    desired: &K,
) -> Result<Outcome> {
    match ctx.store.create(desired).await {
        Ok(_) => {
            info!(kind = K::KIND, object = %key, "created object");
            ctx.normal(
                reasons::CREATED,
                actions::CREATE,
                format!("Created {} {}", K::KIND, key.name),
            )
            .await;
            Ok(Outcome::Created)
        }
        Err(e) => {
            ctx.warning(
                reasons::CREATION_FAILED,
                actions::CREATE,
                format!("Failed to create {} {}: {}", K::KIND, key.name, e),
            )
            .await;
            Err(e)
        }
    }
}

/// Delete one object, but only when it carries this rollout's labels
///
/// Returns whether anything was deleted.
pub async fn delete_owned<K: OwnedFields>(ctx: &PassContext<'_>, name: &str) -> Result<bool> {
    let key = ctx.key(name);
    let Some(live) = ctx.store.get::<K>(&key).await? else {
        return Ok(false);
    };
    if !carries_ownership_labels(live.meta(), ctx.rollout) {
        debug!(kind = K::KIND, object = %key, "leaving unowned object in place");
        return Ok(false);
    }
    delete::<K>(ctx, &key).await
}

async fn delete<K: OwnedFields>(ctx: &PassContext<'_>, key: &ObjectKey) -> Result<bool> {
    match ctx.store.delete::<K>(key).await {
        Ok(deleted) => {
            if deleted {
                info!(kind = K::KIND, object = %key, "deleted object");
                ctx.normal(
                    reasons::DELETED,
                    actions::DELETE,
                    format!("Deleted {} {}", K::KIND, key.name),
                )
                .await;
            }
            Ok(deleted)
        }
        Err(e) => {
            ctx.warning(
                reasons::DELETION_FAILED,
                actions::DELETE,
                format!("Failed to delete {} {}: {}", K::KIND, key.name, e),
            )
            .await;
            Err(e)
        }
    }
}

/// Delete every label-owned object of kind `K` whose name is not expected
///
/// Objects returned by the label query are re-checked client-side, so an
/// object without both ownership labels is never touched. Returns the number
/// of objects deleted.
pub async fn collect_garbage<K: OwnedFields>(
    ctx: &PassContext<'_>,
    expected: &BTreeSet<String>,
) -> Result<usize> {
    let owned: Vec<K> = ctx.store.list(&ctx.namespace(), &ctx.selector()).await?;

    let mut deleted = 0;
    for obj in owned {
        if !carries_ownership_labels(obj.meta(), ctx.rollout) {
            continue;
        }
        let name = obj.name_any();
        if expected.contains(&name) {
            continue;
        }
        if delete::<K>(ctx, &ctx.key(name)).await? {
            deleted += 1;
        }
    }

    if deleted > 0 {
        debug!(kind = K::KIND, deleted, "collected orphaned objects");
    }
    Ok(deleted)
}
