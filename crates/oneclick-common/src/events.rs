//! Events reported on a Rollout
//!
//! Every create, update, delete and skipped resize the controller performs
//! is reported on the Rollout itself, so `kubectl describe rollout` shows
//! the history of a pass. Publishing never fails a pass; a failed publish
//! is only logged.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// One observation about a managed object, published on its Rollout
#[derive(Clone, Debug, PartialEq)]
pub struct RolloutEvent {
    /// Normal or Warning
    pub severity: EventType,
    /// One of [`reasons`]
    pub reason: &'static str,
    /// One of [`actions`]
    pub action: &'static str,
    /// Which object, and what happened to it
    pub note: String,
}

impl RolloutEvent {
    /// Something the controller did as intended
    pub fn normal(reason: &'static str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            severity: EventType::Normal,
            reason,
            action,
            note: note.into(),
        }
    }

    /// Something the controller could not do
    pub fn warning(reason: &'static str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            severity: EventType::Warning,
            reason,
            action,
            note: note.into(),
        }
    }
}

/// Sink for [`RolloutEvent`]s
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish `event` on the Rollout referenced by `rollout`
    async fn publish(&self, rollout: &ObjectReference, event: RolloutEvent);
}

/// Publishes through the API server's events API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `controller_name`, tagged with the operator pod when
    /// `POD_NAME` is set
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, rollout: &ObjectReference, event: RolloutEvent) {
        let RolloutEvent {
            severity,
            reason,
            action,
            note,
        } = event;
        let event = Event {
            type_: severity,
            reason: reason.to_string(),
            note: Some(note),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, rollout).await {
            warn!(
                rollout = rollout.name.as_deref().unwrap_or_default(),
                reason,
                error = %e,
                "failed to publish rollout event"
            );
        }
    }
}

/// Drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _rollout: &ObjectReference, _event: RolloutEvent) {}
}

/// Reason strings
pub mod reasons {
    /// A managed object was created
    pub const CREATED: &str = "Created";
    /// A managed object was brought back in line with its rollout
    pub const UPDATED: &str = "Updated";
    /// A managed object no longer referenced by its rollout was removed
    pub const DELETED: &str = "Deleted";
    /// Creating a managed object failed
    pub const CREATION_FAILED: &str = "CreationFailed";
    /// Updating a managed object failed
    pub const UPDATE_FAILED: &str = "UpdateFailed";
    /// Deleting a managed object failed
    pub const DELETION_FAILED: &str = "DeletionFailed";
    /// Reading a managed object failed
    pub const GET_FAILED: &str = "GetFailed";
    /// A storage claim could not be expanded in place
    pub const RESIZE_SKIPPED: &str = "ResizeSkipped";
}

/// Action strings
pub mod actions {
    /// Standard reconciliation pass
    pub const RECONCILE: &str = "Reconcile";
    /// Creating a managed object
    pub const CREATE: &str = "Create";
    /// Updating a managed object
    pub const UPDATE: &str = "Update";
    /// Removing a managed object
    pub const DELETE: &str = "Delete";
    /// Expanding a storage claim
    pub const RESIZE: &str = "Resize";
}
