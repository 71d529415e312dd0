//! Storage-claim (PersistentVolumeClaim) reconciler
//!
//! Claims are created once and afterwards only ever grow. A larger declared
//! size is applied in place when the claim is filesystem-backed and its
//! storage class allows expansion; anything else is skipped with an event.
//! Smaller sizes are ignored.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::Resource;
use tracing::{debug, info};

use oneclick_common::crd::{Rollout, VolumeSpec};
use oneclick_common::events::{actions, reasons};
use oneclick_common::kube_utils::{carries_ownership_labels, claim_name, owned_metadata};
use oneclick_common::quantity::ParsedQuantity;
use oneclick_common::Result;

use crate::managed::{collect_garbage, ensure, OwnedFields, PassContext};
use crate::store::ObjectKey;

const STORAGE: &str = "storage";
const ACCESS_MODE: &str = "ReadWriteOnce";
const FILESYSTEM: &str = "Filesystem";

/// Desired claim for the volume at `index`
pub fn build_claim(rollout: &Rollout, index: usize, vol: &VolumeSpec) -> Result<PersistentVolumeClaim> {
    ParsedQuantity::parse(&format!("spec.volumes[{index}].size"), &vol.size)?;
    let name = rollout.metadata.name.clone().unwrap_or_default();
    Ok(PersistentVolumeClaim {
        metadata: owned_metadata(rollout, claim_name(&name, &vol.name))?,
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![ACCESS_MODE.to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    STORAGE.to_string(),
                    Quantity(vol.size.clone()),
                )])),
                limits: None,
            }),
            storage_class_name: (!vol.storage_class.is_empty()).then(|| vol.storage_class.clone()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn parsed(q: Option<&Quantity>) -> Option<ParsedQuantity> {
    q.and_then(|q| ParsedQuantity::from_quantity(STORAGE, q).ok())
}

fn requested(pvc: &PersistentVolumeClaim) -> Option<ParsedQuantity> {
    parsed(
        pvc.spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get(STORAGE)),
    )
}

/// Larger of the requested size and the capacity the claim reports
fn current_capacity(pvc: &PersistentVolumeClaim) -> Option<ParsedQuantity> {
    let reported = parsed(
        pvc.status
            .as_ref()
            .and_then(|s| s.capacity.as_ref())
            .and_then(|c| c.get(STORAGE)),
    );
    requested(pvc).max(reported)
}

fn grows(live: &PersistentVolumeClaim, desired: &PersistentVolumeClaim) -> bool {
    match (current_capacity(live), requested(desired)) {
        (Some(current), Some(wanted)) => wanted > current,
        _ => false,
    }
}

impl OwnedFields for PersistentVolumeClaim {
    const KIND: &'static str = "PersistentVolumeClaim";

    fn drifted(live: &Self, desired: &Self) -> bool {
        grows(live, desired)
    }

    fn overwrite(live: &mut Self, desired: &Self) {
        let Some(size) = desired
            .spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get(STORAGE))
        else {
            return;
        };
        live.spec
            .get_or_insert_with(Default::default)
            .resources
            .get_or_insert_with(Default::default)
            .requests
            .get_or_insert_with(Default::default)
            .insert(STORAGE.to_string(), size.clone());
    }
}

/// Why an expansion cannot be applied, if it cannot
async fn expansion_blocker(
    ctx: &PassContext<'_>,
    live: &PersistentVolumeClaim,
) -> Result<Option<String>> {
    let spec = live.spec.as_ref();
    let mode = spec
        .and_then(|s| s.volume_mode.as_deref())
        .unwrap_or(FILESYSTEM);
    if mode != FILESYSTEM {
        return Ok(Some(format!("volume mode {mode} cannot be expanded")));
    }

    let Some(class) = spec
        .and_then(|s| s.storage_class_name.as_deref())
        .filter(|c| !c.is_empty())
    else {
        return Ok(Some("claim has no storage class".to_string()));
    };
    let Some(storage_class) = ctx
        .store
        .get::<StorageClass>(&ObjectKey::cluster(class))
        .await?
    else {
        return Ok(Some(format!("storage class {class} not found")));
    };
    if storage_class.allow_volume_expansion != Some(true) {
        return Ok(Some(format!("storage class {class} does not allow volume expansion")));
    }
    Ok(None)
}

async fn converge_claim(ctx: &PassContext<'_>, index: usize, vol: &VolumeSpec) -> Result<()> {
    let desired = build_claim(ctx.rollout, index, vol)?;
    let key = ObjectKey::of(&desired);

    if let Some(live) = ctx.store.get::<PersistentVolumeClaim>(&key).await? {
        let owned = carries_ownership_labels(live.meta(), ctx.rollout);
        if owned && !grows(&live, &desired) {
            debug!(claim = %key, "claim large enough");
            return Ok(());
        }
        if owned {
            if let Some(reason) = expansion_blocker(ctx, &live).await? {
                info!(claim = %key, %reason, "skipping claim resize");
                ctx.normal(
                    reasons::RESIZE_SKIPPED,
                    actions::RESIZE,
                    format!("Skipped resizing PersistentVolumeClaim {}: {}", key.name, reason),
                )
                .await;
                return Ok(());
            }
        }
    }

    ensure(ctx, desired).await?;
    Ok(())
}

/// Converge one claim per volume and remove the rest
///
/// With no volumes declared every label-owned claim is removed.
pub async fn reconcile(ctx: &PassContext<'_>) -> Result<()> {
    let name = ctx.name();
    let mut expected = BTreeSet::new();
    for (index, vol) in ctx.rollout.spec.volumes.iter().enumerate() {
        expected.insert(claim_name(&name, &vol.name));
        converge_claim(ctx, index, vol).await?;
    }
    collect_garbage::<PersistentVolumeClaim>(ctx, &expected).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::testing::{owned_rollout, MemoryStore, RecordingEvents};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use oneclick_common::crd::RolloutSpec;
    use oneclick_common::retry::ConflictRetry;
    use std::sync::Arc;

    fn volume(name: &str, size: &str) -> VolumeSpec {
        VolumeSpec {
            name: name.to_string(),
            mount_path: format!("/data/{name}"),
            size: size.to_string(),
            storage_class: "standard".to_string(),
        }
    }

    fn rollout(volumes: Vec<VolumeSpec>) -> Rollout {
        owned_rollout(
            "web",
            RolloutSpec {
                volumes,
                ..Default::default()
            },
        )
    }

    fn storage_class(allow: Option<bool>) -> StorageClass {
        StorageClass {
            metadata: ObjectMeta {
                name: Some("standard".to_string()),
                ..Default::default()
            },
            provisioner: "csi.example.com".to_string(),
            allow_volume_expansion: allow,
            ..Default::default()
        }
    }

    struct Harness {
        memory: Arc<MemoryStore>,
        store: Store,
    }

    impl Harness {
        fn new() -> Self {
            let memory = Arc::new(MemoryStore::new());
            Self {
                store: Store::new(memory.clone()),
                memory,
            }
        }

        async fn run(&self, rollout: &Rollout) -> RecordingEvents {
            let events = RecordingEvents::default();
            let retry = ConflictRetry::default();
            let ctx = PassContext {
                rollout,
                store: &self.store,
                events: &events,
                retry: &retry,
            };
            reconcile(&ctx).await.unwrap();
            events
        }

        fn requested(&self, name: &str) -> String {
            let live: PersistentVolumeClaim = self.memory.get_typed("team-a", name).unwrap();
            live.spec.unwrap().resources.unwrap().requests.unwrap()[STORAGE].0.clone()
        }
    }

    #[test]
    fn claim_is_single_writer_with_declared_size() {
        let claim = build_claim(&rollout(vec![]), 0, &volume("data", "10Gi")).unwrap();
        assert_eq!(claim.metadata.name.as_deref(), Some("data-web"));
        let spec = claim.spec.unwrap();
        assert_eq!(spec.access_modes, Some(vec!["ReadWriteOnce".to_string()]));
        assert_eq!(spec.storage_class_name.as_deref(), Some("standard"));
        assert_eq!(
            spec.resources.unwrap().requests.unwrap()[STORAGE],
            Quantity("10Gi".to_string())
        );
    }

    #[test]
    fn unparsable_size_is_rejected() {
        let err = build_claim(&rollout(vec![]), 1, &volume("data", "big")).unwrap_err();
        assert!(err.to_string().contains("spec.volumes[1].size"));
    }

    #[tokio::test]
    async fn adding_a_volume_creates_exactly_one_claim() {
        let h = Harness::new();
        h.run(&rollout(vec![volume("data", "10Gi")])).await;
        let before = h.memory.mutation_count();

        h.run(&rollout(vec![volume("data", "10Gi"), volume("cache", "1Gi")]))
            .await;
        let writes = h.memory.mutations_since(before);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].op, "create");
        assert_eq!(writes[0].name, "cache-web");
    }

    #[tokio::test]
    async fn shrink_never_writes() {
        let h = Harness::new();
        h.memory.seed(&storage_class(Some(true)));
        h.run(&rollout(vec![volume("data", "10Gi")])).await;
        h.memory.set_status(
            "PersistentVolumeClaim",
            "team-a",
            "data-web",
            serde_json::json!({"capacity": {"storage": "12Gi"}}),
        );
        let before = h.memory.mutation_count();

        h.run(&rollout(vec![volume("data", "5Gi")])).await;
        h.run(&rollout(vec![volume("data", "11Gi")])).await;
        assert!(h.memory.mutations_since(before).is_empty());
        assert_eq!(h.requested("data-web"), "10Gi");
    }

    #[tokio::test]
    async fn growth_is_applied_when_the_class_allows_it() {
        let h = Harness::new();
        h.memory.seed(&storage_class(Some(true)));
        h.run(&rollout(vec![volume("data", "10Gi")])).await;

        let events = h.run(&rollout(vec![volume("data", "20Gi")])).await;
        assert_eq!(h.requested("data-web"), "20Gi");
        assert!(events.has_reason(reasons::UPDATED));
    }

    #[tokio::test]
    async fn growth_is_skipped_when_the_class_forbids_it() {
        let h = Harness::new();
        h.memory.seed(&storage_class(None));
        h.run(&rollout(vec![volume("data", "10Gi")])).await;
        let before = h.memory.mutation_count();

        let events = h.run(&rollout(vec![volume("data", "20Gi")])).await;
        assert!(h.memory.mutations_since(before).is_empty());
        assert!(events.has_reason(reasons::RESIZE_SKIPPED));
        assert_eq!(h.requested("data-web"), "10Gi");
    }

    #[tokio::test]
    async fn block_volumes_are_not_resized() {
        let h = Harness::new();
        h.memory.seed(&storage_class(Some(true)));
        let mut claim = build_claim(&rollout(vec![]), 0, &volume("data", "10Gi")).unwrap();
        claim.spec.as_mut().unwrap().volume_mode = Some("Block".to_string());
        h.memory.seed(&claim);

        let events = h.run(&rollout(vec![volume("data", "20Gi")])).await;
        assert!(events.has_reason(reasons::RESIZE_SKIPPED));
        assert_eq!(h.memory.mutation_count(), 0);
    }

    #[tokio::test]
    async fn emptied_volume_list_removes_only_owned_claims() {
        let h = Harness::new();
        h.run(&rollout(vec![volume("data", "1Gi"), volume("cache", "1Gi")]))
            .await;
        h.memory.seed(&PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("shared".to_string()),
                namespace: Some("team-a".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });

        h.run(&rollout(vec![])).await;
        assert_eq!(h.memory.names("PersistentVolumeClaim"), vec!["shared"]);
    }
}
