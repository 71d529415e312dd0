//! Test support: an in-memory cluster and an event recorder

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::core::{ApiResource, DynamicObject};
use kube::ResourceExt;
use serde_json::Value;

use oneclick_common::crd::{Rollout, RolloutSpec};
use oneclick_common::events::{EventPublisher, RolloutEvent};
use oneclick_common::{Error, Result};

use crate::store::{from_dynamic, to_dynamic, ClusterStore, ObjectKey, StoredKind};

/// Rollout in namespace `team-a` with a uid, ready to own objects
pub fn owned_rollout(name: &str, spec: RolloutSpec) -> Rollout {
    let mut rollout = Rollout::new(name, spec);
    rollout.metadata.namespace = Some("team-a".to_string());
    rollout.metadata.uid = Some(format!("uid-{name}"));
    rollout
}

// =============================================================================
// MemoryStore
// =============================================================================

/// One recorded write
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    /// "create", "replace", "delete" or "patch_status"
    pub op: &'static str,
    /// Resource kind
    pub kind: String,
    /// Object name
    pub name: String,
}

type StoreKey = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<StoreKey, DynamicObject>,
    version: u64,
    mutations: Vec<Mutation>,
    conflicts: HashMap<(String, String), u32>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// In-memory [`ClusterStore`] with resourceVersion compare-and-swap,
/// equality label selectors and a log of every write
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn store_key(kind: &str, namespace: Option<&str>, name: &str) -> StoreKey {
    (
        kind.to_string(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

fn selector_matches(selector: &str, obj: &DynamicObject) -> bool {
    let labels = obj.labels();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    let Value::Object(existing) = target else {
        return;
    };
    for (k, v) in fields {
        if v.is_null() {
            existing.remove(k);
        } else {
            merge_patch(existing.entry(k.clone()).or_insert(Value::Null), v);
        }
    }
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object without recording a mutation
    pub fn seed<K: StoredKind>(&self, obj: &K) {
        let mut dynamic = to_dynamic(obj).expect("seed object serializes");
        let mut state = self.state.lock().unwrap();
        dynamic.metadata.resource_version = Some(state.next_version());
        if dynamic.metadata.uid.is_none() {
            dynamic.metadata.uid = Some(format!("uid-{}", dynamic.name_any()));
        }
        let key = store_key(
            &K::kind(&()),
            dynamic.metadata.namespace.as_deref(),
            &dynamic.name_any(),
        );
        state.objects.insert(key, dynamic);
    }

    /// Typed read of a stored object
    pub fn get_typed<K: StoredKind>(&self, namespace: &str, name: &str) -> Option<K> {
        let state = self.state.lock().unwrap();
        let ns = (!namespace.is_empty()).then_some(namespace);
        state
            .objects
            .get(&store_key(&K::kind(&()), ns, name))
            .cloned()
            .map(|obj| from_dynamic(obj).expect("stored object deserializes"))
    }

    /// Whether an object exists
    pub fn contains(&self, kind: &str, namespace: &str, name: &str) -> bool {
        let state = self.state.lock().unwrap();
        let ns = (!namespace.is_empty()).then_some(namespace);
        state.objects.contains_key(&store_key(kind, ns, name))
    }

    /// Sorted names of all stored objects of a kind
    pub fn names(&self, kind: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .keys()
            .filter(|(k, _, _)| k == kind)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Every write so far
    pub fn mutations(&self) -> Vec<Mutation> {
        self.state.lock().unwrap().mutations.clone()
    }

    /// Number of writes so far
    pub fn mutation_count(&self) -> usize {
        self.state.lock().unwrap().mutations.len()
    }

    /// Writes recorded after the first `since`
    pub fn mutations_since(&self, since: usize) -> Vec<Mutation> {
        self.state.lock().unwrap().mutations[since..].to_vec()
    }

    /// Make the next `count` replaces of an object fail with a conflict
    pub fn inject_conflicts(&self, kind: &str, name: &str, count: u32) {
        let mut state = self.state.lock().unwrap();
        state
            .conflicts
            .insert((kind.to_string(), name.to_string()), count);
    }

    /// Overwrite an object's status without recording a mutation
    pub fn set_status(&self, kind: &str, namespace: &str, name: &str, status: Value) {
        let mut state = self.state.lock().unwrap();
        let ns = (!namespace.is_empty()).then_some(namespace);
        if let Some(obj) = state.objects.get_mut(&store_key(kind, ns, name)) {
            if let Some(data) = obj.data.as_object_mut() {
                data.insert("status".to_string(), status);
            }
        }
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .get(&store_key(&resource.kind, key.namespace.as_deref(), &key.name))
            .cloned())
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .iter()
            .filter(|((kind, ns, _), obj)| {
                *kind == resource.kind && ns == namespace && selector_matches(label_selector, obj)
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, resource: &ApiResource, object: &DynamicObject) -> Result<DynamicObject> {
        let mut state = self.state.lock().unwrap();
        let name = object.name_any();
        let key = store_key(&resource.kind, object.metadata.namespace.as_deref(), &name);
        if state.objects.contains_key(&key) {
            return Err(Error::already_exists(&resource.kind, name));
        }
        let mut stored = object.clone();
        stored.metadata.resource_version = Some(state.next_version());
        stored.metadata.uid = Some(format!("uid-{name}"));
        state.objects.insert(key, stored.clone());
        state.mutations.push(Mutation {
            op: "create",
            kind: resource.kind.clone(),
            name,
        });
        Ok(stored)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let mut state = self.state.lock().unwrap();
        let name = object.name_any();

        let pending = state
            .conflicts
            .get_mut(&(resource.kind.clone(), name.clone()));
        if let Some(remaining) = pending {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::conflict(&resource.kind, name));
            }
        }

        let key = store_key(&resource.kind, object.metadata.namespace.as_deref(), &name);
        let Some(current) = state.objects.get(&key) else {
            return Err(Error::not_found(&resource.kind, name));
        };
        if current.metadata.resource_version != object.metadata.resource_version {
            return Err(Error::conflict(&resource.kind, name));
        }

        // The main resource endpoint does not write status
        let status = current.data.get("status").cloned();
        let mut stored = object.clone();
        if let Some(data) = stored.data.as_object_mut() {
            match status {
                Some(status) => {
                    data.insert("status".to_string(), status);
                }
                None => {
                    data.remove("status");
                }
            }
        }
        stored.metadata.resource_version = Some(state.next_version());
        state.objects.insert(key, stored.clone());
        state.mutations.push(Mutation {
            op: "replace",
            kind: resource.kind.clone(),
            name,
        });
        Ok(stored)
    }

    async fn delete(&self, resource: &ApiResource, key: &ObjectKey) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let removed = state
            .objects
            .remove(&store_key(&resource.kind, key.namespace.as_deref(), &key.name))
            .is_some();
        if removed {
            state.mutations.push(Mutation {
                op: "delete",
                kind: resource.kind.clone(),
                name: key.name.clone(),
            });
        }
        Ok(removed)
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        status: Value,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let k = store_key(&resource.kind, key.namespace.as_deref(), &key.name);
        let version = state.next_version();
        let Some(obj) = state.objects.get_mut(&k) else {
            return Err(Error::not_found(&resource.kind, &key.name));
        };
        if !obj.data.is_object() {
            obj.data = Value::Object(Default::default());
        }
        if let Some(data) = obj.data.as_object_mut() {
            merge_patch(data.entry("status").or_insert(Value::Null), &status);
        }
        obj.metadata.resource_version = Some(version);
        state.mutations.push(Mutation {
            op: "patch_status",
            kind: resource.kind.clone(),
            name: key.name.clone(),
        });
        Ok(())
    }
}

// =============================================================================
// RecordingEvents
// =============================================================================

/// [`EventPublisher`] that keeps every event for assertions
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RolloutEvent>>,
}

impl RecordingEvents {
    /// Captured events in publish order
    pub fn events(&self) -> Vec<RolloutEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Captured reasons in publish order
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason.to_string()).collect()
    }

    /// Whether any event carried `reason`
    pub fn has_reason(&self, reason: &str) -> bool {
        self.events().iter().any(|e| e.reason == reason)
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(&self, _rollout: &ObjectReference, event: RolloutEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn ar() -> ApiResource {
        ApiResource::erase::<ConfigMap>(&())
    }

    fn cm(name: &str, labels: &[(&str, &str)]) -> DynamicObject {
        to_dynamic(&ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("team-a".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn stale_versions_conflict() {
        let store = MemoryStore::new();
        let created = store.create(&ar(), &cm("a", &[])).await.unwrap();
        store.replace(&ar(), &created).await.unwrap();

        let err = store.replace(&ar(), &created).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn duplicate_create_is_already_exists() {
        let store = MemoryStore::new();
        store.create(&ar(), &cm("a", &[])).await.unwrap();
        let err = store.create(&ar(), &cm("a", &[])).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn list_honours_selector_and_namespace() {
        let store = MemoryStore::new();
        store.create(&ar(), &cm("a", &[("app", "web")])).await.unwrap();
        store.create(&ar(), &cm("b", &[("app", "api")])).await.unwrap();

        let found = store.list(&ar(), "team-a", "app=web").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name_any(), "a");
        assert!(store.list(&ar(), "other", "").await.unwrap().is_empty());
        assert_eq!(store.list(&ar(), "team-a", "").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_reports_absence() {
        let store = MemoryStore::new();
        store.create(&ar(), &cm("a", &[])).await.unwrap();
        let key = ObjectKey::namespaced("team-a", "a");
        assert!(store.delete(&ar(), &key).await.unwrap());
        assert!(!store.delete(&ar(), &key).await.unwrap());
        assert_eq!(store.mutation_count(), 2);
    }

    #[test]
    fn merge_patch_replaces_leaves_and_removes_nulls() {
        let mut target = serde_json::json!({"a": {"b": 1, "c": 2}, "d": 3});
        merge_patch(&mut target, &serde_json::json!({"a": {"b": 5, "c": null}}));
        assert_eq!(target, serde_json::json!({"a": {"b": 5}, "d": 3}));
    }
}
