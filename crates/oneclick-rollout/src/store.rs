//! Backing-store seam
//!
//! Reconcilers talk to the cluster through [`ClusterStore`], an object-safe
//! trait over dynamic objects. [`KubeStore`] implements it against the API
//! server; tests substitute an in-memory store or a mock. [`Store`] is the
//! typed facade the reconcilers actually use.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use oneclick_common::{Error, Result, CONTROLLER_NAME};

/// Namespace and name of a stored object
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped kinds
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of an existing object
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

// =============================================================================
// Trait for dependency injection and testability
// =============================================================================

/// Primitive operations every reconciler is built from
///
/// `replace` carries the `resourceVersion` the object was read at and fails
/// with [`Error::Conflict`] when the stored object has moved on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch an object; `None` when it does not exist
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>>;

    /// List objects in a namespace matching a label selector
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>>;

    /// Create an object; [`Error::AlreadyExists`] when the name is taken
    async fn create(&self, resource: &ApiResource, object: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an object, compare-and-swap on `resourceVersion`
    async fn replace(&self, resource: &ApiResource, object: &DynamicObject)
        -> Result<DynamicObject>;

    /// Delete an object; `false` when it was already gone
    async fn delete(&self, resource: &ApiResource, key: &ObjectKey) -> Result<bool>;

    /// Merge-patch the status subresource
    async fn patch_status(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        status: serde_json::Value,
    ) -> Result<()>;
}

// =============================================================================
// API server implementation
// =============================================================================

/// [`ClusterStore`] backed by the Kubernetes API server
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(CONTROLLER_NAME.to_string()),
        }
    }
}

fn map_write_error(e: kube::Error, resource: &ApiResource, name: &str) -> Error {
    match &e {
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            Error::already_exists(&resource.kind, name)
        }
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(&resource.kind, name),
        _ => e.into(),
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        let api = self.api(resource, key.namespace.as_deref());
        Ok(api.get_opt(&key.name).await?)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let api = self.api(resource, Some(namespace));
        let list = api.list(&ListParams::default().labels(label_selector)).await?;
        Ok(list.items)
    }

    async fn create(&self, resource: &ApiResource, object: &DynamicObject) -> Result<DynamicObject> {
        let name = object.name_any();
        let api = self.api(resource, object.metadata.namespace.as_deref());
        api.create(&Self::post_params(), object)
            .await
            .map_err(|e| map_write_error(e, resource, &name))
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = object.name_any();
        let api = self.api(resource, object.metadata.namespace.as_deref());
        api.replace(&name, &Self::post_params(), object)
            .await
            .map_err(|e| map_write_error(e, resource, &name))
    }

    async fn delete(&self, resource: &ApiResource, key: &ObjectKey) -> Result<bool> {
        let api = self.api(resource, key.namespace.as_deref());
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        status: serde_json::Value,
    ) -> Result<()> {
        let api = self.api(resource, key.namespace.as_deref());
        let status_patch = serde_json::json!({ "status": status });
        api.patch_status(
            &key.name,
            &PatchParams::apply(CONTROLLER_NAME),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }
}

// =============================================================================
// Typed facade
// =============================================================================

/// Bounds for any kind the typed facade can store
pub trait StoredKind:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> StoredKind for K where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Convert a typed object into its dynamic form
pub fn to_dynamic<K: StoredKind>(obj: &K) -> Result<DynamicObject> {
    let value = serde_json::to_value(obj)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))?;
    serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))
}

/// Convert a dynamic object into a typed one
pub fn from_dynamic<K: StoredKind>(obj: DynamicObject) -> Result<K> {
    let value = serde_json::to_value(&obj)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))?;
    serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))
}

/// Typed access to a [`ClusterStore`]
#[derive(Clone)]
pub struct Store {
    inner: Arc<dyn ClusterStore>,
}

impl Store {
    /// Wrap a store implementation
    pub fn new(inner: Arc<dyn ClusterStore>) -> Self {
        Self { inner }
    }

    /// Fetch an object by key
    pub async fn get<K: StoredKind>(&self, key: &ObjectKey) -> Result<Option<K>> {
        let ar = ApiResource::erase::<K>(&());
        self.inner.get(&ar, key).await?.map(from_dynamic).transpose()
    }

    /// List objects in a namespace matching a label selector
    pub async fn list<K: StoredKind>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>> {
        let ar = ApiResource::erase::<K>(&());
        self.inner
            .list(&ar, namespace, label_selector)
            .await?
            .into_iter()
            .map(from_dynamic)
            .collect()
    }

    /// Create an object
    pub async fn create<K: StoredKind>(&self, obj: &K) -> Result<K> {
        let ar = ApiResource::erase::<K>(&());
        debug!(kind = %ar.kind, name = %obj.name_any(), "creating object");
        let created = self.inner.create(&ar, &to_dynamic(obj)?).await?;
        from_dynamic(created)
    }

    /// Replace an object at the version it was read at
    pub async fn replace<K: StoredKind>(&self, obj: &K) -> Result<K> {
        let ar = ApiResource::erase::<K>(&());
        debug!(kind = %ar.kind, name = %obj.name_any(), "replacing object");
        let replaced = self.inner.replace(&ar, &to_dynamic(obj)?).await?;
        from_dynamic(replaced)
    }

    /// Delete an object; `false` when it was already gone
    pub async fn delete<K: StoredKind>(&self, key: &ObjectKey) -> Result<bool> {
        let ar = ApiResource::erase::<K>(&());
        debug!(kind = %ar.kind, object = %key, "deleting object");
        self.inner.delete(&ar, key).await
    }

    /// Merge-patch an object's status
    pub async fn patch_status<K: StoredKind, S: Serialize + Sync>(
        &self,
        key: &ObjectKey,
        status: &S,
    ) -> Result<()> {
        let ar = ApiResource::erase::<K>(&());
        let value = serde_json::to_value(status)
            .map_err(|e| Error::serialization_for_kind(ar.kind.clone(), e.to_string()))?;
        self.inner.patch_status(&ar, key, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use mockall::predicate::always;

    fn service(name: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("team-a".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn dynamic_conversion_preserves_identity() {
        let dynamic = to_dynamic(&service("web-http-svc")).unwrap();
        assert_eq!(dynamic.name_any(), "web-http-svc");
        assert_eq!(dynamic.types.as_ref().map(|t| t.kind.as_str()), Some("Service"));

        let back: Service = from_dynamic(dynamic).unwrap();
        assert_eq!(back.metadata.namespace.as_deref(), Some("team-a"));
    }

    #[test]
    fn keys_render_with_namespace() {
        assert_eq!(ObjectKey::namespaced("ns", "a").to_string(), "ns/a");
        assert_eq!(ObjectKey::cluster("standard").to_string(), "standard");
        assert_eq!(
            ObjectKey::of(&service("x")),
            ObjectKey::namespaced("team-a", "x")
        );
    }

    #[tokio::test]
    async fn typed_get_passes_erased_resource() {
        let mut mock = MockClusterStore::new();
        mock.expect_get()
            .withf(|ar, key| ar.kind == "Service" && ar.plural == "services" && key.name == "svc")
            .times(1)
            .returning(|_, _| Ok(None));
        let store = Store::new(Arc::new(mock));
        let got: Option<Service> = store
            .get(&ObjectKey::namespaced("team-a", "svc"))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn typed_errors_propagate() {
        let mut mock = MockClusterStore::new();
        mock.expect_replace()
            .with(always(), always())
            .returning(|ar, obj| Err(Error::conflict(&ar.kind, obj.name_any())));
        let store = Store::new(Arc::new(mock));
        let err = store.replace(&service("web-http-svc")).await.unwrap_err();
        assert!(err.is_conflict());
    }
}
