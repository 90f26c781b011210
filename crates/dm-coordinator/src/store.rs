//! Cluster object store access
//!
//! The coordinator reads and writes resources of any kind through the
//! [`ObjectStore`] trait so the notification cascade and monitors can be
//! exercised without an API server. [`KubeObjectStore`] is the production
//! implementation; [`InMemoryObjectStore`] mirrors its optimistic-concurrency
//! behavior for tests and local tooling.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams, PostParams};
use kube::core::{ErrorResponse, TypeMeta};
use kube::discovery::ApiResource;
use kube::{Client, Resource};
use parking_lot::Mutex;

#[cfg(test)]
use mockall::automock;

use dm_common::{Error, KubeResultExt, ResourceKind, Result};

/// Identity of a single namespaced object of any kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectTarget {
    resource: ApiResource,
    namespace: String,
    name: String,
}

impl ObjectTarget {
    /// Create a target from an explicit resource type, namespace and name
    pub fn new(
        resource: ApiResource,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            resource,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a target for one of the deployment manager kinds
    pub fn of_kind(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(kind.api_resource(), namespace, name)
    }

    /// Create a target from a typed resource
    ///
    /// Fails if the object has no namespace or name (cluster-scoped or not
    /// yet persisted).
    pub fn from_resource<K>(object: &K) -> Result<Self>
    where
        K: Resource<DynamicType = ()>,
    {
        let resource = ApiResource::erase::<K>(&());
        Self::from_meta(resource, object.meta())
    }

    /// Create a target from a dynamic object of the given resource type
    pub fn from_dynamic(object: &DynamicObject, resource: &ApiResource) -> Result<Self> {
        Self::from_meta(resource.clone(), &object.metadata)
    }

    fn from_meta(
        resource: ApiResource,
        meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
    ) -> Result<Self> {
        let name = meta.name.clone().ok_or_else(|| {
            Error::invalid_object(resource.kind.clone(), "object has no name")
        })?;
        let namespace = meta.namespace.clone().ok_or_else(|| {
            Error::invalid_object(format!("{}/{}", resource.kind, name), "object has no namespace")
        })?;
        Ok(Self::new(resource, namespace, name))
    }

    /// The resource type of the target
    pub fn resource(&self) -> &ApiResource {
        &self.resource
    }

    /// Namespace of the target
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name of the target
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ObjectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.resource.kind, self.namespace, self.name)
    }
}

/// Trait abstracting the cluster object store
///
/// Updates carry the object's resourceVersion; an update based on stale
/// data is rejected with a conflict and is never retried here.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a single object
    async fn get(&self, target: &ObjectTarget) -> Result<DynamicObject>;

    /// List all objects of a resource type in a namespace
    async fn list(&self, resource: &ApiResource, namespace: &str) -> Result<Vec<DynamicObject>>;

    /// Replace an object, returning the stored result
    async fn update(&self, resource: &ApiResource, object: &DynamicObject) -> Result<DynamicObject>;
}

/// Real Kubernetes object store
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    /// Create a new store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(&self, target: &ObjectTarget) -> Result<DynamicObject> {
        self.api(target.resource(), target.namespace())
            .get(target.name())
            .await
            .context("get", &target.to_string())
    }

    async fn list(&self, resource: &ApiResource, namespace: &str) -> Result<Vec<DynamicObject>> {
        let list = self
            .api(resource, namespace)
            .list(&ListParams::default())
            .await
            .context("list", &format!("{}/{}", resource.kind, namespace))?;
        Ok(list.items)
    }

    async fn update(&self, resource: &ApiResource, object: &DynamicObject) -> Result<DynamicObject> {
        let target = ObjectTarget::from_dynamic(object, resource)?;

        // List items come back without apiVersion/kind
        let mut object = object.clone();
        if object.types.is_none() {
            object.types = Some(TypeMeta {
                api_version: resource.api_version.clone(),
                kind: resource.kind.clone(),
            });
        }

        self.api(resource, target.namespace())
            .replace(target.name(), &PostParams::default(), &object)
            .await
            .context("update", &target.to_string())
    }
}

type StoreKey = (String, String, String, String);

fn store_key(resource: &ApiResource, namespace: &str, name: &str) -> StoreKey {
    (
        resource.api_version.clone(),
        resource.kind.clone(),
        namespace.to_string(),
        name.to_string(),
    )
}

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

/// In-memory object store with API-server-like optimistic concurrency
///
/// Every write bumps the object's resourceVersion. An update whose
/// resourceVersion does not match the stored one is rejected with 409;
/// an update without a resourceVersion is applied unconditionally.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<StoreKey, DynamicObject>>,
    updates: AtomicUsize,
}

impl InMemoryObjectStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object, overwriting any existing object with the same identity
    pub fn insert(&self, resource: &ApiResource, mut object: DynamicObject) -> Result<ObjectTarget> {
        let target = ObjectTarget::from_dynamic(&object, resource)?;
        object.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
        object.metadata.resource_version = Some("1".to_string());
        self.objects.lock().insert(
            store_key(resource, target.namespace(), target.name()),
            object,
        );
        Ok(target)
    }

    /// Current stored copy of an object
    pub fn object(&self, target: &ObjectTarget) -> Option<DynamicObject> {
        self.objects
            .lock()
            .get(&store_key(target.resource(), target.namespace(), target.name()))
            .cloned()
    }

    /// Current value of an annotation on a stored object
    pub fn annotation(&self, target: &ObjectTarget, key: &str) -> Option<String> {
        self.object(target)?
            .metadata
            .annotations?
            .get(key)
            .cloned()
    }

    /// Number of successful updates since creation
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, target: &ObjectTarget) -> Result<DynamicObject> {
        self.object(target).ok_or_else(|| {
            Error::kube(
                "get",
                target.to_string(),
                api_error(404, "NotFound", format!("{} not found", target)),
            )
        })
    }

    async fn list(&self, resource: &ApiResource, namespace: &str) -> Result<Vec<DynamicObject>> {
        let objects = self.objects.lock();
        Ok(objects
            .iter()
            .filter(|((api_version, kind, ns, _), _)| {
                *api_version == resource.api_version && *kind == resource.kind && ns == namespace
            })
            .map(|(_, obj)| {
                // List items come back without apiVersion/kind
                let mut obj = obj.clone();
                obj.types = None;
                obj
            })
            .collect())
    }

    async fn update(&self, resource: &ApiResource, object: &DynamicObject) -> Result<DynamicObject> {
        let target = ObjectTarget::from_dynamic(object, resource)?;
        let key = store_key(resource, target.namespace(), target.name());

        let mut objects = self.objects.lock();
        let current = objects.get(&key).ok_or_else(|| {
            Error::kube(
                "update",
                target.to_string(),
                api_error(404, "NotFound", format!("{} not found", target)),
            )
        })?;

        let current_version = current.metadata.resource_version.clone();
        if let Some(requested) = object.metadata.resource_version.as_deref() {
            if current_version.as_deref() != Some(requested) {
                return Err(Error::kube(
                    "update",
                    target.to_string(),
                    api_error(
                        409,
                        "Conflict",
                        format!("{} has been modified; apply changes to the latest version", target),
                    ),
                ));
            }
        }

        let next_version = current_version
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            .saturating_add(1);

        let mut stored = object.clone();
        stored.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
        stored.metadata.resource_version = Some(next_version.to_string());
        objects.insert(key, stored.clone());
        self.updates.fetch_add(1, Ordering::SeqCst);

        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(namespace: &str, name: &str) -> DynamicObject {
        DynamicObject::new(name, &ResourceKind::Host.api_resource()).within(namespace)
    }

    #[test]
    fn target_display_includes_kind_namespace_and_name() {
        let target = ObjectTarget::of_kind(ResourceKind::Host, "ns1", "controller-0");
        assert_eq!(target.to_string(), "Host/ns1/controller-0");
    }

    #[test]
    fn target_requires_namespace() {
        let ar = ResourceKind::Host.api_resource();
        let obj = DynamicObject::new("controller-0", &ar);
        let err = ObjectTarget::from_dynamic(&obj, &ar).unwrap_err();
        assert!(matches!(err, Error::InvalidObject { .. }));
    }

    #[test]
    fn target_from_typed_resource() {
        use k8s_openapi::api::core::v1::Secret;
        use kube::core::ObjectMeta;

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("system-endpoint".to_string()),
                namespace: Some("ns1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let target = ObjectTarget::from_resource(&secret).unwrap();
        assert_eq!(target.resource().kind, "Secret");
        assert_eq!(target.namespace(), "ns1");
        assert_eq!(target.name(), "system-endpoint");
    }

    #[tokio::test]
    async fn in_memory_get_missing_is_not_found() {
        let store = InMemoryObjectStore::new();
        let target = ObjectTarget::of_kind(ResourceKind::Host, "ns1", "missing");
        let err = store.get(&target).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn in_memory_update_rejects_stale_resource_version() {
        let store = InMemoryObjectStore::new();
        let ar = ResourceKind::Host.api_resource();
        let target = store.insert(&ar, host("ns1", "controller-0")).unwrap();

        let stale = store.get(&target).await.unwrap();
        let fresh = store.get(&target).await.unwrap();
        store.update(&ar, &fresh).await.unwrap();

        let err = store.update(&ar, &stale).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.update_count(), 1);
    }

    #[tokio::test]
    async fn in_memory_list_is_namespace_and_kind_scoped() {
        let store = InMemoryObjectStore::new();
        let host_ar = ResourceKind::Host.api_resource();
        let net_ar = ResourceKind::DataNetwork.api_resource();
        store.insert(&host_ar, host("ns1", "a")).unwrap();
        store.insert(&host_ar, host("ns2", "b")).unwrap();
        store
            .insert(&net_ar, DynamicObject::new("c", &net_ar).within("ns1"))
            .unwrap();

        let hosts = store.list(&host_ar, "ns1").await.unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].metadata.name.as_deref(), Some("a"));
        assert!(hosts[0].types.is_none());
    }
}
