//! Kubernetes object access
//!
//! Controllers talk to the API server through [`ObjectStore`], which works on
//! `DynamicObject`s so a single trait object can serve every kind and be
//! mocked in tests. The free functions at the bottom convert to and from the
//! typed resources.

use async_trait::async_trait;
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams,
};
use kube::discovery::ApiResource;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use caph_common::{Error, Result, FIELD_MANAGER};

/// A JSON merge patch split into the parts the API serves separately
///
/// `metadata` and `spec` go to the main resource, `status` to the status
/// subresource. With `resource_version` set the patch only applies if the
/// object was not modified since it was read.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectPatch {
    /// Patch of `metadata`
    pub metadata: Option<Value>,
    /// Patch of `spec`
    pub spec: Option<Value>,
    /// Patch of `status`
    pub status: Option<Value>,
    /// Optimistic concurrency precondition
    pub resource_version: Option<String>,
}

impl ObjectPatch {
    /// Whether the patch changes nothing
    pub fn is_empty(&self) -> bool {
        self.metadata.is_none() && self.spec.is_none() && self.status.is_none()
    }
}

/// Trait abstracting Kubernetes object operations
///
/// An empty namespace addresses cluster-scoped resources.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get an object; `None` if it does not exist
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// List objects, optionally filtered by a label selector
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: Option<String>,
    ) -> Result<Vec<DynamicObject>>;

    /// Apply a merge patch; the status part is written first
    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &ObjectPatch,
    ) -> Result<()>;

    /// Delete an object; deleting a missing object succeeds
    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()>;

    /// Server-side apply a full object
    async fn apply(&self, resource: &ApiResource, namespace: &str, object: &DynamicObject)
        -> Result<()>;
}

/// Production implementation backed by a kube `Client`
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    /// Create a store wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, resource)
        }
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.api(resource, namespace).get_opt(name).await?)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: Option<String>,
    ) -> Result<Vec<DynamicObject>> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector.as_deref() {
            params = params.labels(selector);
        }
        Ok(self.api(resource, namespace).list(&params).await?.items)
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &ObjectPatch,
    ) -> Result<()> {
        let api = self.api(resource, namespace);
        let params = PatchParams::default();

        if let Some(status) = &patch.status {
            let mut body = serde_json::json!({ "status": status });
            if let Some(rv) = &patch.resource_version {
                body["metadata"] = serde_json::json!({ "resourceVersion": rv });
            }
            api.patch_status(name, &params, &Patch::Merge(&body)).await?;
        }

        if patch.metadata.is_some() || patch.spec.is_some() {
            let mut metadata = patch.metadata.clone().unwrap_or_else(|| Value::Object(Map::new()));
            // A precondition already consumed by the status write would
            // now be stale.
            if patch.status.is_none() {
                if let (Some(rv), Some(map)) = (&patch.resource_version, metadata.as_object_mut()) {
                    map.insert("resourceVersion".to_string(), Value::String(rv.clone()));
                }
            }
            let mut body = serde_json::json!({ "metadata": metadata });
            if let Some(spec) = &patch.spec {
                body["spec"] = spec.clone();
            }
            api.patch(name, &params, &Patch::Merge(&body)).await?;
        }

        debug!(kind = %resource.kind, namespace, name, "patched object");
        Ok(())
    }

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        match self
            .api(resource, namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<()> {
        let name = object
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation_for(&resource.kind, "object has no name"))?;
        self.api(resource, namespace)
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(object),
            )
            .await?;
        Ok(())
    }
}

/// `ApiResource` of a statically typed kind
pub fn resource_of<K: Resource<DynamicType = ()>>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

/// Convert a dynamic object into a typed one
pub fn from_dynamic<K: Resource<DynamicType = ()> + DeserializeOwned>(
    object: DynamicObject,
) -> Result<K> {
    let value = serde_json::to_value(object)?;
    serde_json::from_value(value).map_err(|e| Error::serialization_for(K::kind(&()), e.to_string()))
}

/// Convert a typed object into a dynamic one
pub fn to_dynamic<K: Resource<DynamicType = ()> + Serialize>(object: &K) -> Result<DynamicObject> {
    let value = serde_json::to_value(object)?;
    serde_json::from_value(value).map_err(|e| Error::serialization_for(K::kind(&()), e.to_string()))
}

/// Get a typed object
pub async fn get<K>(store: &dyn ObjectStore, namespace: &str, name: &str) -> Result<Option<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    store
        .get(&resource_of::<K>(), namespace, name)
        .await?
        .map(from_dynamic)
        .transpose()
}

/// List typed objects
pub async fn list<K>(
    store: &dyn ObjectStore,
    namespace: &str,
    label_selector: Option<String>,
) -> Result<Vec<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    store
        .list(&resource_of::<K>(), namespace, label_selector)
        .await?
        .into_iter()
        .map(from_dynamic)
        .collect()
}

/// Compute the JSON merge patch turning `old` into `new`
///
/// Removed keys become `null`, arrays and scalars are replaced whole.
/// Returns `None` when the values are equal.
pub fn merge_diff(old: &Value, new: &Value) -> Option<Value> {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, new_value) in new {
                match old.get(key) {
                    Some(old_value) => {
                        if let Some(diff) = merge_diff(old_value, new_value) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }
            for key in old.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        _ if old == new => None,
        _ => Some(new.clone()),
    }
}

/// In-memory [`ObjectStore`] for tests that need state across calls
#[cfg(test)]
pub(crate) mod fake {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    type Key = (String, String, String);

    /// Stores objects as JSON and applies merge patches like the API server
    #[derive(Default)]
    pub struct FakeStore {
        objects: Mutex<BTreeMap<Key, Value>>,
        version: AtomicUsize,
        /// Number of successful patch calls
        pub patches: AtomicUsize,
    }

    fn key(resource: &ApiResource, namespace: &str, name: &str) -> Key {
        (resource.kind.clone(), namespace.to_string(), name.to_string())
    }

    /// RFC 7386 merge of `patch` into `target`
    pub fn merge(target: &mut Value, patch: &Value) {
        match (target.as_object_mut(), patch.as_object()) {
            (Some(target), Some(patch)) => {
                for (k, v) in patch {
                    if v.is_null() {
                        target.remove(k);
                    } else {
                        merge(target.entry(k.clone()).or_insert(Value::Null), v);
                    }
                }
            }
            (_, Some(_)) => {
                *target = Value::Object(Map::new());
                merge(target, patch);
            }
            _ => *target = patch.clone(),
        }
    }

    fn matches(labels: Option<&Value>, selector: &str) -> bool {
        selector.split(',').filter(|s| !s.is_empty()).all(|term| {
            let (k, v) = match term.split_once("==").or_else(|| term.split_once('=')) {
                Some((k, v)) => (k, Some(v)),
                None => (term, None),
            };
            match (labels.and_then(|l| l.get(k)), v) {
                (Some(found), Some(v)) => found.as_str() == Some(v),
                (Some(_), None) => true,
                (None, _) => false,
            }
        })
    }

    fn conflict() -> Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        })
        .into()
    }

    impl FakeStore {
        /// Empty store
        pub fn new() -> Self {
            Self::default()
        }

        fn next_version(&self) -> String {
            (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
        }

        /// Insert or replace a typed object
        pub fn insert<K: Resource<DynamicType = ()> + Serialize>(&self, object: &K) {
            let mut value = serde_json::to_value(object).expect("serializable");
            value["metadata"]["resourceVersion"] = Value::String(self.next_version());
            let meta = object.meta();
            let key = (
                K::kind(&()).to_string(),
                meta.namespace.clone().unwrap_or_default(),
                meta.name.clone().unwrap_or_default(),
            );
            self.objects.lock().unwrap().insert(key, value);
        }

        /// Read back a typed object
        pub fn read<K: Resource<DynamicType = ()> + DeserializeOwned>(
            &self,
            namespace: &str,
            name: &str,
        ) -> Option<K> {
            let key = (K::kind(&()).to_string(), namespace.to_string(), name.to_string());
            let value = self.objects.lock().unwrap().get(&key).cloned()?;
            Some(serde_json::from_value(value).expect("decodes"))
        }

        /// Number of patch calls so far
        pub fn patch_count(&self) -> usize {
            self.patches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ObjectStore for FakeStore {
        async fn get(
            &self,
            resource: &ApiResource,
            namespace: &str,
            name: &str,
        ) -> Result<Option<DynamicObject>> {
            let value = self
                .objects
                .lock()
                .unwrap()
                .get(&key(resource, namespace, name))
                .cloned();
            Ok(value.map(serde_json::from_value).transpose()?)
        }

        async fn list(
            &self,
            resource: &ApiResource,
            namespace: &str,
            label_selector: Option<String>,
        ) -> Result<Vec<DynamicObject>> {
            let selector = label_selector.unwrap_or_default();
            let objects = self.objects.lock().unwrap();
            objects
                .iter()
                .filter(|((kind, ns, _), _)| {
                    *kind == resource.kind && (namespace.is_empty() || ns == namespace)
                })
                .filter(|(_, v)| matches(v.pointer("/metadata/labels"), &selector))
                .map(|(_, v)| serde_json::from_value(v.clone()).map_err(Error::from))
                .collect()
        }

        async fn patch(
            &self,
            resource: &ApiResource,
            namespace: &str,
            name: &str,
            patch: &ObjectPatch,
        ) -> Result<()> {
            let mut objects = self.objects.lock().unwrap();
            let stored = objects
                .get_mut(&key(resource, namespace, name))
                .ok_or_else(|| Error::not_found(resource.kind.clone(), name))?;
            if let Some(rv) = &patch.resource_version {
                if stored.pointer("/metadata/resourceVersion").and_then(Value::as_str) != Some(rv) {
                    return Err(conflict());
                }
            }
            let mut body = Map::new();
            for (part, value) in [
                ("metadata", &patch.metadata),
                ("spec", &patch.spec),
                ("status", &patch.status),
            ] {
                if let Some(value) = value {
                    body.insert(part.to_string(), value.clone());
                }
            }
            merge(stored, &Value::Object(body));
            stored["metadata"]["resourceVersion"] = Value::String(self.next_version());

            // Objects marked for deletion vanish once their last finalizer is gone.
            let deleting = stored.pointer("/metadata/deletionTimestamp").is_some();
            let finalized = stored
                .pointer("/metadata/finalizers")
                .and_then(Value::as_array)
                .is_none_or(|f| f.is_empty());
            if deleting && finalized {
                objects.remove(&key(resource, namespace, name));
            }
            self.patches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<()> {
            self.objects
                .lock()
                .unwrap()
                .remove(&key(resource, namespace, name));
            Ok(())
        }

        async fn apply(
            &self,
            resource: &ApiResource,
            namespace: &str,
            object: &DynamicObject,
        ) -> Result<()> {
            let name = object.metadata.name.clone().unwrap_or_default();
            let mut value = serde_json::to_value(object)?;
            value["metadata"]["resourceVersion"] = Value::String(self.next_version());
            self.objects
                .lock()
                .unwrap()
                .insert(key(resource, namespace, &name), value);
            Ok(())
        }
    }
}
