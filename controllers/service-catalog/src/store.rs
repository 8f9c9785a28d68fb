//! Declarative store access.
//!
//! Reconcilers read and write objects through [`ResourceStore`]. In a
//! cluster the store is the Kubernetes API ([`KubeStore`] for namespaced
//! kinds, [`ClusterKubeStore`] for cluster-scoped ones); tests use
//! [`InMemoryStore`], which enforces resourceVersion preconditions,
//! generation bumps on spec changes and finalizer-gated deletion.

use crate::error::ControllerError;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// CRUD access to one kind of object
#[async_trait]
pub trait ResourceStore<K>: Send + Sync {
    /// `namespace` is empty for cluster-scoped kinds
    async fn get(&self, namespace: &str, name: &str) -> Result<K, ControllerError>;

    /// List objects, optionally restricted to a namespace and an equality label selector
    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<K>, ControllerError>;

    async fn create(&self, obj: &K) -> Result<K, ControllerError>;

    /// Replace metadata and spec; conditional on the object's resourceVersion
    async fn update(&self, obj: &K) -> Result<K, ControllerError>;

    /// Replace the status subresource; conditional on the object's resourceVersion
    async fn update_status(&self, obj: &K) -> Result<K, ControllerError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ControllerError>;
}

/// Store key for an object: `namespace/name`, or `name` when cluster-scoped
pub fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

/// Split a store key into `(namespace, name)`
pub fn split_key(key: &str) -> (&str, &str) {
    key.split_once('/').unwrap_or(("", key))
}

fn map_kube_error(e: kube::Error, what: String) -> ControllerError {
    match &e {
        kube::Error::Api(resp) if resp.code == 404 => ControllerError::NotFound(what),
        kube::Error::Api(resp) if resp.code == 409 => ControllerError::Conflict(what),
        _ => ControllerError::Kube(e),
    }
}

fn list_params(label_selector: Option<&str>) -> ListParams {
    match label_selector {
        Some(selector) if !selector.is_empty() => ListParams::default().labels(selector),
        _ => ListParams::default(),
    }
}

fn status_patch<K: Resource + Serialize>(obj: &K) -> Result<Value, ControllerError> {
    let value = serde_json::to_value(obj)?;
    Ok(json!({
        "metadata": { "resourceVersion": obj.meta().resource_version },
        "status": value.get("status").cloned().unwrap_or(Value::Null),
    }))
}

async fn api_get<K>(api: &Api<K>, name: &str) -> Result<K, ControllerError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    api.get(name).await.map_err(|e| map_kube_error(e, name.to_string()))
}

async fn api_create<K>(api: &Api<K>, obj: &K) -> Result<K, ControllerError>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    api.create(&PostParams::default(), obj)
        .await
        .map_err(|e| map_kube_error(e, obj.name_any()))
}

async fn api_update<K>(api: &Api<K>, obj: &K) -> Result<K, ControllerError>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = obj.name_any();
    api.replace(&name, &PostParams::default(), obj)
        .await
        .map_err(|e| map_kube_error(e, name))
}

async fn api_update_status<K>(api: &Api<K>, obj: &K) -> Result<K, ControllerError>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = obj.name_any();
    let patch = status_patch(obj)?;
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| map_kube_error(e, name))
}

async fn api_delete<K>(api: &Api<K>, name: &str) -> Result<(), ControllerError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    api.delete(name, &DeleteParams::default())
        .await
        .map(|_| ())
        .map_err(|e| map_kube_error(e, name.to_string()))
}

/// Store backed by the Kubernetes API for namespaced kinds
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K> std::fmt::Debug for KubeStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, ControllerError> {
        api_get(&self.api(namespace), name).await
    }

    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<K>, ControllerError> {
        let api = match namespace {
            Some(ns) => self.api(ns),
            None => Api::all(self.client.clone()),
        };
        let list = api.list(&list_params(label_selector)).await?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K, ControllerError> {
        api_create(&self.api(&obj.namespace().unwrap_or_default()), obj).await
    }

    async fn update(&self, obj: &K) -> Result<K, ControllerError> {
        api_update(&self.api(&obj.namespace().unwrap_or_default()), obj).await
    }

    async fn update_status(&self, obj: &K) -> Result<K, ControllerError> {
        api_update_status(&self.api(&obj.namespace().unwrap_or_default()), obj).await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        api_delete(&self.api(namespace), name).await
    }
}

/// Store backed by the Kubernetes API for cluster-scoped kinds
pub struct ClusterKubeStore<K> {
    api: Api<K>,
}

impl<K> ClusterKubeStore<K>
where
    K: Resource<Scope = ClusterResourceScope, DynamicType = ()>,
{
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

impl<K> std::fmt::Debug for ClusterKubeStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterKubeStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl<K> ResourceStore<K> for ClusterKubeStore<K>
where
    K: Resource<Scope = ClusterResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, _namespace: &str, name: &str) -> Result<K, ControllerError> {
        api_get(&self.api, name).await
    }

    async fn list(&self, _namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<K>, ControllerError> {
        Ok(self.api.list(&list_params(label_selector)).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K, ControllerError> {
        api_create(&self.api, obj).await
    }

    async fn update(&self, obj: &K) -> Result<K, ControllerError> {
        api_update(&self.api, obj).await
    }

    async fn update_status(&self, obj: &K) -> Result<K, ControllerError> {
        api_update_status(&self.api, obj).await
    }

    async fn delete(&self, _namespace: &str, name: &str) -> Result<(), ControllerError> {
        api_delete(&self.api, name).await
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Objects {
    items: BTreeMap<String, Value>,
    resource_version: u64,
}

/// Store keeping objects as JSON documents in memory
///
/// Mirrors the API server rules the reconcilers depend on:
/// - writes carrying a stale `resourceVersion` fail with `Conflict`;
/// - `update` ignores status and bumps `generation` when anything outside
///   metadata/status changed;
/// - `update_status` only replaces status;
/// - `delete` of an object with finalizers only stamps `deletionTimestamp`,
///   and the object disappears once an update removes the last finalizer.
pub struct InMemoryStore<K> {
    objects: Arc<Mutex<Objects>>,
    writes: Arc<AtomicUsize>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for InMemoryStore<K> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
            writes: Arc::clone(&self.writes),
            _kind: PhantomData,
        }
    }
}

impl<K> Default for InMemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: Arc::new(Mutex::new(Objects::default())),
            writes: Arc::new(AtomicUsize::new(0)),
            _kind: PhantomData,
        }
    }
}

impl<K> std::fmt::Debug for InMemoryStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("writes", &self.writes.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn meta_str<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get("metadata").and_then(|m| m.get(field)).and_then(Value::as_str)
}

fn spec_view(value: &Value) -> BTreeMap<String, Value> {
    value
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter(|(k, _)| !matches!(k.as_str(), "metadata" | "status" | "apiVersion" | "kind"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

fn has_finalizers(value: &Value) -> bool {
    value
        .get("metadata")
        .and_then(|m| m.get("finalizers"))
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty())
}

fn matches_selector(value: &Value, selector: &str) -> bool {
    let labels = value.get("metadata").and_then(|m| m.get("labels"));
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels
                .and_then(|l| l.get(k.trim()))
                .and_then(Value::as_str)
                .is_some_and(|actual| actual == v.trim()),
            None => labels.and_then(|l| l.get(term)).is_some(),
        })
}

fn set_meta(value: &mut Value, field: &str, new: Value) {
    if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.insert(field.to_string(), new);
    }
}

impl<K> InMemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, Objects> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key_of(obj: &K) -> String {
        object_key(&obj.namespace().unwrap_or_default(), &obj.name_any())
    }

    fn decode(value: &Value) -> Result<K, ControllerError> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Insert an object as-is (keeping its status), for test setup
    pub fn seed(&self, obj: K) -> K {
        let mut objects = self.objects();
        objects.resource_version += 1;
        let mut value = serde_json::to_value(&obj).unwrap_or(Value::Null);
        set_meta(&mut value, "resourceVersion", json!(objects.resource_version.to_string()));
        if meta_str(&value, "uid").is_none() {
            set_meta(&mut value, "uid", json!(uuid::Uuid::new_v4().to_string()));
        }
        if value.get("metadata").and_then(|m| m.get("generation")).is_none_or(Value::is_null) {
            set_meta(&mut value, "generation", json!(1));
        }
        let decoded = serde_json::from_value(value.clone()).unwrap_or(obj);
        objects.items.insert(Self::key_of(&decoded), value);
        decoded
    }

    /// Current copy of an object, if present
    pub fn peek(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects()
            .items
            .get(&object_key(namespace, name))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn all(&self) -> Vec<K> {
        self.objects()
            .items
            .values()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect()
    }

    /// Number of successful writes (create, update, update_status, delete)
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_version(stored: &Value, incoming: &Value, key: &str) -> Result<(), ControllerError> {
        match meta_str(incoming, "resourceVersion") {
            Some(rv) if Some(rv) != meta_str(stored, "resourceVersion") => Err(ControllerError::Conflict(format!(
                "{key}: the object has been modified; please apply your changes to the latest version and try again"
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl<K> ResourceStore<K> for InMemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, ControllerError> {
        let key = object_key(namespace, name);
        match self.objects().items.get(&key) {
            Some(value) => Self::decode(value),
            None => Err(ControllerError::NotFound(key)),
        }
    }

    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<K>, ControllerError> {
        let objects = self.objects();
        objects
            .items
            .values()
            .filter(|v| namespace.is_none_or(|ns| meta_str(v, "namespace").unwrap_or("") == ns))
            .filter(|v| label_selector.is_none_or(|sel| matches_selector(v, sel)))
            .map(Self::decode)
            .collect()
    }

    async fn create(&self, obj: &K) -> Result<K, ControllerError> {
        let key = Self::key_of(obj);
        let mut objects = self.objects();
        if objects.items.contains_key(&key) {
            return Err(ControllerError::Conflict(format!("{key} already exists")));
        }
        objects.resource_version += 1;
        let mut value = serde_json::to_value(obj)?;
        set_meta(&mut value, "resourceVersion", json!(objects.resource_version.to_string()));
        set_meta(&mut value, "generation", json!(1));
        set_meta(&mut value, "uid", json!(uuid::Uuid::new_v4().to_string()));
        set_meta(&mut value, "creationTimestamp", json!(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)));
        let created = Self::decode(&value)?;
        objects.items.insert(key, value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K, ControllerError> {
        let key = Self::key_of(obj);
        let mut objects = self.objects();
        let stored = objects
            .items
            .get(&key)
            .cloned()
            .ok_or_else(|| ControllerError::NotFound(key.clone()))?;
        let mut value = serde_json::to_value(obj)?;
        Self::check_version(&stored, &value, &key)?;

        // Status is owned by update_status; deletion stamps by the server
        match stored.get("status") {
            Some(status) => {
                if let Some(map) = value.as_object_mut() {
                    map.insert("status".to_string(), status.clone());
                }
            }
            None => {
                if let Some(map) = value.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        let generation = stored
            .get("metadata")
            .and_then(|m| m.get("generation"))
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let generation = if spec_view(&stored) == spec_view(&value) {
            generation
        } else {
            generation + 1
        };
        set_meta(&mut value, "generation", json!(generation));
        if let Some(ts) = stored.get("metadata").and_then(|m| m.get("deletionTimestamp")) {
            set_meta(&mut value, "deletionTimestamp", ts.clone());
        }
        objects.resource_version += 1;
        set_meta(&mut value, "resourceVersion", json!(objects.resource_version.to_string()));
        let updated = Self::decode(&value)?;

        let deleting = meta_str(&value, "deletionTimestamp").is_some();
        if deleting && !has_finalizers(&value) {
            objects.items.remove(&key);
        } else {
            objects.items.insert(key, value);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn update_status(&self, obj: &K) -> Result<K, ControllerError> {
        let key = Self::key_of(obj);
        let mut objects = self.objects();
        let mut stored = objects
            .items
            .get(&key)
            .cloned()
            .ok_or_else(|| ControllerError::NotFound(key.clone()))?;
        let incoming = serde_json::to_value(obj)?;
        Self::check_version(&stored, &incoming, &key)?;

        if let Some(map) = stored.as_object_mut() {
            match incoming.get("status") {
                Some(status) => map.insert("status".to_string(), status.clone()),
                None => map.remove("status"),
            };
        }
        objects.resource_version += 1;
        set_meta(&mut stored, "resourceVersion", json!(objects.resource_version.to_string()));
        let updated = Self::decode(&stored)?;
        objects.items.insert(key, stored);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        let key = object_key(namespace, name);
        let mut objects = self.objects();
        let mut stored = objects
            .items
            .get(&key)
            .cloned()
            .ok_or_else(|| ControllerError::NotFound(key.clone()))?;
        if has_finalizers(&stored) {
            if meta_str(&stored, "deletionTimestamp").is_none() {
                set_meta(&mut stored, "deletionTimestamp", json!(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)));
                objects.resource_version += 1;
                set_meta(&mut stored, "resourceVersion", json!(objects.resource_version.to_string()));
                objects.items.insert(key, stored);
            }
        } else {
            objects.items.remove(&key);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
