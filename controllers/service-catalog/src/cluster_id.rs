//! Cluster identifier shared with brokers.
//!
//! The ID is sent as `organization_guid` and as `clusterid` in the request
//! context. It is persisted in a ConfigMap under the key `id`; whichever
//! value lands in the ConfigMap first wins.

use crate::error::ControllerError;
use crate::store::ResourceStore;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// ConfigMap key holding the cluster ID
pub const CLUSTER_ID_KEY: &str = "id";

#[derive(Debug, Default)]
pub struct ClusterIdCache {
    id: Mutex<String>,
}

impl ClusterIdCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, String> {
        self.id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current ID, generating a UUIDv4 on first use
    pub fn get(&self) -> String {
        let mut id = self.lock();
        if id.is_empty() {
            *id = uuid::Uuid::new_v4().to_string();
            debug!(cluster_id = %id, "generated cluster id");
        }
        id.clone()
    }

    pub fn set(&self, value: impl Into<String>) {
        *self.lock() = value.into();
    }

    /// Reconcile the cached ID with the ConfigMap at `namespace/name`.
    ///
    /// A missing ConfigMap is created with the local ID, an ID in the
    /// ConfigMap replaces the local one, and a ConfigMap without an ID gets
    /// the local one added next to its other keys.
    pub async fn sync_with_config_map(
        &self,
        config_maps: &dyn ResourceStore<ConfigMap>,
        namespace: &str,
        name: &str,
    ) -> Result<(), ControllerError> {
        match config_maps.get(namespace, name).await {
            Ok(existing) => {
                let stored = existing
                    .data
                    .as_ref()
                    .and_then(|data| data.get(CLUSTER_ID_KEY))
                    .filter(|id| !id.is_empty())
                    .cloned();
                match stored {
                    Some(id) => {
                        if *self.lock() != id {
                            info!(cluster_id = %id, "adopting cluster id from ConfigMap");
                            self.set(id);
                        }
                    }
                    None => {
                        let mut updated = existing.clone();
                        updated
                            .data
                            .get_or_insert_with(BTreeMap::new)
                            .insert(CLUSTER_ID_KEY.to_string(), self.get());
                        config_maps.update(&updated).await?;
                    }
                }
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                let config_map = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(namespace.to_string()),
                        ..Default::default()
                    },
                    data: Some([(CLUSTER_ID_KEY.to_string(), self.get())].into_iter().collect()),
                    ..Default::default()
                };
                info!(configmap = %format!("{namespace}/{name}"), "creating cluster id ConfigMap");
                config_maps.create(&config_map).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use std::sync::Arc;

    #[test]
    fn test_get_generates_once() {
        let cache = ClusterIdCache::new();
        let first = cache.get();
        assert!(!first.is_empty());
        assert_eq!(cache.get(), first, "ID must be stable once generated");
        cache.set("fixed");
        assert_eq!(cache.get(), "fixed");
    }

    #[test]
    fn test_concurrent_readers_agree() {
        let cache = Arc::new(ClusterIdCache::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.get())
            })
            .collect();
        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_missing_config_map_is_created_with_local_id() {
        let store = InMemoryStore::<ConfigMap>::new();
        let cache = ClusterIdCache::new();
        cache.set("local-id");

        cache.sync_with_config_map(&store, "default", "cluster-info").await.unwrap();
        let created = store.peek("default", "cluster-info").unwrap();
        assert_eq!(created.data.unwrap().get(CLUSTER_ID_KEY).map(String::as_str), Some("local-id"));
    }

    #[tokio::test]
    async fn test_config_map_id_overrides_local() {
        let store = InMemoryStore::<ConfigMap>::new();
        store.seed(ConfigMap {
            metadata: ObjectMeta {
                name: Some("cluster-info".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: Some([(CLUSTER_ID_KEY.to_string(), "stored-id".to_string())].into_iter().collect()),
            ..Default::default()
        });
        let cache = ClusterIdCache::new();
        cache.set("local-id");

        cache.sync_with_config_map(&store, "default", "cluster-info").await.unwrap();
        assert_eq!(cache.get(), "stored-id");
    }

    #[tokio::test]
    async fn test_config_map_without_id_keeps_other_keys() {
        let store = InMemoryStore::<ConfigMap>::new();
        store.seed(ConfigMap {
            metadata: ObjectMeta {
                name: Some("cluster-info".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: Some([("region".to_string(), "eu".to_string())].into_iter().collect()),
            ..Default::default()
        });
        let cache = ClusterIdCache::new();
        cache.set("local-id");

        cache.sync_with_config_map(&store, "default", "cluster-info").await.unwrap();
        let data = store.peek("default", "cluster-info").unwrap().data.unwrap();
        assert_eq!(data.get("region").map(String::as_str), Some("eu"));
        assert_eq!(data.get(CLUSTER_ID_KEY).map(String::as_str), Some("local-id"));
    }
}
