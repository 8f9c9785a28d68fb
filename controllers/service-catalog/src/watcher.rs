//! Kubernetes resource watchers.
//!
//! Each watcher follows one kind through `kube_runtime::watcher` and turns
//! every add, update and delete into its object key on the kind's work
//! queue. No reconcile logic runs here; the dispatcher owns that.

use crate::error::ControllerError;
use crate::store::object_key;
use crate::workqueue::WorkQueue;
use futures::StreamExt;
use kube::{Api, Resource, ResourceExt};
use kube_runtime::watcher::{self, Event};
use kube_runtime::WatchStreamExt;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Watch `api` and enqueue keys until `stop` fires
pub async fn watch_resource<K>(
    api: Api<K>,
    queue: Arc<WorkQueue>,
    resource_name: &'static str,
    mut stop: watch::Receiver<bool>,
) -> Result<(), ControllerError>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    info!("Starting {} watcher", resource_name);
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    let mut stream = std::pin::pin!(stream);

    loop {
        tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => {
                info!("Stopping {} watcher", resource_name);
                return Ok(());
            }
            event = stream.next() => match event {
                Some(Ok(event)) => enqueue_event(&queue, event),
                // The backoff layer reconnects; errors are only reported
                Some(Err(e)) => warn!("{} watch error: {}", resource_name, e),
                None => {
                    return Err(ControllerError::Watch(format!("{resource_name} watch stream ended")));
                }
            }
        }
    }
}

/// Queue the key of the object an event is about
pub(crate) fn enqueue_event<K: Resource>(queue: &WorkQueue, event: Event<K>) {
    match event {
        Event::Apply(obj) | Event::InitApply(obj) | Event::Delete(obj) => {
            let key = object_key(&obj.namespace().unwrap_or_default(), &obj.name_any());
            debug!(queue = %queue.name(), %key, "enqueue");
            queue.add(key);
        }
        Event::Init | Event::InitDone => {}
    }
}
