//! Main controller implementation.
//!
//! `Controller` wires the Kubernetes-backed stores, the broker client
//! factory, the event recorder and the metrics registry into a
//! [`Reconciler`], then runs one watcher per kind, the worker pools, the
//! cluster-ID refresher and the metrics endpoint until told to stop.

use crate::clock::{Clock, SystemClock};
use crate::config::ControllerConfig;
use crate::dispatcher::{Dispatcher, Queues};
use crate::error::ControllerError;
use crate::metrics::{self, Metrics};
use crate::reconciler::{Kind, Reconciler, Stores};
use crate::recorder::{EventRecorder, KubeEventRecorder};
use crate::store::{ClusterKubeStore, KubeStore};
use crate::watcher::watch_resource;
use catalog_crds::{ServiceBinding, ServiceBroker, ServiceClass, ServiceInstance, ServicePlan};
use kube::{Api, Client, Resource};
use osb_client::{ClientConfiguration, CreateClientFn, OsbClient, OsbClientTrait};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

/// How often the cluster ID is re-read from its ConfigMap
const CLUSTER_ID_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Broker clients backed by HTTP
pub fn http_client_factory() -> CreateClientFn {
    Arc::new(|config: ClientConfiguration| {
        let client: Arc<dyn OsbClientTrait> = Arc::new(OsbClient::new(config)?);
        Ok(client)
    })
}

/// Service catalog controller.
pub struct Controller {
    client: Client,
    config: ControllerConfig,
    reconciler: Arc<Reconciler>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
}

impl Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a new controller talking to the cluster through `client`.
    pub fn new(client: Client, config: ControllerConfig) -> Result<Self, ControllerError> {
        let recorder = Arc::new(KubeEventRecorder::new(client.clone()));
        Self::with_parts(client, config, http_client_factory(), recorder, Arc::new(SystemClock))
    }

    /// Creates a controller with a custom broker client factory, event
    /// recorder and clock.
    pub fn with_parts(
        client: Client,
        config: ControllerConfig,
        create_client: CreateClientFn,
        recorder: Arc<dyn EventRecorder>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ControllerError> {
        info!("Initializing service catalog controller");

        let stores = Stores {
            brokers: Arc::new(KubeStore::<ServiceBroker>::new(client.clone())),
            classes: Arc::new(KubeStore::<ServiceClass>::new(client.clone())),
            plans: Arc::new(KubeStore::<ServicePlan>::new(client.clone())),
            instances: Arc::new(KubeStore::<ServiceInstance>::new(client.clone())),
            bindings: Arc::new(KubeStore::<ServiceBinding>::new(client.clone())),
            secrets: Arc::new(KubeStore::new(client.clone())),
            config_maps: Arc::new(KubeStore::new(client.clone())),
            namespaces: Arc::new(ClusterKubeStore::new(client.clone())),
        };

        let metrics = Arc::new(Metrics::new()?);
        let queues = Arc::new(Queues::new());
        let reconciler = Arc::new(Reconciler::new(
            stores,
            create_client,
            recorder,
            clock,
            config.clone(),
            Arc::clone(&metrics),
            Arc::clone(&queues.binding),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&reconciler),
            queues,
            Arc::clone(&metrics),
            config.concurrent_syncs,
        ));

        Ok(Self {
            client,
            config,
            reconciler,
            dispatcher,
            metrics,
        })
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
    {
        match &self.config.watch_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn spawn_watcher<K>(&self, kind: Kind, stop: &watch::Receiver<bool>) -> JoinHandle<Result<(), ControllerError>>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + 'static,
    {
        let queue = Arc::clone(self.dispatcher.queues().for_kind(kind));
        tokio::spawn(watch_resource(self.api::<K>(), queue, kind.as_str(), stop.clone()))
    }

    /// Runs the controller until `stop` turns true.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> Result<(), ControllerError> {
        info!("Starting service catalog controller");

        if let Err(e) = self.reconciler.sync_cluster_id().await {
            warn!("Initial cluster ID sync failed: {}", e);
        }

        let watchers = vec![
            self.spawn_watcher::<ServiceBroker>(Kind::Broker, &stop),
            self.spawn_watcher::<ServiceClass>(Kind::Class, &stop),
            self.spawn_watcher::<ServicePlan>(Kind::Plan, &stop),
            self.spawn_watcher::<ServiceInstance>(Kind::Instance, &stop),
            self.spawn_watcher::<ServiceBinding>(Kind::Binding, &stop),
        ];

        let mut workers = JoinSet::new();
        self.dispatcher.spawn(&mut workers);

        let cluster_id_sync = {
            let reconciler = Arc::clone(&self.reconciler);
            let mut stop = stop.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(CLUSTER_ID_SYNC_INTERVAL);
                interval.tick().await;
                loop {
                    tokio::select! {
                        () = async { let _ = stop.wait_for(|stopped| *stopped).await; } => break,
                        _ = interval.tick() => {
                            if let Err(e) = reconciler.sync_cluster_id().await {
                                warn!("Cluster ID sync failed: {}", e);
                            }
                        }
                    }
                }
            })
        };

        let metrics_server = tokio::spawn(metrics::serve(
            self.config.metrics_addr,
            Arc::clone(&self.metrics),
            stop.clone(),
        ));

        info!("All watchers and workers started");
        // A dropped sender also means shutdown
        let _ = stop.wait_for(|stopped| *stopped).await;
        info!("Shutting down service catalog controller");

        self.dispatcher.queues().shut_down();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
            }
        }
        for watcher in watchers {
            match watcher.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Watcher failed: {}", e),
                Err(e) => error!("Watcher task failed: {}", e),
            }
        }
        if let Err(e) = cluster_id_sync.await {
            error!("Cluster ID sync task failed: {}", e);
        }
        match metrics_server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Metrics server failed: {}", e),
            Err(e) => error!("Metrics server task failed: {}", e),
        }

        info!("Service catalog controller stopped");
        Ok(())
    }
}
