//! Reconciliation logic for service catalog resources.
//!
//! One `Reconciler` carries every collaborator; the per-kind logic lives in
//! submodules as further `impl Reconciler` blocks:
//! - `broker`: catalog sync into classes and plans, broker deletion
//! - `class`, `plan`: garbage collection of entries removed from a catalog
//! - `instance`: provision, update, deprovision, last-operation polling
//! - `binding`: bind, unbind, credential secret injection, polling

pub mod binding;
pub mod broker;
pub mod class;
pub mod instance;
pub mod plan;

#[cfg(test)]
mod instance_test;
#[cfg(test)]
mod binding_test;

use crate::broker_client_manager::BrokerClientManager;
use crate::clock::Clock;
use crate::cluster_id::ClusterIdCache;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::recorder::{EventRecorder, EventType};
use crate::store::{ResourceStore, object_key, split_key};
use crate::workqueue::WorkQueue;
use catalog_crds::{ServiceBinding, ServiceBroker, ServiceClass, ServiceInstance, ServicePlan, UserInfo};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::{Resource, ResourceExt};
use osb_client::{CreateClientFn, JsonMap, OriginatingIdentity, OsbClientTrait, OsbError};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Platform name sent in request contexts and originating identities
pub const PLATFORM_KUBERNETES: &str = "kubernetes";

/// Poll delay used when the broker does not suggest one
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_secs(5);

/// Operation retried past the reconciliation retry window
pub const REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT: &str = "ErrorReconciliationRetryTimeout";
/// Message prefix paired with the retry timeout reason
pub const MESSAGE_RECONCILIATION_RETRY_TIMEOUT: &str = "Stopping reconciliation retries because too much time has elapsed";
/// Parameters could not be built from the spec or its secrets
pub const REASON_ERROR_WITH_PARAMETERS: &str = "ErrorWithParameters";
/// The requesting user could not be encoded for the broker
pub const REASON_ERROR_WITH_ORIGINATING_IDENTITY: &str = "ErrorWithOriginatingIdentity";
/// The namespace of the object could not be read
pub const REASON_ERROR_FINDING_NAMESPACE: &str = "ErrorFindingNamespaceForInstance";
/// The referenced broker does not exist
pub const REASON_NONEXISTENT_BROKER: &str = "ReferencesNonexistentBroker";
/// The referenced class does not exist
pub const REASON_NONEXISTENT_SERVICE_CLASS: &str = "ReferencesNonexistentServiceClass";
/// The referenced plan does not exist
pub const REASON_NONEXISTENT_SERVICE_PLAN: &str = "ReferencesNonexistentServicePlan";
/// The referenced instance does not exist
pub const REASON_NONEXISTENT_INSTANCE: &str = "ReferencesNonexistentInstance";
/// A last-operation poll failed
pub const REASON_ERROR_POLLING_LAST_OPERATION: &str = "ErrorPollingLastOperation";
/// Another asynchronous operation is still running on the instance
pub const REASON_ASYNC_OPERATION_IN_PROGRESS: &str = "ErrorAsyncOperationInProgress";
/// Orphan mitigation outcomes
pub const REASON_ORPHAN_MITIGATION_SUCCESSFUL: &str = "OrphanMitigationSuccessful";
pub const REASON_ORPHAN_MITIGATION_FAILED: &str = "OrphanMitigationFailed";

/// Description used when the broker gave none
pub(crate) const NO_DESCRIPTION: &str = "(no description provided)";

/// Reconciled resource kinds, one work queue each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// `ServiceBroker`
    Broker,
    /// `ServiceClass`
    Class,
    /// `ServicePlan`
    Plan,
    /// `ServiceInstance`
    Instance,
    /// `ServiceBinding`
    Binding,
}

impl Kind {
    /// Every kind, in the order workers are started
    pub const ALL: [Kind; 5] = [Kind::Broker, Kind::Class, Kind::Plan, Kind::Instance, Kind::Binding];

    /// Resource kind name, used in logs and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Broker => "ServiceBroker",
            Kind::Class => "ServiceClass",
            Kind::Plan => "ServicePlan",
            Kind::Instance => "ServiceInstance",
            Kind::Binding => "ServiceBinding",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the dispatcher should do with a key after a successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Converged; forget the key
    Done,
    /// A write was made that the next pass builds on
    RequeueNow,
    /// Come back later, e.g. for the broker relist timer
    RequeueAfter(Duration),
    /// An asynchronous broker operation is outstanding; poll after the delay
    Poll(Duration),
}

/// Store access for every kind the reconcilers read or write
#[derive(Clone)]
pub struct Stores {
    /// Catalog kinds the broker reconciler writes
    pub brokers: Arc<dyn ResourceStore<ServiceBroker>>,
    pub classes: Arc<dyn ResourceStore<ServiceClass>>,
    pub plans: Arc<dyn ResourceStore<ServicePlan>>,
    pub instances: Arc<dyn ResourceStore<ServiceInstance>>,
    pub bindings: Arc<dyn ResourceStore<ServiceBinding>>,
    /// Parameter sources and injected credentials
    pub secrets: Arc<dyn ResourceStore<Secret>>,
    /// Holds the cluster ID
    pub config_maps: Arc<dyn ResourceStore<ConfigMap>>,
    /// Cluster-scoped; looked up with an empty namespace
    pub namespaces: Arc<dyn ResourceStore<Namespace>>,
}

impl fmt::Debug for Stores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

/// Reconciles service catalog resources.
pub struct Reconciler {
    pub(crate) stores: Stores,
    pub(crate) client_manager: BrokerClientManager,
    pub(crate) recorder: Arc<dyn EventRecorder>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: ControllerConfig,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) cluster_id: Arc<ClusterIdCache>,
    /// Bindings waiting on an instance are pushed here once it becomes ready
    pub(crate) binding_queue: Arc<WorkQueue>,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("client_manager", &self.client_manager)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler over `stores`.
    ///
    /// Broker clients are built on demand through `create_client`; bindings
    /// blocked on an instance are requeued onto `binding_queue`.
    pub fn new(
        stores: Stores,
        create_client: CreateClientFn,
        recorder: Arc<dyn EventRecorder>,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
        metrics: Arc<Metrics>,
        binding_queue: Arc<WorkQueue>,
    ) -> Self {
        Self {
            stores,
            client_manager: BrokerClientManager::new(create_client),
            recorder,
            clock,
            config,
            metrics,
            cluster_id: Arc::new(ClusterIdCache::new()),
            binding_queue,
        }
    }

    /// Cluster ID sent to brokers in request contexts
    pub fn cluster_id(&self) -> &Arc<ClusterIdCache> {
        &self.cluster_id
    }

    /// Settings this reconciler runs with
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Refresh the cluster ID from its ConfigMap
    pub async fn sync_cluster_id(&self) -> Result<(), ControllerError> {
        self.cluster_id
            .sync_with_config_map(
                self.stores.config_maps.as_ref(),
                &self.config.cluster_id_config_map_namespace,
                &self.config.cluster_id_config_map_name,
            )
            .await
    }

    /// Run one reconciliation pass for the object at `key`
    pub async fn reconcile_key(&self, kind: Kind, key: &str) -> Result<Outcome, ControllerError> {
        let (namespace, name) = split_key(key);
        debug!(kind = %kind, key, "processing");
        match kind {
            Kind::Broker => match fetch(self.stores.brokers.as_ref(), namespace, name).await {
                Ok(Some(broker)) => self.reconcile_broker(&broker).await,
                Ok(None) => {
                    debug!(key, "broker deleted; dropping its client");
                    self.client_manager.remove_broker_client(key);
                    self.metrics.remove_broker(key);
                    Ok(Outcome::Done)
                }
                Err(e) => Err(e),
            },
            Kind::Class => match fetch(self.stores.classes.as_ref(), namespace, name).await {
                Ok(Some(class)) => self.reconcile_service_class(&class).await,
                Ok(None) => Ok(Outcome::Done),
                Err(e) => Err(e),
            },
            Kind::Plan => match fetch(self.stores.plans.as_ref(), namespace, name).await {
                Ok(Some(plan)) => self.reconcile_service_plan(&plan).await,
                Ok(None) => Ok(Outcome::Done),
                Err(e) => Err(e),
            },
            Kind::Instance => match fetch(self.stores.instances.as_ref(), namespace, name).await {
                Ok(Some(instance)) => self.reconcile_instance(&instance).await,
                Ok(None) => Ok(Outcome::Done),
                Err(e) => Err(e),
            },
            Kind::Binding => match fetch(self.stores.bindings.as_ref(), namespace, name).await {
                Ok(Some(binding)) => self.reconcile_binding(&binding).await,
                Ok(None) => Ok(Outcome::Done),
                Err(e) => Err(e),
            },
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn retry_window_elapsed(&self, start: Option<DateTime<Utc>>) -> bool {
        crate::reconcile_helpers::retry_window_elapsed(start, self.now(), self.config.reconciliation_retry_duration)
    }

    pub(crate) async fn event<K>(&self, obj: &K, event_type: EventType, reason: &str, message: &str)
    where
        K: Resource<DynamicType = ()>,
    {
        self.recorder.record(&obj.object_ref(&()), event_type, reason, message).await;
    }

    /// Platform context sent with instance and binding requests
    pub(crate) fn request_context(&self, namespace: &str, instance_name: &str) -> Option<JsonMap> {
        if !self.config.osb_api_context_profile {
            return None;
        }
        let mut context = JsonMap::new();
        context.insert("platform".to_string(), Value::from(PLATFORM_KUBERNETES));
        context.insert("namespace".to_string(), Value::from(namespace));
        context.insert("clusterid".to_string(), Value::from(self.cluster_id.get()));
        context.insert("instance_name".to_string(), Value::from(instance_name));
        Some(context)
    }

    /// Identity of the user who last changed the spec, when enabled
    pub(crate) fn originating_identity(
        &self,
        user_info: Option<&UserInfo>,
    ) -> Result<Option<OriginatingIdentity>, ControllerError> {
        if !self.config.originating_identity {
            return Ok(None);
        }
        let Some(user_info) = user_info else {
            return Ok(None);
        };
        let value = serde_json::to_string(user_info).map_err(|e| {
            ControllerError::operation(
                REASON_ERROR_WITH_ORIGINATING_IDENTITY,
                format!("Error building originating identity headers: {e}"),
            )
        })?;
        Ok(Some(OriginatingIdentity {
            platform: PLATFORM_KUBERNETES.to_string(),
            value,
        }))
    }

    /// UID of `namespace`, used as the broker-side space and app GUID
    pub(crate) async fn namespace_uid(&self, namespace: &str) -> Result<String, ControllerError> {
        let ns = self.stores.namespaces.get("", namespace).await.map_err(|e| {
            ControllerError::operation(
                REASON_ERROR_FINDING_NAMESPACE,
                format!("Failed to get namespace {namespace:?}: {e}"),
            )
        })?;
        Ok(ns.uid().unwrap_or_default())
    }

    /// Client for the broker `namespace/broker_name`, refreshing credentials
    pub(crate) async fn broker_client_for(
        &self,
        namespace: &str,
        broker_name: &str,
    ) -> Result<Arc<dyn OsbClientTrait>, ControllerError> {
        let broker = self.stores.brokers.get(namespace, broker_name).await.map_err(|e| {
            if e.is_not_found() {
                ControllerError::operation(
                    REASON_NONEXISTENT_BROKER,
                    format!("References a non-existent ServiceBroker {broker_name:?}"),
                )
            } else {
                e
            }
        })?;
        self.broker_client(&broker).await
    }

    pub(crate) async fn broker_client(&self, broker: &ServiceBroker) -> Result<Arc<dyn OsbClientTrait>, ControllerError> {
        let config = crate::broker_client_manager::client_configuration(
            broker,
            self.stores.secrets.as_ref(),
            self.config.osb_api_request_timeout,
        )
        .await?;
        let key = object_key(&broker.namespace().unwrap_or_default(), &broker.name_any());
        self.client_manager.update_broker_client(&key, config).map_err(|e| {
            warn!(broker = %key, error = %e, "failed to build broker client");
            ControllerError::operation(
                crate::broker_client_manager::REASON_ERROR_GETTING_AUTH_CREDENTIALS,
                format!("Error creating client for broker {:?}: {e}", broker.name_any()),
            )
        })
    }

    /// Count a broker call against the broker it went to
    pub(crate) fn observe<T>(&self, client: &dyn OsbClientTrait, method: &str, result: &Result<T, OsbError>) {
        self.metrics.record_osb_request(&client.configuration().name, method, result);
    }
}

/// `Ok(None)` for a missing object
pub(crate) async fn fetch<K>(
    store: &dyn ResourceStore<K>,
    namespace: &str,
    name: &str,
) -> Result<Option<K>, ControllerError> {
    match store.get(namespace, name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Responses that may hide a resource created on the broker side.
///
/// Success codes other than 200, request timeouts and server errors all
/// leave it unknown whether the broker acted on the request.
pub fn should_start_orphan_mitigation(status_code: u16) -> bool {
    let is_2xx = (200..300).contains(&status_code);
    let is_5xx = (500..600).contains(&status_code);
    (is_2xx && status_code != 200) || status_code == 408 || is_5xx
}

/// Client errors other than 408 mean the broker rejected the request
pub fn is_terminal_http_status(status_code: u16) -> bool {
    (400..500).contains(&status_code) && status_code != 408
}

/// Delay until the next poll, from the broker hint or the default
pub(crate) fn poll_delay(hint: Option<Duration>) -> Duration {
    hint.filter(|d| !d.is_zero()).unwrap_or(DEFAULT_POLL_DELAY)
}
