//! ServiceBroker reconciliation.
//!
//! Fetches the broker's catalog and keeps the broker's ServiceClass and
//! ServicePlan objects in line with it. Entries that disappear from the
//! catalog are flagged `removedFromBrokerCatalog` rather than deleted, and
//! lose the flag again when they reappear. On deletion every owned class
//! and plan is removed before the finalizer is dropped.

use super::{MESSAGE_RECONCILIATION_RETRY_TIMEOUT, Outcome, REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT, Reconciler};
use crate::broker_client_manager::{REASON_ERROR_GETTING_AUTH_CREDENTIALS, broker_key};
use crate::catalog::{REASON_ERROR_SYNCING_CATALOG, broker_selector, convert_and_filter_catalog};
use crate::clock::elapsed;
use crate::config::parse_duration;
use crate::error::ControllerError;
use crate::recorder::EventType;
use crate::reconcile_helpers::{
    add_finalizer, generation, get_condition, has_finalizer, is_condition_true, is_deleting, remove_finalizer,
    set_condition,
};
use catalog_crds::{
    ConditionStatus, ConditionType, FINALIZER_SERVICE_CATALOG, GROUP, RelistBehavior, ServiceBroker,
    ServiceBrokerStatus, ServiceClass, ServicePlan,
};
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const REASON_ERROR_FETCHING_CATALOG: &str = "ErrorFetchingCatalog";
pub const MESSAGE_ERROR_FETCHING_CATALOG: &str = "Error fetching catalog.";
pub const MESSAGE_ERROR_SYNCING_CATALOG: &str = "Error syncing catalog from ServiceBroker.";
pub const REASON_FETCHED_CATALOG: &str = "FetchedCatalog";
pub const MESSAGE_FETCHED_CATALOG: &str = "Successfully fetched catalog entries from broker.";
pub const REASON_ERROR_DELETING_SERVICE_CLASS: &str = "ErrorDeletingServiceClass";
pub const REASON_ERROR_DELETING_SERVICE_PLAN: &str = "ErrorDeletingServicePlan";
pub const REASON_DELETED_SUCCESSFULLY: &str = "DeletedSuccessfully";

static EMPTY_STATUS: LazyLock<ServiceBrokerStatus> = LazyLock::new(ServiceBrokerStatus::default);

pub(crate) fn broker_status(broker: &ServiceBroker) -> &ServiceBrokerStatus {
    broker.status.as_ref().unwrap_or(&EMPTY_STATUS)
}

/// Catalog refresh interval for a `Duration` broker
pub fn relist_interval(broker: &ServiceBroker, default_interval: Duration) -> Duration {
    match broker.spec.relist_duration.as_deref() {
        Some(raw) => match parse_duration(raw) {
            Ok(d) if !d.is_zero() => d,
            _ => {
                warn!(broker = %broker.name_any(), relist_duration = raw, "invalid relist duration; using default");
                default_interval
            }
        },
        None => default_interval,
    }
}

/// Time left until a ready `Duration` broker is due for a relist
fn relist_remaining(broker: &ServiceBroker, now: DateTime<Utc>, default_interval: Duration) -> Option<Duration> {
    if broker.spec.relist_behavior != RelistBehavior::Duration {
        return None;
    }
    let status = broker_status(broker);
    let ready = get_condition(&status.conditions, ConditionType::Ready)?;
    let since = status.last_catalog_retrieval_time.unwrap_or(ready.last_transition_time);
    Some(relist_interval(broker, default_interval).saturating_sub(elapsed(now, since)))
}

/// Whether a pass over `broker` has anything to do at `now`.
///
/// New generations, deletions and brokers without conditions always need
/// work. A ready broker is relisted only under the `Duration` policy once
/// its interval has passed. A broker that failed terminally waits for a
/// spec change.
pub fn should_reconcile_broker(broker: &ServiceBroker, now: DateTime<Utc>, default_interval: Duration) -> bool {
    let status = broker_status(broker);
    if status.reconciled_generation != generation(&broker.metadata) {
        return true;
    }
    if is_deleting(&broker.metadata) || status.conditions.is_empty() {
        return true;
    }
    if is_condition_true(&status.conditions, ConditionType::Failed) {
        return false;
    }
    if !is_condition_true(&status.conditions, ConditionType::Ready) {
        return true;
    }
    match broker.spec.relist_behavior {
        RelistBehavior::Manual => false,
        RelistBehavior::Duration => relist_remaining(broker, now, default_interval).is_some_and(|d| d.is_zero()),
    }
}

/// Owner reference marking a class or plan as managed for `broker`
fn broker_owner_reference(broker: &ServiceBroker) -> OwnerReference {
    OwnerReference {
        api_version: ServiceBroker::api_version(&()).to_string(),
        kind: ServiceBroker::kind(&()).to_string(),
        name: broker.name_any(),
        uid: broker.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(false),
    }
}

/// Whether a catalog-group controller owns the object
pub fn is_catalog_managed(meta: &ObjectMeta) -> bool {
    meta.owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.controller == Some(true) && r.api_version.starts_with(GROUP)))
}

fn mark_catalog_managed(meta: &mut ObjectMeta, broker: &ServiceBroker) {
    if !is_catalog_managed(meta) {
        meta.owner_references.get_or_insert_with(Vec::new).push(broker_owner_reference(broker));
    }
}

impl Reconciler {
    /// Reconcile a ServiceBroker
    pub async fn reconcile_broker(&self, broker: &ServiceBroker) -> Result<Outcome, ControllerError> {
        let name = broker.name_any();
        let namespace = broker.namespace().unwrap_or_default();
        let now = self.now();

        if !should_reconcile_broker(broker, now, self.config.broker_relist_interval) {
            debug!(broker = %name, namespace = %namespace, "broker is up to date");
            return Ok(match relist_remaining(broker, now, self.config.broker_relist_interval) {
                Some(remaining) if is_condition_true(&broker_status(broker).conditions, ConditionType::Ready) => {
                    Outcome::RequeueAfter(remaining)
                }
                _ => Outcome::Done,
            });
        }

        if is_deleting(&broker.metadata) {
            return self.finalize_broker(broker).await;
        }

        if !has_finalizer(&broker.metadata, FINALIZER_SERVICE_CATALOG) {
            let mut updated = broker.clone();
            add_finalizer(&mut updated.metadata, FINALIZER_SERVICE_CATALOG);
            self.stores.brokers.update(&updated).await?;
            return Ok(Outcome::RequeueNow);
        }

        info!(broker = %name, namespace = %namespace, url = %broker.spec.url, "fetching broker catalog");

        let client = match self.broker_client(broker).await {
            Ok(client) => client,
            Err(e) => {
                let message = e.message();
                warn!(broker = %name, error = %message, "unable to build broker client");
                self.event(broker, EventType::Warning, REASON_ERROR_GETTING_AUTH_CREDENTIALS, &message).await;
                self.update_broker_condition(
                    broker,
                    ConditionType::Ready,
                    ConditionStatus::False,
                    REASON_ERROR_FETCHING_CATALOG,
                    &format!("{MESSAGE_ERROR_FETCHING_CATALOG} {message}"),
                )
                .await?;
                return Err(e);
            }
        };

        let result = client.get_catalog().await;
        self.observe(client.as_ref(), "get_catalog", &result);
        let catalog = match result {
            Ok(catalog) => catalog,
            Err(e) => return self.handle_catalog_fetch_error(broker, e.to_string()).await,
        };
        debug!(broker = %name, services = catalog.services.len(), "fetched catalog");

        let mut broker = broker.clone();
        if broker_status(&broker).operation_start_time.is_some() {
            let mut updated = broker.clone();
            if let Some(status) = updated.status.as_mut() {
                status.operation_start_time = None;
            }
            broker = self.stores.brokers.update_status(&updated).await?;
        }

        let selector = broker_selector(&name);
        let existing_classes = self.stores.classes.list(Some(&namespace), Some(&selector)).await?;
        let existing_plans = self.stores.plans.list(Some(&namespace), Some(&selector)).await?;

        let converted = match convert_and_filter_catalog(&broker, &catalog, &existing_classes, &existing_plans) {
            Ok(converted) => converted,
            Err(e) => {
                let detail = format!("Error converting catalog payload for broker {name:?}: {}", e.message());
                return self.handle_catalog_sync_error(&broker, detail).await;
            }
        };
        if converted.classes.is_empty() {
            let detail = format!(
                "Error getting catalog payload for broker {name:?}; received zero services; at least one service is required"
            );
            return self.handle_catalog_sync_error(&broker, detail).await;
        }

        let mut classes_by_name: HashMap<String, ServiceClass> =
            existing_classes.into_iter().map(|c| (c.name_any(), c)).collect();
        for payload in &converted.classes {
            let existing = classes_by_name.remove(&payload.name_any());
            if let Err(e) = self.sync_service_class(&broker, payload, existing).await {
                let detail = format!("Error reconciling ServiceClass {:?}: {}", payload.spec.external_name, e.message());
                return self.handle_catalog_sync_error(&broker, detail).await;
            }
        }
        for mut removed in classes_by_name.into_values() {
            let already = removed.status.as_ref().is_some_and(|s| s.removed_from_broker_catalog);
            if already || !is_catalog_managed(&removed.metadata) {
                continue;
            }
            info!(broker = %name, class = %removed.name_any(), "service class removed from broker catalog");
            removed.status.get_or_insert_with(Default::default).removed_from_broker_catalog = true;
            if let Err(e) = self.stores.classes.update_status(&removed).await {
                let detail = format!("Error updating status of ServiceClass {:?}: {}", removed.name_any(), e);
                return self.handle_catalog_sync_error(&broker, detail).await;
            }
        }

        let mut plans_by_name: HashMap<String, ServicePlan> =
            existing_plans.into_iter().map(|p| (p.name_any(), p)).collect();
        for payload in &converted.plans {
            let existing = plans_by_name.remove(&payload.name_any());
            if let Err(e) = self.sync_service_plan(&broker, payload, existing).await {
                let detail = format!("Error reconciling ServicePlan {:?}: {}", payload.spec.external_name, e.message());
                return self.handle_catalog_sync_error(&broker, detail).await;
            }
        }
        for mut removed in plans_by_name.into_values() {
            let already = removed.status.as_ref().is_some_and(|s| s.removed_from_broker_catalog);
            if already || !is_catalog_managed(&removed.metadata) {
                continue;
            }
            info!(broker = %name, plan = %removed.name_any(), "service plan removed from broker catalog");
            removed.status.get_or_insert_with(Default::default).removed_from_broker_catalog = true;
            if let Err(e) = self.stores.plans.update_status(&removed).await {
                let detail = format!("Error updating status of ServicePlan {:?}: {}", removed.name_any(), e);
                return self.handle_catalog_sync_error(&broker, detail).await;
            }
        }

        let mut updated = broker.clone();
        let status = updated.status.get_or_insert_with(Default::default);
        status.last_catalog_retrieval_time = Some(now);
        self.update_broker_condition(
            &updated,
            ConditionType::Ready,
            ConditionStatus::True,
            REASON_FETCHED_CATALOG,
            MESSAGE_FETCHED_CATALOG,
        )
        .await?;
        self.event(&broker, EventType::Normal, REASON_FETCHED_CATALOG, MESSAGE_FETCHED_CATALOG).await;
        self.metrics
            .set_broker_counts(&broker_key(&broker), converted.classes.len(), converted.plans.len());
        info!(
            broker = %name,
            classes = converted.classes.len(),
            plans = converted.plans.len(),
            "synced broker catalog"
        );

        Ok(match broker.spec.relist_behavior {
            RelistBehavior::Duration => {
                Outcome::RequeueAfter(relist_interval(&broker, self.config.broker_relist_interval))
            }
            RelistBehavior::Manual => Outcome::Done,
        })
    }

    async fn handle_catalog_fetch_error(&self, broker: &ServiceBroker, error: String) -> Result<Outcome, ControllerError> {
        let name = broker.name_any();
        let detail = format!("Error getting broker catalog: {error}");
        warn!(broker = %name, error = %error, "failed to fetch catalog");
        self.event(broker, EventType::Warning, REASON_ERROR_FETCHING_CATALOG, &detail).await;

        let mut updated = broker.clone();
        let now = self.now();
        let start = broker_status(broker).operation_start_time;
        if start.is_some() && self.retry_window_elapsed(start) {
            info!(broker = %name, "stopping catalog retries; retry window elapsed");
            self.event(
                broker,
                EventType::Warning,
                REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT,
                MESSAGE_RECONCILIATION_RETRY_TIMEOUT,
            )
            .await;
            let status = updated.status.get_or_insert_with(Default::default);
            status.operation_start_time = None;
            status.reconciled_generation = generation(&broker.metadata);
            set_condition(
                &mut status.conditions,
                ConditionType::Ready,
                ConditionStatus::False,
                REASON_ERROR_FETCHING_CATALOG,
                &format!("{MESSAGE_ERROR_FETCHING_CATALOG} {detail}"),
                now,
            );
            set_condition(
                &mut status.conditions,
                ConditionType::Failed,
                ConditionStatus::True,
                REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT,
                MESSAGE_RECONCILIATION_RETRY_TIMEOUT,
                now,
            );
            self.stores.brokers.update_status(&updated).await?;
            return Ok(Outcome::Done);
        }

        let status = updated.status.get_or_insert_with(Default::default);
        if status.operation_start_time.is_none() {
            status.operation_start_time = Some(now);
        }
        set_condition(
            &mut status.conditions,
            ConditionType::Ready,
            ConditionStatus::False,
            REASON_ERROR_FETCHING_CATALOG,
            &format!("{MESSAGE_ERROR_FETCHING_CATALOG} {detail}"),
            now,
        );
        self.stores.brokers.update_status(&updated).await?;
        Err(ControllerError::operation(REASON_ERROR_FETCHING_CATALOG, detail))
    }

    async fn handle_catalog_sync_error(&self, broker: &ServiceBroker, detail: String) -> Result<Outcome, ControllerError> {
        warn!(broker = %broker.name_any(), error = %detail, "failed to sync catalog");
        self.event(broker, EventType::Warning, REASON_ERROR_SYNCING_CATALOG, &detail).await;
        self.update_broker_condition(
            broker,
            ConditionType::Ready,
            ConditionStatus::False,
            REASON_ERROR_SYNCING_CATALOG,
            &format!("{MESSAGE_ERROR_SYNCING_CATALOG} {detail}"),
        )
        .await?;
        Err(ControllerError::operation(REASON_ERROR_SYNCING_CATALOG, detail))
    }

    async fn sync_service_class(
        &self,
        broker: &ServiceBroker,
        payload: &ServiceClass,
        existing: Option<ServiceClass>,
    ) -> Result<(), ControllerError> {
        let namespace = broker.namespace().unwrap_or_default();
        let existing = match existing {
            Some(existing) => existing,
            None => match super::fetch(self.stores.classes.as_ref(), &namespace, &payload.name_any()).await? {
                Some(other) if other.spec.service_broker_name != broker.name_any() => {
                    return Err(ControllerError::operation(
                        REASON_ERROR_SYNCING_CATALOG,
                        format!(
                            "ServiceClass {:?} already exists for Broker {:?}",
                            payload.spec.external_name, other.spec.service_broker_name
                        ),
                    ));
                }
                Some(other) => other,
                None => {
                    let mut fresh = payload.clone();
                    mark_catalog_managed(&mut fresh.metadata, broker);
                    debug!(class = %fresh.name_any(), "creating service class");
                    self.stores.classes.create(&fresh).await?;
                    return Ok(());
                }
            },
        };

        if existing.spec.external_id != payload.spec.external_id {
            return Err(ControllerError::operation(
                REASON_ERROR_SYNCING_CATALOG,
                format!(
                    "ServiceClass {:?} already exists with OSB guid {:?}, received different guid {:?}",
                    existing.name_any(),
                    existing.spec.external_id,
                    payload.spec.external_id
                ),
            ));
        }

        let mut to_update = existing.clone();
        to_update.spec.binding_retrievable = payload.spec.binding_retrievable;
        to_update.spec.bindable = payload.spec.bindable;
        to_update.spec.plan_updatable = payload.spec.plan_updatable;
        to_update.spec.tags = payload.spec.tags.clone();
        to_update.spec.description = payload.spec.description.clone();
        to_update.spec.requires = payload.spec.requires.clone();
        to_update.spec.external_name = payload.spec.external_name.clone();
        to_update.spec.external_metadata = payload.spec.external_metadata.clone();
        to_update.metadata.labels = payload.metadata.labels.clone();
        mark_catalog_managed(&mut to_update.metadata, broker);

        let mut current = existing.clone();
        if to_update.spec != existing.spec || to_update.metadata != existing.metadata {
            debug!(class = %existing.name_any(), "updating service class");
            current = self.stores.classes.update(&to_update).await?;
        }
        if current.status.as_ref().is_some_and(|s| s.removed_from_broker_catalog) {
            info!(class = %current.name_any(), "service class is back in the broker catalog");
            if let Some(status) = current.status.as_mut() {
                status.removed_from_broker_catalog = false;
            }
            self.stores.classes.update_status(&current).await?;
        }
        Ok(())
    }

    async fn sync_service_plan(
        &self,
        broker: &ServiceBroker,
        payload: &ServicePlan,
        existing: Option<ServicePlan>,
    ) -> Result<(), ControllerError> {
        let namespace = broker.namespace().unwrap_or_default();
        let existing = match existing {
            Some(existing) => existing,
            None => match super::fetch(self.stores.plans.as_ref(), &namespace, &payload.name_any()).await? {
                Some(other) if other.spec.service_broker_name != broker.name_any() => {
                    return Err(ControllerError::operation(
                        REASON_ERROR_SYNCING_CATALOG,
                        format!(
                            "ServicePlan {:?} already exists for Broker {:?}",
                            payload.spec.external_name, other.spec.service_broker_name
                        ),
                    ));
                }
                Some(other) => other,
                None => {
                    let mut fresh = payload.clone();
                    mark_catalog_managed(&mut fresh.metadata, broker);
                    debug!(plan = %fresh.name_any(), "creating service plan");
                    self.stores.plans.create(&fresh).await?;
                    return Ok(());
                }
            },
        };

        if existing.spec.external_id != payload.spec.external_id {
            return Err(ControllerError::operation(
                REASON_ERROR_SYNCING_CATALOG,
                format!(
                    "ServicePlan {:?} already exists with OSB guid {:?}, received different guid {:?}",
                    existing.name_any(),
                    existing.spec.external_id,
                    payload.spec.external_id
                ),
            ));
        }

        let mut to_update = existing.clone();
        to_update.spec.description = payload.spec.description.clone();
        to_update.spec.bindable = payload.spec.bindable;
        to_update.spec.free = payload.spec.free;
        to_update.spec.external_name = payload.spec.external_name.clone();
        to_update.spec.external_metadata = payload.spec.external_metadata.clone();
        to_update.spec.instance_create_parameter_schema = payload.spec.instance_create_parameter_schema.clone();
        to_update.spec.instance_update_parameter_schema = payload.spec.instance_update_parameter_schema.clone();
        to_update.spec.service_binding_create_parameter_schema =
            payload.spec.service_binding_create_parameter_schema.clone();
        to_update.metadata.labels = payload.metadata.labels.clone();
        mark_catalog_managed(&mut to_update.metadata, broker);

        let mut current = existing.clone();
        if to_update.spec != existing.spec || to_update.metadata != existing.metadata {
            debug!(plan = %existing.name_any(), "updating service plan");
            current = self.stores.plans.update(&to_update).await?;
        }
        if current.status.as_ref().is_some_and(|s| s.removed_from_broker_catalog) {
            info!(plan = %current.name_any(), "service plan is back in the broker catalog");
            if let Some(status) = current.status.as_mut() {
                status.removed_from_broker_catalog = false;
            }
            self.stores.plans.update_status(&current).await?;
        }
        Ok(())
    }

    /// Remove the broker's classes and plans, then release the finalizer
    async fn finalize_broker(&self, broker: &ServiceBroker) -> Result<Outcome, ControllerError> {
        if !has_finalizer(&broker.metadata, FINALIZER_SERVICE_CATALOG) {
            return Ok(Outcome::Done);
        }
        let name = broker.name_any();
        let namespace = broker.namespace().unwrap_or_default();
        info!(broker = %name, namespace = %namespace, "finalizing broker");

        let selector = broker_selector(&name);
        let plans = self.stores.plans.list(Some(&namespace), Some(&selector)).await?;
        for plan in plans {
            match self.stores.plans.delete(&namespace, &plan.name_any()).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    let detail = format!("Error deleting ServicePlan {:?}: {e}", plan.name_any());
                    return self.handle_broker_cleanup_error(broker, REASON_ERROR_DELETING_SERVICE_PLAN, detail).await;
                }
            }
        }
        let classes = self.stores.classes.list(Some(&namespace), Some(&selector)).await?;
        for class in classes {
            match self.stores.classes.delete(&namespace, &class.name_any()).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    let detail = format!("Error deleting ServiceClass {:?}: {e}", class.name_any());
                    return self.handle_broker_cleanup_error(broker, REASON_ERROR_DELETING_SERVICE_CLASS, detail).await;
                }
            }
        }

        let updated = self
            .update_broker_condition(
                broker,
                ConditionType::Ready,
                ConditionStatus::False,
                REASON_DELETED_SUCCESSFULLY,
                "The broker was deleted successfully",
            )
            .await?;
        let mut released = updated;
        remove_finalizer(&mut released.metadata, FINALIZER_SERVICE_CATALOG);
        self.stores.brokers.update(&released).await?;

        let key = broker_key(broker);
        self.metrics.remove_broker(&key);
        self.client_manager.remove_broker_client(&key);
        self.event(
            broker,
            EventType::Normal,
            REASON_DELETED_SUCCESSFULLY,
            &format!("The broker {name} was deleted successfully."),
        )
        .await;
        Ok(Outcome::Done)
    }

    async fn handle_broker_cleanup_error(
        &self,
        broker: &ServiceBroker,
        reason: &str,
        detail: String,
    ) -> Result<Outcome, ControllerError> {
        warn!(broker = %broker.name_any(), error = %detail, "failed to clean up broker catalog");
        self.event(broker, EventType::Warning, reason, &detail).await;
        self.update_broker_condition(broker, ConditionType::Ready, ConditionStatus::Unknown, reason, &detail)
            .await?;
        Err(ControllerError::operation(reason, detail))
    }

    /// Set one condition and persist the status.
    ///
    /// A true Ready condition also records the generation as reconciled.
    async fn update_broker_condition(
        &self,
        broker: &ServiceBroker,
        type_: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) -> Result<ServiceBroker, ControllerError> {
        let mut updated = broker.clone();
        let broker_status = updated.status.get_or_insert_with(Default::default);
        set_condition(&mut broker_status.conditions, type_, status, reason, message, self.now());
        if type_ == ConditionType::Ready && status == ConditionStatus::True {
            broker_status.reconciled_generation = generation(&broker.metadata);
        }
        self.stores.brokers.update_status(&updated).await
    }
}
