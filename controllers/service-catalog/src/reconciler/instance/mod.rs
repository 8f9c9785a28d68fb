//! ServiceInstance reconciliation.
//!
//! Each pass picks one action from the persisted status:
//! - an asynchronous broker operation is outstanding: poll it
//! - the instance is being deleted or an orphan is being mitigated: deprovision
//! - the instance is provisioned: update it if its generation moved
//! - otherwise: provision it
//!
//! Starting an operation is persisted on its own before the broker is
//! called, so a pass that records the start returns `RequeueNow` and the
//! following pass sends the request.

mod deprovision;
mod poll;
mod provision;
mod update;

use super::{Outcome, Reconciler};
use super::{
    REASON_ERROR_WITH_PARAMETERS, REASON_NONEXISTENT_SERVICE_CLASS, REASON_NONEXISTENT_SERVICE_PLAN,
};
use crate::error::ControllerError;
use crate::name_escape::label_sha;
use crate::parameters::build_parameters;
use crate::recorder::EventType;
use crate::reconcile_helpers::{
    add_finalizer, generation, get_condition, is_condition_true, is_deleting, remove_condition, set_condition,
};
use crate::store::object_key;
use catalog_crds::{
    ConditionStatus, ConditionType, DeprovisionStatus, FINALIZER_SERVICE_CATALOG, InstanceOperation, InstancePropertiesState,
    LABEL_EXTERNAL_NAME, LABEL_SERVICE_BROKER_NAME, LABEL_SERVICE_CLASS_REF_NAME, LocalObjectReference,
    ProvisionStatus, ServiceBinding, ServiceClass, ServiceInstance, ServiceInstanceStatus, ServicePlan,
};
use kube::ResourceExt;
use osb_client::{JsonMap, OriginatingIdentity, OsbClientTrait};
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

pub const REASON_PROVISIONED_SUCCESSFULLY: &str = "ProvisionedSuccessfully";
pub const MESSAGE_PROVISIONED_SUCCESSFULLY: &str = "The instance was provisioned successfully";
pub const REASON_INSTANCE_UPDATED_SUCCESSFULLY: &str = "InstanceUpdatedSuccessfully";
pub const MESSAGE_INSTANCE_UPDATED_SUCCESSFULLY: &str = "The instance was updated successfully";
pub const REASON_DEPROVISIONED_SUCCESSFULLY: &str = "DeprovisionedSuccessfully";
pub const MESSAGE_DEPROVISIONED_SUCCESSFULLY: &str = "The instance was deprovisioned successfully";
pub const MESSAGE_ORPHAN_MITIGATION_SUCCESSFUL: &str = "Orphan mitigation was completed successfully";

pub const REASON_PROVISION_CALL_FAILED: &str = "ProvisionCallFailed";
pub const REASON_ERROR_CALLING_PROVISION: &str = "ErrorCallingProvision";
pub const REASON_UPDATE_INSTANCE_CALL_FAILED: &str = "UpdateInstanceCallFailed";
pub const REASON_ERROR_CALLING_UPDATE_INSTANCE: &str = "ErrorCallingUpdateInstance";
pub const REASON_DEPROVISION_CALL_FAILED: &str = "DeprovisionCallFailed";
pub const REASON_DEPROVISION_BLOCKED_BY_CREDENTIALS: &str = "DeprovisionBlockedByExistingCredentials";
pub const REASON_DELETED_SERVICE_CLASS: &str = "ReferencesDeletedServiceClass";
pub const REASON_DELETED_SERVICE_PLAN: &str = "ReferencesDeletedServicePlan";

pub const REASON_PROVISIONING: &str = "Provisioning";
pub const MESSAGE_PROVISIONING: &str = "The instance is being provisioned asynchronously";
pub const REASON_UPDATING_INSTANCE: &str = "UpdatingInstance";
pub const MESSAGE_UPDATING_INSTANCE: &str = "The instance is being updated asynchronously";
pub const REASON_DEPROVISIONING: &str = "Deprovisioning";
pub const MESSAGE_DEPROVISIONING: &str = "The instance is being deprovisioned asynchronously";
pub const REASON_SERVICE_BINDINGS_DELETION: &str = "ServiceBindingsDeletion";
pub const MESSAGE_SERVICE_BINDINGS_DELETION: &str = "The instance's service bindings are being deleted";
pub const REASON_PROVISION_IN_FLIGHT: &str = "ProvisionRequestInFlight";
pub const MESSAGE_PROVISION_IN_FLIGHT: &str = "Provision request for ServiceInstance in-flight to Broker";
pub const REASON_UPDATE_IN_FLIGHT: &str = "UpdateInstanceRequestInFlight";
pub const MESSAGE_UPDATE_IN_FLIGHT: &str = "Update request for ServiceInstance in-flight to Broker";
pub const REASON_DEPROVISION_IN_FLIGHT: &str = "DeprovisionRequestInFlight";
pub const MESSAGE_DEPROVISION_IN_FLIGHT: &str = "Deprovision request for ServiceInstance in-flight to Broker";
pub const REASON_STARTING_ORPHAN_MITIGATION: &str = "StartingInstanceOrphanMitigation";
pub const MESSAGE_STARTING_ORPHAN_MITIGATION: &str = "The instance provision call failed with an ambiguous error; attempting to deprovision the instance in order to mitigate an orphaned resource";

static EMPTY_STATUS: LazyLock<ServiceInstanceStatus> = LazyLock::new(ServiceInstanceStatus::default);

pub(crate) fn instance_status(instance: &ServiceInstance) -> &ServiceInstanceStatus {
    instance.status.as_ref().unwrap_or(&EMPTY_STATUS)
}

/// Mutable status, created on first access
pub(crate) fn instance_status_mut(instance: &mut ServiceInstance) -> &mut ServiceInstanceStatus {
    instance.status.get_or_insert_with(Default::default)
}

/// The work one pass over an instance performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceAction {
    Provision,
    Update,
    Deprovision,
    Poll,
}

pub fn instance_action(instance: &ServiceInstance) -> InstanceAction {
    let status = instance_status(instance);
    if status.async_op_in_progress {
        InstanceAction::Poll
    } else if instance.metadata.deletion_timestamp.is_some() || status.orphan_mitigation_in_progress {
        InstanceAction::Deprovision
    } else if status.provision_status == ProvisionStatus::Provisioned {
        InstanceAction::Update
    } else {
        InstanceAction::Provision
    }
}

/// The observed generation settled on Ready or Failed with no orphan pending
pub fn is_instance_processed(instance: &ServiceInstance) -> bool {
    let status = instance_status(instance);
    status.observed_generation >= generation(&instance.metadata)
        && (is_condition_true(&status.conditions, ConditionType::Ready)
            || is_condition_true(&status.conditions, ConditionType::Failed))
        && !status.orphan_mitigation_in_progress
}

/// Same plan, parameters and requesting user
pub fn instance_properties_equal(a: Option<&InstancePropertiesState>, b: Option<&InstancePropertiesState>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            a.service_plan_external_id == b.service_plan_external_id
                && a.service_plan_external_name == b.service_plan_external_name
                && a.parameter_checksum == b.parameter_checksum
                && a.user_info.as_ref().map(|u| &u.uid) == b.user_info.as_ref().map(|u| &u.uid)
        }
        _ => false,
    }
}

/// Forget the operation being driven, including any broker-side async state
pub(crate) fn clear_current_operation(status: &mut ServiceInstanceStatus) {
    status.current_operation = None;
    status.operation_start_time = None;
    status.async_op_in_progress = false;
    status.last_operation = None;
    status.in_progress_properties = None;
}

/// Forget only the broker-side async state
pub(crate) fn clear_async_operation(status: &mut ServiceInstanceStatus) {
    status.async_op_in_progress = false;
    status.last_operation = None;
}

/// Record that this pass works on the current generation; stale failures go
fn prepare_observed_generation(instance: &mut ServiceInstance) {
    let generation = generation(&instance.metadata);
    let status = instance_status_mut(instance);
    status.observed_generation = generation;
    remove_condition(&mut status.conditions, ConditionType::Failed);
}

fn set_last_operation(status: &mut ServiceInstanceStatus, operation_key: Option<&str>) {
    if let Some(key) = operation_key.filter(|k| !k.is_empty()) {
        status.last_operation = Some(key.to_string());
    }
}

fn set_dashboard_url(status: &mut ServiceInstanceStatus, url: Option<&str>) {
    if let Some(url) = url.filter(|u| !u.is_empty()) {
        status.dashboard_url = Some(url.to_string());
    }
}

fn plan_reference_display(instance: &ServiceInstance) -> String {
    let plan_ref = &instance.spec.plan_reference;
    let class = plan_ref
        .service_class_name
        .as_deref()
        .or(plan_ref.service_class_external_name.as_deref())
        .unwrap_or_default();
    let plan = plan_ref
        .service_plan_name
        .as_deref()
        .or(plan_ref.service_plan_external_name.as_deref())
        .unwrap_or_default();
    format!("{class}/{plan}")
}

/// Class, plan and broker client behind an instance
pub(crate) struct ResolvedInstance {
    pub(crate) class: ServiceClass,
    /// Missing once the plan is gone from the store; deprovision and poll
    /// fall back to the plan recorded in status
    pub(crate) plan: Option<ServicePlan>,
    pub(crate) broker_name: String,
    pub(crate) client: Arc<dyn OsbClientTrait>,
}

impl ResolvedInstance {
    /// The plan, which provision and update cannot do without
    pub(crate) fn required_plan(&self, instance: &ServiceInstance) -> Result<ServicePlan, ControllerError> {
        self.plan.clone().ok_or_else(|| {
            let plan_name = instance_status(instance)
                .service_plan_ref
                .as_ref()
                .map(|r| r.name.clone())
                .unwrap_or_default();
            ControllerError::operation(
                REASON_NONEXISTENT_SERVICE_PLAN,
                format!(
                    "The instance references a non-existent ServicePlan (K8S: {plan_name:?}) {}",
                    plan_reference_display(instance)
                ),
            )
        })
    }
}

/// Values shared by provision and update requests
pub(crate) struct InstanceRequestParts {
    pub(crate) parameters: Option<JsonMap>,
    pub(crate) in_progress: InstancePropertiesState,
    pub(crate) namespace_uid: String,
    pub(crate) context: Option<JsonMap>,
    pub(crate) originating_identity: Option<OriginatingIdentity>,
}

impl Reconciler {
    /// Reconcile a ServiceInstance
    pub async fn reconcile_instance(&self, instance: &ServiceInstance) -> Result<Outcome, ControllerError> {
        let key = object_key(&instance.namespace().unwrap_or_default(), &instance.name_any());

        if instance.status.is_none() {
            debug!(instance = %key, "initializing status");
            let mut updated = instance.clone();
            if !is_deleting(&updated.metadata) && add_finalizer(&mut updated.metadata, FINALIZER_SERVICE_CATALOG) {
                updated = self.stores.instances.update(&updated).await?;
            }
            updated.status = Some(ServiceInstanceStatus {
                deprovision_status: DeprovisionStatus::NotRequired,
                ..Default::default()
            });
            self.stores.instances.update_status(&updated).await?;
            return Ok(Outcome::RequeueNow);
        }

        let status = instance_status(instance);
        if status.orphan_mitigation_in_progress
            && !is_condition_true(&status.conditions, ConditionType::OrphanMitigation)
        {
            let mut updated = instance.clone();
            set_condition(
                &mut instance_status_mut(&mut updated).conditions,
                ConditionType::OrphanMitigation,
                ConditionStatus::True,
                REASON_STARTING_ORPHAN_MITIGATION,
                MESSAGE_STARTING_ORPHAN_MITIGATION,
                self.now(),
            );
            self.event(
                instance,
                EventType::Warning,
                REASON_STARTING_ORPHAN_MITIGATION,
                MESSAGE_STARTING_ORPHAN_MITIGATION,
            )
            .await;
            self.stores.instances.update_status(&updated).await?;
            return Ok(Outcome::RequeueNow);
        }

        let action = instance_action(instance);
        debug!(instance = %key, action = ?action, "reconciling instance");
        match action {
            InstanceAction::Provision => self.reconcile_instance_add(instance).await,
            InstanceAction::Update => self.reconcile_instance_update(instance).await,
            InstanceAction::Deprovision => self.reconcile_instance_delete(instance).await,
            InstanceAction::Poll => self.poll_instance(instance).await,
        }
    }

    /// Resolve and persist the class and plan the instance refers to.
    ///
    /// Returns whether status was written, in which case the pass ends.
    pub(crate) async fn resolve_instance_references(
        &self,
        instance: &mut ServiceInstance,
    ) -> Result<bool, ControllerError> {
        let status = instance_status(instance);
        if status.service_class_ref.is_some() && status.service_plan_ref.is_some() {
            return Ok(false);
        }

        let class = match status.service_class_ref.clone() {
            Some(class_ref) => {
                let namespace = instance.namespace().unwrap_or_default();
                match super::fetch(self.stores.classes.as_ref(), &namespace, &class_ref.name).await? {
                    Some(class) => class,
                    None => {
                        let message = format!("References a non-existent ServiceClass {:?}", class_ref.name);
                        return Err(self.reference_error(instance, REASON_NONEXISTENT_SERVICE_CLASS, message).await);
                    }
                }
            }
            None => match self.resolve_service_class(instance).await? {
                Ok(class) => class,
                Err(message) => {
                    return Err(self.reference_error(instance, REASON_NONEXISTENT_SERVICE_CLASS, message).await);
                }
            },
        };

        let plan = match self.resolve_service_plan(instance, &class).await? {
            Ok(plan) => plan,
            Err(message) => {
                return Err(self.reference_error(instance, REASON_NONEXISTENT_SERVICE_PLAN, message).await);
            }
        };

        let status = instance_status_mut(instance);
        status.service_class_ref = Some(LocalObjectReference::new(class.name_any()));
        status.service_plan_ref = Some(LocalObjectReference::new(plan.name_any()));
        debug!(
            instance = %instance.name_any(),
            class = %class.name_any(),
            plan = %plan.name_any(),
            "resolved class and plan references"
        );
        self.stores.instances.update_status(instance).await?;
        Ok(true)
    }

    async fn reference_error(&self, instance: &ServiceInstance, reason: &str, message: String) -> ControllerError {
        warn!(instance = %instance.name_any(), reason, error = %message, "unresolvable reference");
        let kind = if reason == REASON_NONEXISTENT_SERVICE_CLASS { "ServiceClass" } else { "ServicePlan" };
        let condition_message = format!("The instance references a {kind} that does not exist. {message}");
        let mut updated = instance.clone();
        set_condition(
            &mut instance_status_mut(&mut updated).conditions,
            ConditionType::Ready,
            ConditionStatus::False,
            reason,
            &condition_message,
            self.now(),
        );
        if let Err(e) = self.stores.instances.update_status(&updated).await {
            return e;
        }
        self.event(instance, EventType::Warning, reason, &message).await;
        ControllerError::operation(reason, condition_message)
    }

    /// Class by resource name, or the single class with the external name
    async fn resolve_service_class(&self, instance: &ServiceInstance) -> Result<Result<ServiceClass, String>, ControllerError> {
        let namespace = instance.namespace().unwrap_or_default();
        let plan_ref = &instance.spec.plan_reference;
        if let Some(name) = plan_ref.service_class_name.as_deref() {
            return Ok(super::fetch(self.stores.classes.as_ref(), &namespace, name)
                .await?
                .ok_or_else(|| format!("References a non-existent ServiceClass {}", plan_reference_display(instance))));
        }
        let Some(external_name) = plan_ref.service_class_external_name.as_deref() else {
            return Ok(Err(format!(
                "ServiceInstance {namespace}/{} names neither a ServiceClass nor its external name",
                instance.name_any()
            )));
        };
        let selector = format!("{}={}", LABEL_EXTERNAL_NAME, label_sha(external_name));
        let mut classes = self.stores.classes.list(Some(&namespace), Some(&selector)).await?;
        if classes.len() == 1 {
            return Ok(Ok(classes.remove(0)));
        }
        Ok(Err(format!(
            "References a non-existent ServiceClass {} or there is more than one (found: {})",
            plan_reference_display(instance),
            classes.len()
        )))
    }

    async fn resolve_service_plan(
        &self,
        instance: &ServiceInstance,
        class: &ServiceClass,
    ) -> Result<Result<ServicePlan, String>, ControllerError> {
        let namespace = instance.namespace().unwrap_or_default();
        if let Some(plan_ref) = instance_status(instance).service_plan_ref.as_ref() {
            return Ok(super::fetch(self.stores.plans.as_ref(), &namespace, &plan_ref.name)
                .await?
                .ok_or_else(|| format!("References a non-existent ServicePlan {:?}", plan_ref.name)));
        }
        let plan_ref = &instance.spec.plan_reference;
        if let Some(name) = plan_ref.service_plan_name.as_deref() {
            return Ok(super::fetch(self.stores.plans.as_ref(), &namespace, name)
                .await?
                .ok_or_else(|| format!("References a non-existent ServicePlan {}", plan_reference_display(instance))));
        }
        let Some(external_name) = plan_ref.service_plan_external_name.as_deref() else {
            return Ok(Err(format!(
                "ServiceInstance {namespace}/{} names neither a ServicePlan nor its external name",
                instance.name_any()
            )));
        };
        let selector = format!(
            "{}={},{}={},{}={}",
            LABEL_EXTERNAL_NAME,
            label_sha(external_name),
            LABEL_SERVICE_CLASS_REF_NAME,
            label_sha(&class.name_any()),
            LABEL_SERVICE_BROKER_NAME,
            label_sha(&class.spec.service_broker_name),
        );
        let mut plans = self.stores.plans.list(Some(&namespace), Some(&selector)).await?;
        if plans.len() == 1 {
            return Ok(Ok(plans.remove(0)));
        }
        Ok(Err(format!(
            "References a non-existent ServicePlan {} on ServiceClass {} or there is more than one (found: {})",
            plan_reference_display(instance),
            class.name_any(),
            plans.len()
        )))
    }

    /// Look up the resolved class and plan and a client for their broker
    pub(crate) async fn resolve_instance(&self, instance: &ServiceInstance) -> Result<ResolvedInstance, ControllerError> {
        let namespace = instance.namespace().unwrap_or_default();
        let status = instance_status(instance);
        let class_name = status.service_class_ref.as_ref().map(|r| r.name.clone()).unwrap_or_default();
        let class = super::fetch(self.stores.classes.as_ref(), &namespace, &class_name)
            .await?
            .ok_or_else(|| {
                ControllerError::operation(
                    REASON_NONEXISTENT_SERVICE_CLASS,
                    format!(
                        "The instance references a non-existent ServiceClass (K8S: {class_name:?}) {}",
                        plan_reference_display(instance)
                    ),
                )
            })?;

        let plan_name = status.service_plan_ref.as_ref().map(|r| r.name.clone()).unwrap_or_default();
        let plan = super::fetch(self.stores.plans.as_ref(), &namespace, &plan_name).await?;

        let broker_name = class.spec.service_broker_name.clone();
        let client = self.broker_client_for(&namespace, &broker_name).await?;
        Ok(ResolvedInstance {
            class,
            plan,
            broker_name,
            client,
        })
    }

    /// Refuse plan changes onto entries removed from the broker catalog.
    ///
    /// Parameter-only updates of an instance already on the plan pass.
    pub(crate) fn check_for_removed_class_and_plan(
        &self,
        instance: &ServiceInstance,
        class: &ServiceClass,
        plan: &ServicePlan,
    ) -> Result<(), ControllerError> {
        let class_removed = class.status.as_ref().is_some_and(|s| s.removed_from_broker_catalog);
        let plan_removed = plan.status.as_ref().is_some_and(|s| s.removed_from_broker_catalog);
        if !class_removed && !plan_removed {
            return Ok(());
        }
        let status = instance_status(instance);
        let provisioned = status.provision_status == ProvisionStatus::Provisioned;
        let same_plan = status
            .external_properties
            .as_ref()
            .is_some_and(|p| p.service_plan_external_id == plan.spec.external_id);
        if provisioned && same_plan {
            return Ok(());
        }
        if plan_removed {
            return Err(ControllerError::operation(
                REASON_DELETED_SERVICE_PLAN,
                format!("ServicePlan {:?} has been deleted; cannot provision.", plan.spec.external_name),
            ));
        }
        Err(ControllerError::operation(
            REASON_DELETED_SERVICE_CLASS,
            format!("ServiceClass {:?} has been deleted; cannot provision.", class.spec.external_name),
        ))
    }

    /// Parameters, namespace, context and identity for provision and update
    pub(crate) async fn instance_request_parts(
        &self,
        instance: &ServiceInstance,
        plan: &ServicePlan,
    ) -> Result<InstanceRequestParts, ControllerError> {
        let namespace = instance.namespace().unwrap_or_default();
        let originating_identity = self.originating_identity(instance.spec.user_info.as_ref())?;
        let namespace_uid = self.namespace_uid(&namespace).await?;

        let built = build_parameters(
            self.stores.secrets.as_ref(),
            &namespace,
            &instance.spec.parameters_from,
            instance.spec.parameters.as_ref(),
        )
        .await
        .map_err(|e| ControllerError::operation(REASON_ERROR_WITH_PARAMETERS, e.message()))?;

        let in_progress = InstancePropertiesState {
            service_plan_external_name: plan.spec.external_name.clone(),
            service_plan_external_id: plan.spec.external_id.clone(),
            parameters: built.as_ref().map(|b| b.redacted_value()),
            parameter_checksum: built.as_ref().map(|b| b.checksum.clone()),
            user_info: instance.spec.user_info.clone(),
        };
        Ok(InstanceRequestParts {
            parameters: built.map(|b| b.parameters),
            in_progress,
            namespace_uid,
            context: self.request_context(&namespace, &instance.name_any()),
            originating_identity,
        })
    }

    /// Everything a provision or update request is built from
    pub(crate) async fn prepare_instance_request(
        &self,
        instance: &ServiceInstance,
    ) -> Result<(ResolvedInstance, ServicePlan, InstanceRequestParts), ControllerError> {
        let resolved = self.resolve_instance(instance).await?;
        let plan = resolved.required_plan(instance)?;
        self.check_for_removed_class_and_plan(instance, &resolved.class, &plan)?;
        let parts = self.instance_request_parts(instance, &plan).await?;
        Ok((resolved, plan, parts))
    }

    /// Persist the start of `operation` and return the stored instance
    pub(crate) async fn record_start_of_instance_operation(
        &self,
        instance: &ServiceInstance,
        operation: InstanceOperation,
        in_progress: Option<InstancePropertiesState>,
    ) -> Result<ServiceInstance, ControllerError> {
        let mut updated = instance.clone();
        let now = self.now();
        let status = instance_status_mut(&mut updated);
        clear_current_operation(status);
        status.current_operation = Some(operation);
        status.operation_start_time = Some(now);
        status.in_progress_properties = in_progress;
        let (reason, message) = match operation {
            InstanceOperation::Provision => {
                status.deprovision_status = DeprovisionStatus::Required;
                (REASON_PROVISION_IN_FLIGHT, MESSAGE_PROVISION_IN_FLIGHT)
            }
            InstanceOperation::Update => (REASON_UPDATE_IN_FLIGHT, MESSAGE_UPDATE_IN_FLIGHT),
            InstanceOperation::Deprovision => (REASON_DEPROVISION_IN_FLIGHT, MESSAGE_DEPROVISION_IN_FLIGHT),
        };
        set_condition(&mut status.conditions, ConditionType::Ready, ConditionStatus::False, reason, message, now);
        info!(instance = %instance.name_any(), operation = ?operation, "starting instance operation");
        self.stores.instances.update_status(&updated).await
    }

    /// Record a retriable failure on Ready and hand back the error to return
    pub(crate) async fn instance_operation_error(
        &self,
        instance: &ServiceInstance,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) -> ControllerError {
        let mut updated = instance.clone();
        set_condition(
            &mut instance_status_mut(&mut updated).conditions,
            ConditionType::Ready,
            status,
            reason,
            message,
            self.now(),
        );
        if let Err(e) = self.stores.instances.update_status(&updated).await {
            return e;
        }
        self.event(instance, EventType::Warning, reason, message).await;
        ControllerError::operation(reason, message)
    }

    /// Surface an error carrying a reason on the Ready condition.
    ///
    /// Errors without a reason (store failures) are passed through as-is.
    pub(crate) async fn handle_instance_error(&self, instance: &ServiceInstance, err: ControllerError) -> ControllerError {
        let Some(reason) = err.reason().map(str::to_string) else {
            return err;
        };
        let deprovisioning = instance_status(instance).current_operation == Some(InstanceOperation::Deprovision)
            || instance.metadata.deletion_timestamp.is_some();
        let status = if deprovisioning {
            ConditionStatus::Unknown
        } else {
            ConditionStatus::False
        };
        warn!(instance = %instance.name_any(), reason = %reason, error = %err.message(), "instance reconciliation failed");
        self.instance_operation_error(instance, status, &reason, &err.message()).await
    }

    /// Bindings in the instance's namespace that refer to it
    pub(crate) async fn instance_bindings(&self, instance: &ServiceInstance) -> Result<Vec<ServiceBinding>, ControllerError> {
        let name = instance.name_any();
        let bindings = self
            .stores
            .bindings
            .list(Some(&instance.namespace().unwrap_or_default()), None)
            .await?;
        Ok(bindings.into_iter().filter(|b| b.spec.instance_ref.name == name).collect())
    }

    /// Queue the instance's bindings that are not ready yet
    pub(crate) async fn trigger_binding_reconciliation(&self, instance: &ServiceInstance) {
        let bindings = match self.instance_bindings(instance).await {
            Ok(bindings) => bindings,
            Err(e) => {
                warn!(instance = %instance.name_any(), error = %e, "unable to list bindings of instance");
                return;
            }
        };
        for binding in bindings {
            let ready = binding
                .status
                .as_ref()
                .and_then(|s| get_condition(&s.conditions, ConditionType::Ready))
                .is_some_and(|c| c.status == ConditionStatus::True);
            if ready {
                continue;
            }
            let key = object_key(&binding.namespace().unwrap_or_default(), &binding.name_any());
            debug!(binding = %key, "queueing binding after instance became ready");
            self.binding_queue.add(key);
        }
    }
}
