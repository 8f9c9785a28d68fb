//! ServiceBinding reconciliation.
//!
//! Mirrors the instance reconciler: an outstanding asynchronous operation
//! is polled, a deleted or possibly orphaned binding is unbound, anything
//! else is bound. Credentials returned by the broker land in a Secret
//! owned by the binding (see [`secret`]).

mod bind;
mod poll;
mod secret;
mod unbind;

pub use secret::{CredentialValue, Credentials, apply_secret_transforms, evaluate_json_path};

use super::{
    Outcome, REASON_ASYNC_OPERATION_IN_PROGRESS, REASON_NONEXISTENT_INSTANCE, REASON_NONEXISTENT_SERVICE_CLASS,
    REASON_NONEXISTENT_SERVICE_PLAN, Reconciler,
};
use crate::error::ControllerError;
use crate::reconcile_helpers::{add_finalizer, generation, is_condition_true, is_deleting, remove_condition, set_condition};
use crate::recorder::EventType;
use crate::store::object_key;
use catalog_crds::{
    BindingOperation, BindingPropertiesState, ConditionStatus, ConditionType, FINALIZER_SERVICE_CATALOG,
    ServiceBinding, ServiceBindingStatus, ServiceClass, ServiceInstance, ServicePlan, UnbindStatus,
};
use kube::ResourceExt;
use osb_client::OsbClientTrait;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

pub const REASON_INJECTED_BIND_RESULT: &str = "InjectedBindResult";
pub const MESSAGE_INJECTED_BIND_RESULT: &str = "Injected bind result";
pub const REASON_UNBOUND_SUCCESSFULLY: &str = "UnboundSuccessfully";
pub const MESSAGE_UNBOUND_SUCCESSFULLY: &str = "The binding was deleted successfully";
pub const MESSAGE_ORPHAN_MITIGATION_SUCCESSFUL: &str = "Orphan mitigation was completed successfully";

pub const REASON_BIND_CALL_FAILED: &str = "BindCallFailed";
pub const REASON_BIND_RETURNED_FAILURE: &str = "ServiceBindingReturnedFailure";
pub const REASON_UNBIND_CALL_FAILED: &str = "UnbindCallFailed";
pub const REASON_ERROR_INJECTING_BIND_RESULT: &str = "ErrorInjectingBindResult";
pub const REASON_ERROR_EJECTING_BINDING: &str = "ErrorEjectingServiceBinding";
pub const REASON_ERROR_NONBINDABLE_SERVICE_CLASS: &str = "ErrorNonbindableServiceClass";
pub const REASON_ERROR_INSTANCE_REFS_UNRESOLVED: &str = "ErrorInstanceRefsUnresolved";
pub const REASON_ERROR_INSTANCE_NOT_READY: &str = "ErrorInstanceNotReady";
pub const REASON_FETCHING_BINDING_FAILED: &str = "FetchingBindingFailed";
pub const REASON_ASYNC_OPERATION_TIMEOUT: &str = "ErrorAsyncOperationTimeout";

pub const REASON_BINDING: &str = "Binding";
pub const MESSAGE_BINDING: &str = "The binding is being created asynchronously";
pub const REASON_UNBINDING: &str = "Unbinding";
pub const MESSAGE_UNBINDING: &str = "The binding is being deleted asynchronously";
pub const REASON_BIND_IN_FLIGHT: &str = "BindingRequestInFlight";
pub const MESSAGE_BIND_IN_FLIGHT: &str = "Binding request for ServiceBinding in-flight to Broker";
pub const REASON_UNBIND_IN_FLIGHT: &str = "UnbindingRequestInFlight";
pub const MESSAGE_UNBIND_IN_FLIGHT: &str = "Unbind request for ServiceBinding in-flight to Broker";
pub const REASON_NEEDS_ORPHAN_MITIGATION: &str = "ServiceBindingNeedsOrphanMitigation";
pub const MESSAGE_NEEDS_ORPHAN_MITIGATION: &str = "Starting orphan mitigation";

static EMPTY_STATUS: LazyLock<ServiceBindingStatus> = LazyLock::new(ServiceBindingStatus::default);

pub(crate) fn binding_status(binding: &ServiceBinding) -> &ServiceBindingStatus {
    binding.status.as_ref().unwrap_or(&EMPTY_STATUS)
}

pub(crate) fn binding_status_mut(binding: &mut ServiceBinding) -> &mut ServiceBindingStatus {
    binding.status.get_or_insert_with(Default::default)
}

/// The work one pass over a binding performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingAction {
    Bind,
    Unbind,
    Poll,
}

pub fn binding_action(binding: &ServiceBinding) -> BindingAction {
    let status = binding_status(binding);
    if status.async_op_in_progress {
        BindingAction::Poll
    } else if is_deleting(&binding.metadata) || status.orphan_mitigation_in_progress {
        BindingAction::Unbind
    } else {
        BindingAction::Bind
    }
}

/// The current generation was bound or failed, with no orphan pending
pub fn is_binding_processed(binding: &ServiceBinding) -> bool {
    let status = binding_status(binding);
    status.reconciled_generation >= generation(&binding.metadata) && !status.orphan_mitigation_in_progress
}

/// Same parameters and requesting user
pub fn binding_properties_equal(a: Option<&BindingPropertiesState>, b: Option<&BindingPropertiesState>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            a.parameter_checksum == b.parameter_checksum
                && a.user_info.as_ref().map(|u| &u.uid) == b.user_info.as_ref().map(|u| &u.uid)
        }
        _ => false,
    }
}

/// Plan bindability overrides the class
pub fn is_plan_bindable(class: &ServiceClass, plan: &ServicePlan) -> bool {
    plan.spec.bindable.unwrap_or(class.spec.bindable)
}

/// Drop the operation being driven and mark the generation reconciled.
///
/// A deleted binding keeps its reconciled generation so a failed unbind
/// does not read as a finished bind.
pub(crate) fn clear_binding_current_operation(binding: &mut ServiceBinding) {
    let deleting = is_deleting(&binding.metadata);
    let generation = generation(&binding.metadata);
    let status = binding_status_mut(binding);
    status.current_operation = None;
    status.operation_start_time = None;
    status.async_op_in_progress = false;
    status.last_operation = None;
    status.in_progress_properties = None;
    status.orphan_mitigation_in_progress = false;
    if !deleting {
        status.reconciled_generation = generation;
    }
}

fn set_last_operation(status: &mut ServiceBindingStatus, operation_key: Option<&str>) {
    if let Some(key) = operation_key.filter(|k| !k.is_empty()) {
        status.last_operation = Some(key.to_string());
    }
}

/// Instance, class, plan and broker client behind a binding
pub(crate) struct ResolvedBinding {
    pub(crate) instance: ServiceInstance,
    pub(crate) class: ServiceClass,
    /// Missing once the plan left the store; unbind falls back to the
    /// plan recorded on the instance
    pub(crate) plan: Option<ServicePlan>,
    pub(crate) broker_name: String,
    pub(crate) client: Arc<dyn OsbClientTrait>,
}

impl ResolvedBinding {
    /// External ID of the plan the instance was provisioned with
    pub(crate) fn plan_external_id(&self) -> String {
        self.instance
            .status
            .as_ref()
            .and_then(|s| s.external_properties.as_ref())
            .map(|p| p.service_plan_external_id.clone())
            .filter(|id| !id.is_empty())
            .or_else(|| self.plan.as_ref().map(|p| p.spec.external_id.clone()))
            .unwrap_or_default()
    }
}

/// Refuse to start a bind while the instance is busy or not ready
pub(crate) fn check_instance_bindable(binding: &ServiceBinding, resolved: &ResolvedBinding) -> Result<ServicePlan, ControllerError> {
    let instance = &resolved.instance;
    let instance_key = object_key(&instance.namespace().unwrap_or_default(), &instance.name_any());
    let status = instance.status.clone().unwrap_or_default();
    if status.async_op_in_progress {
        return Err(ControllerError::operation(
            REASON_ASYNC_OPERATION_IN_PROGRESS,
            format!("Ongoing Asynchronous operation on ServiceInstance {instance_key}; binding {} must wait", binding.name_any()),
        ));
    }
    let plan = resolved.plan.clone().ok_or_else(|| {
        ControllerError::operation(
            REASON_NONEXISTENT_SERVICE_PLAN,
            format!("Unable to get ServicePlan for ServiceInstance {instance_key}"),
        )
    })?;
    if !is_plan_bindable(&resolved.class, &plan) {
        return Err(ControllerError::terminal(
            REASON_ERROR_NONBINDABLE_SERVICE_CLASS,
            format!(
                "References a non-bindable ServiceClass {:?} and Plan {:?} combination",
                resolved.class.spec.external_name, plan.spec.external_name
            ),
        ));
    }
    if !is_condition_true(&status.conditions, ConditionType::Ready) {
        return Err(ControllerError::operation(
            REASON_ERROR_INSTANCE_NOT_READY,
            format!("Binding cannot begin because referenced ServiceInstance {instance_key} is not ready"),
        ));
    }
    Ok(plan)
}

impl Reconciler {
    /// Reconcile a ServiceBinding
    pub async fn reconcile_binding(&self, binding: &ServiceBinding) -> Result<Outcome, ControllerError> {
        let key = object_key(&binding.namespace().unwrap_or_default(), &binding.name_any());

        if binding.status.is_none() {
            debug!(binding = %key, "initializing status");
            let mut updated = binding.clone();
            if !is_deleting(&updated.metadata) && add_finalizer(&mut updated.metadata, FINALIZER_SERVICE_CATALOG) {
                updated = self.stores.bindings.update(&updated).await?;
            }
            updated.status = Some(ServiceBindingStatus {
                unbind_status: UnbindStatus::NotRequired,
                ..Default::default()
            });
            self.stores.bindings.update_status(&updated).await?;
            return Ok(Outcome::RequeueNow);
        }

        let action = binding_action(binding);
        debug!(binding = %key, action = ?action, "reconciling binding");
        match action {
            BindingAction::Bind => self.reconcile_binding_add(binding).await,
            BindingAction::Unbind => self.reconcile_binding_delete(binding).await,
            BindingAction::Poll => self.poll_binding(binding).await,
        }
    }

    /// The instance the binding refers to, or `None` when it does not exist
    pub(crate) async fn binding_instance(&self, binding: &ServiceBinding) -> Result<Option<ServiceInstance>, ControllerError> {
        super::fetch(
            self.stores.instances.as_ref(),
            &binding.namespace().unwrap_or_default(),
            &binding.spec.instance_ref.name,
        )
        .await
    }

    /// Look up the instance, its class and plan, and a client for the broker
    pub(crate) async fn resolve_binding(&self, binding: &ServiceBinding) -> Result<ResolvedBinding, ControllerError> {
        let namespace = binding.namespace().unwrap_or_default();
        let instance_name = &binding.spec.instance_ref.name;
        let instance = self.binding_instance(binding).await?.ok_or_else(|| {
            ControllerError::operation(
                REASON_NONEXISTENT_INSTANCE,
                format!("References a non-existent ServiceInstance {namespace}/{instance_name}"),
            )
        })?;

        let refs = instance.status.as_ref();
        let (Some(class_ref), plan_ref) = (
            refs.and_then(|s| s.service_class_ref.clone()),
            refs.and_then(|s| s.service_plan_ref.clone()),
        ) else {
            return Err(ControllerError::operation(
                REASON_ERROR_INSTANCE_REFS_UNRESOLVED,
                format!("Binding cannot begin because ServiceClass and ServicePlan references for ServiceInstance {namespace}/{instance_name} are not yet resolved"),
            ));
        };

        let class = super::fetch(self.stores.classes.as_ref(), &namespace, &class_ref.name)
            .await?
            .ok_or_else(|| {
                ControllerError::operation(
                    REASON_NONEXISTENT_SERVICE_CLASS,
                    format!(
                        "Unable to get ServiceClass {:?} for ServiceInstance {namespace}/{instance_name}",
                        class_ref.name
                    ),
                )
            })?;
        let plan = match plan_ref {
            Some(plan_ref) => super::fetch(self.stores.plans.as_ref(), &namespace, &plan_ref.name).await?,
            None => None,
        };

        let broker_name = class.spec.service_broker_name.clone();
        let client = self.broker_client_for(&namespace, &broker_name).await?;
        Ok(ResolvedBinding {
            instance,
            class,
            plan,
            broker_name,
            client,
        })
    }


    /// Persist the start of `operation` and return the stored binding
    pub(crate) async fn record_start_of_binding_operation(
        &self,
        binding: &ServiceBinding,
        operation: BindingOperation,
        in_progress: Option<BindingPropertiesState>,
    ) -> Result<ServiceBinding, ControllerError> {
        let mut updated = binding.clone();
        let now = self.now();
        let status = binding_status_mut(&mut updated);
        status.current_operation = Some(operation);
        status.operation_start_time = Some(now);
        status.async_op_in_progress = false;
        status.last_operation = None;
        status.in_progress_properties = in_progress;
        let (reason, message) = match operation {
            BindingOperation::Bind => {
                status.unbind_status = UnbindStatus::Required;
                remove_condition(&mut status.conditions, ConditionType::Failed);
                (REASON_BIND_IN_FLIGHT, MESSAGE_BIND_IN_FLIGHT)
            }
            BindingOperation::Unbind => (REASON_UNBIND_IN_FLIGHT, MESSAGE_UNBIND_IN_FLIGHT),
        };
        set_condition(&mut status.conditions, ConditionType::Ready, ConditionStatus::False, reason, message, now);
        info!(binding = %binding.name_any(), operation = ?operation, "starting binding operation");
        self.stores.bindings.update_status(&updated).await
    }

    /// Record a retriable failure on Ready and hand back the error to return
    pub(crate) async fn binding_operation_error(
        &self,
        binding: &ServiceBinding,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) -> ControllerError {
        let mut updated = binding.clone();
        set_condition(
            &mut binding_status_mut(&mut updated).conditions,
            ConditionType::Ready,
            status,
            reason,
            message,
            self.now(),
        );
        if let Err(e) = self.stores.bindings.update_status(&updated).await {
            return e;
        }
        self.event(binding, EventType::Warning, reason, message).await;
        ControllerError::operation(reason, message)
    }

    /// Surface an error carrying a reason on the Ready condition.
    ///
    /// Terminal errors fail the bind on this generation; errors without a
    /// reason pass through untouched.
    pub(crate) async fn handle_binding_error(&self, binding: &ServiceBinding, err: ControllerError) -> ControllerError {
        let Some(reason) = err.reason().map(str::to_string) else {
            return err;
        };
        let message = err.message();
        if err.is_terminal() {
            return self
                .process_bind_failure(binding, &reason, &message, Some((&reason, &message)), false)
                .await;
        }
        let unbinding = binding_status(binding).current_operation == Some(BindingOperation::Unbind)
            || is_deleting(&binding.metadata)
            || binding_status(binding).orphan_mitigation_in_progress;
        let status = if unbinding {
            ConditionStatus::Unknown
        } else {
            ConditionStatus::False
        };
        warn!(binding = %binding.name_any(), reason = %reason, error = %message, "binding reconciliation failed");
        self.binding_operation_error(binding, status, &reason, &message).await
    }
}
