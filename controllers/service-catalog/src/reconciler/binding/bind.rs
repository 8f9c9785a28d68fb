//! Binding: requesting credentials from the broker and injecting them.

use super::{
    MESSAGE_BINDING, MESSAGE_INJECTED_BIND_RESULT, MESSAGE_NEEDS_ORPHAN_MITIGATION, REASON_BIND_CALL_FAILED,
    REASON_BIND_RETURNED_FAILURE, REASON_BINDING, REASON_ERROR_INJECTING_BIND_RESULT, REASON_INJECTED_BIND_RESULT,
    REASON_NEEDS_ORPHAN_MITIGATION, ResolvedBinding, binding_properties_equal, binding_status, binding_status_mut,
    check_instance_bindable, clear_binding_current_operation, is_binding_processed, set_last_operation,
};
use crate::error::ControllerError;
use crate::parameters::build_parameters;
use crate::reconcile_helpers::{is_deleting, set_condition};
use crate::reconciler::{
    DEFAULT_POLL_DELAY, MESSAGE_RECONCILIATION_RETRY_TIMEOUT, Outcome, REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT,
    REASON_ERROR_WITH_PARAMETERS, Reconciler, should_start_orphan_mitigation,
};
use crate::recorder::EventType;
use crate::store::object_key;
use catalog_crds::{
    BindingOperation, BindingPropertiesState, ConditionStatus, ConditionType, ServiceBinding, UnbindStatus,
};
use kube::ResourceExt;
use osb_client::{BindRequest, BindResource, JsonMap, OriginatingIdentity, OsbError};
use tracing::{debug, info, warn};

/// Values a bind request is built from
struct BindingRequestParts {
    parameters: Option<JsonMap>,
    in_progress: BindingPropertiesState,
    namespace_uid: String,
    originating_identity: Option<OriginatingIdentity>,
}

impl Reconciler {
    pub(super) async fn reconcile_binding_add(&self, binding: &ServiceBinding) -> Result<Outcome, ControllerError> {
        let key = object_key(&binding.namespace().unwrap_or_default(), &binding.name_any());
        if is_binding_processed(binding) {
            debug!(binding = %key, "binding already processed on this generation");
            return Ok(Outcome::Done);
        }

        let resolved = match self.resolve_binding(binding).await {
            Ok(resolved) => resolved,
            Err(e) => return Err(self.handle_binding_error(binding, e).await),
        };
        let plan = match check_instance_bindable(binding, &resolved) {
            Ok(plan) => plan,
            Err(e) => return Err(self.handle_binding_error(binding, e).await),
        };
        let parts = match self.binding_request_parts(binding).await {
            Ok(parts) => parts,
            Err(e) => return Err(self.handle_binding_error(binding, e).await),
        };

        let status = binding_status(binding);
        if status.current_operation != Some(BindingOperation::Bind)
            || !binding_properties_equal(status.in_progress_properties.as_ref(), Some(&parts.in_progress))
        {
            self.record_start_of_binding_operation(binding, BindingOperation::Bind, Some(parts.in_progress))
                .await?;
            return Ok(Outcome::RequeueNow);
        }

        let instance = &resolved.instance;
        let request = BindRequest {
            binding_id: binding.spec.external_id.clone(),
            instance_id: instance.spec.external_id.clone(),
            accepts_incomplete: resolved.class.spec.binding_retrievable,
            service_id: resolved.class.spec.external_id.clone(),
            plan_id: plan.spec.external_id.clone(),
            app_guid: Some(parts.namespace_uid.clone()),
            bind_resource: Some(BindResource {
                app_guid: Some(parts.namespace_uid),
                route: None,
            }),
            parameters: parts.parameters,
            context: self.request_context(&instance.namespace().unwrap_or_default(), &instance.name_any()),
            originating_identity: parts.originating_identity,
        };

        info!(
            binding = %key,
            instance = %instance.name_any(),
            broker = %resolved.broker_name,
            "binding"
        );
        let result = resolved.client.bind(&request).await;
        self.observe(resolved.client.as_ref(), "bind", &result);

        match result {
            Ok(response) if response.is_async => {
                let mut updated = binding.clone();
                let now = self.now();
                let status = binding_status_mut(&mut updated);
                set_last_operation(status, response.operation_key.as_deref());
                status.async_op_in_progress = true;
                set_condition(
                    &mut status.conditions,
                    ConditionType::Ready,
                    ConditionStatus::False,
                    REASON_BINDING,
                    MESSAGE_BINDING,
                    now,
                );
                self.stores.bindings.update_status(&updated).await?;
                self.event(binding, EventType::Normal, REASON_BINDING, MESSAGE_BINDING).await;
                Ok(Outcome::Poll(DEFAULT_POLL_DELAY))
            }
            Ok(response) => self.complete_bind(binding, response.credentials.unwrap_or_default()).await,
            Err(e) => Err(self.handle_bind_error(binding, &resolved, &e).await),
        }
    }

    async fn binding_request_parts(&self, binding: &ServiceBinding) -> Result<BindingRequestParts, ControllerError> {
        let namespace = binding.namespace().unwrap_or_default();
        let originating_identity = self.originating_identity(binding.spec.user_info.as_ref())?;
        let built = build_parameters(
            self.stores.secrets.as_ref(),
            &namespace,
            &binding.spec.parameters_from,
            binding.spec.parameters.as_ref(),
        )
        .await
        .map_err(|e| ControllerError::operation(REASON_ERROR_WITH_PARAMETERS, e.message()))?;
        let namespace_uid = self.namespace_uid(&namespace).await?;

        let in_progress = BindingPropertiesState {
            parameters: built.as_ref().map(|b| b.redacted_value()),
            parameter_checksum: built.as_ref().map(|b| b.checksum.clone()),
            user_info: binding.spec.user_info.clone(),
        };
        Ok(BindingRequestParts {
            parameters: built.map(|b| b.parameters),
            in_progress,
            namespace_uid,
            originating_identity,
        })
    }

    /// Inject the credentials of a finished bind, from the call or a poll
    pub(super) async fn complete_bind(
        &self,
        binding: &ServiceBinding,
        credentials: JsonMap,
    ) -> Result<Outcome, ControllerError> {
        let mut updated = binding.clone();
        let status = binding_status_mut(&mut updated);
        status.external_properties = status.in_progress_properties.clone();

        if let Err(e) = self.inject_binding_credentials(&updated, credentials).await {
            let message = format!("Error injecting bind result: {}", e.message());
            if e.is_terminal() || self.retry_window_elapsed(binding_status(binding).operation_start_time) {
                let (reason, failed_message) = if e.is_terminal() {
                    (REASON_ERROR_INJECTING_BIND_RESULT, message.clone())
                } else {
                    (
                        REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT,
                        format!("{MESSAGE_RECONCILIATION_RETRY_TIMEOUT}: {message}"),
                    )
                };
                return Err(self
                    .process_bind_failure(
                        &updated,
                        reason,
                        &failed_message,
                        Some((REASON_ERROR_INJECTING_BIND_RESULT, &message)),
                        true,
                    )
                    .await);
            }
            warn!(binding = %binding.name_any(), error = %e, "failed to inject bind result; will retry");
            return Err(self
                .binding_operation_error(&updated, ConditionStatus::False, REASON_ERROR_INJECTING_BIND_RESULT, &message)
                .await);
        }
        self.process_bind_success(&updated).await
    }

    async fn process_bind_success(&self, binding: &ServiceBinding) -> Result<Outcome, ControllerError> {
        let mut updated = binding.clone();
        set_condition(
            &mut binding_status_mut(&mut updated).conditions,
            ConditionType::Ready,
            ConditionStatus::True,
            REASON_INJECTED_BIND_RESULT,
            MESSAGE_INJECTED_BIND_RESULT,
            self.now(),
        );
        clear_binding_current_operation(&mut updated);
        self.stores.bindings.update_status(&updated).await?;
        info!(binding = %binding.name_any(), secret = %binding.spec.secret_name, "bind result injected");
        self.event(binding, EventType::Normal, REASON_INJECTED_BIND_RESULT, MESSAGE_INJECTED_BIND_RESULT)
            .await;
        // Deleted while the bind was in flight: unbind right away
        if is_deleting(&binding.metadata) {
            return Ok(Outcome::RequeueNow);
        }
        Ok(Outcome::Done)
    }

    async fn handle_bind_error(&self, binding: &ServiceBinding, resolved: &ResolvedBinding, err: &OsbError) -> ControllerError {
        let instance_key = object_key(
            &resolved.instance.namespace().unwrap_or_default(),
            &resolved.instance.name_any(),
        );
        let message = format!(
            "Error creating ServiceBinding for ServiceInstance {instance_key} of ServiceClass {:?} at ServiceBroker {:?}: {err}",
            resolved.class.spec.external_name, resolved.broker_name
        );

        if let Some(code) = err.status_code() {
            let failed = format!("ServiceBroker returned failure; bind operation will not be retried: {message}");
            return self
                .process_bind_failure(
                    binding,
                    REASON_BIND_RETURNED_FAILURE,
                    &failed,
                    Some((REASON_BIND_CALL_FAILED, &message)),
                    should_start_orphan_mitigation(code),
                )
                .await;
        }
        if err.is_timeout() {
            let message = format!("Communication with the ServiceBroker timed out; Bind operation will not be retried: {err}");
            return self
                .process_bind_failure(binding, REASON_BIND_CALL_FAILED, &message, Some((REASON_BIND_CALL_FAILED, &message)), true)
                .await;
        }
        if self.retry_window_elapsed(binding_status(binding).operation_start_time) {
            let failed = format!("{MESSAGE_RECONCILIATION_RETRY_TIMEOUT}: {message}");
            return self
                .process_bind_failure(
                    binding,
                    REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT,
                    &failed,
                    Some((REASON_BIND_CALL_FAILED, &message)),
                    false,
                )
                .await;
        }
        warn!(binding = %binding.name_any(), error = %err, "bind call failed; will retry");
        self.binding_operation_error(binding, ConditionStatus::False, REASON_BIND_CALL_FAILED, &message)
            .await
    }

    /// Fail the bind on this generation.
    ///
    /// With `orphan_mitigation` the broker may hold a binding we never
    /// received, so the next pass unbinds it; the returned error is then
    /// retriable. Otherwise the operation is dropped for good.
    pub(super) async fn process_bind_failure(
        &self,
        binding: &ServiceBinding,
        failed_reason: &str,
        failed_message: &str,
        ready: Option<(&str, &str)>,
        orphan_mitigation: bool,
    ) -> ControllerError {
        let mut updated = binding.clone();
        let now = self.now();
        let status = binding_status_mut(&mut updated);
        if let Some((reason, message)) = ready {
            set_condition(&mut status.conditions, ConditionType::Ready, ConditionStatus::False, reason, message, now);
        }
        set_condition(
            &mut status.conditions,
            ConditionType::Failed,
            ConditionStatus::True,
            failed_reason,
            failed_message,
            now,
        );
        if orphan_mitigation {
            set_condition(
                &mut status.conditions,
                ConditionType::Ready,
                ConditionStatus::False,
                REASON_NEEDS_ORPHAN_MITIGATION,
                MESSAGE_NEEDS_ORPHAN_MITIGATION,
                now,
            );
            status.orphan_mitigation_in_progress = true;
            status.async_op_in_progress = false;
            status.operation_start_time = None;
            status.in_progress_properties = None;
            status.unbind_status = UnbindStatus::Required;
        } else {
            clear_binding_current_operation(&mut updated);
            // The broker never holds a binding for a rejected bind
            binding_status_mut(&mut updated).unbind_status = UnbindStatus::NotRequired;
        }

        if let Err(e) = self.stores.bindings.update_status(&updated).await {
            return e;
        }
        warn!(binding = %binding.name_any(), reason = failed_reason, orphan_mitigation, "bind failed: {failed_message}");
        if let Some((reason, message)) = ready {
            self.event(binding, EventType::Warning, reason, message).await;
        }
        self.event(binding, EventType::Warning, failed_reason, failed_message).await;
        if orphan_mitigation {
            self.event(
                binding,
                EventType::Warning,
                REASON_NEEDS_ORPHAN_MITIGATION,
                MESSAGE_NEEDS_ORPHAN_MITIGATION,
            )
            .await;
            ControllerError::operation(failed_reason, failed_message)
        } else {
            ControllerError::terminal(failed_reason, failed_message)
        }
    }
}
