//! Unbinding, for deleted bindings and for orphan mitigation.

use super::{
    MESSAGE_ORPHAN_MITIGATION_SUCCESSFUL, MESSAGE_UNBINDING, MESSAGE_UNBOUND_SUCCESSFULLY, REASON_ERROR_EJECTING_BINDING,
    REASON_UNBIND_CALL_FAILED, REASON_UNBINDING, REASON_UNBOUND_SUCCESSFULLY, binding_status, binding_status_mut,
    clear_binding_current_operation, set_last_operation,
};
use crate::error::ControllerError;
use crate::reconcile_helpers::{has_finalizer, is_deleting, remove_finalizer, set_condition};
use crate::reconciler::{
    DEFAULT_POLL_DELAY, MESSAGE_RECONCILIATION_RETRY_TIMEOUT, Outcome, REASON_ASYNC_OPERATION_IN_PROGRESS,
    REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT, REASON_ORPHAN_MITIGATION_FAILED, REASON_ORPHAN_MITIGATION_SUCCESSFUL,
    Reconciler, is_terminal_http_status,
};
use crate::recorder::EventType;
use crate::store::object_key;
use catalog_crds::{
    BindingOperation, ConditionStatus, ConditionType, FINALIZER_SERVICE_CATALOG, ServiceBinding, UnbindStatus,
};
use kube::ResourceExt;
use osb_client::{OsbError, UnbindRequest};
use tracing::{debug, info, warn};

impl Reconciler {
    pub(super) async fn reconcile_binding_delete(&self, binding: &ServiceBinding) -> Result<Outcome, ControllerError> {
        let key = object_key(&binding.namespace().unwrap_or_default(), &binding.name_any());
        if !has_finalizer(&binding.metadata, FINALIZER_SERVICE_CATALOG) {
            debug!(binding = %key, "no finalizer; nothing to unbind");
            return Ok(Outcome::Done);
        }
        let status = binding_status(binding);
        match status.unbind_status {
            UnbindStatus::Failed => {
                debug!(binding = %key, "unbind failed earlier; waiting for intervention");
                return Ok(Outcome::Done);
            }
            UnbindStatus::NotRequired | UnbindStatus::Succeeded => {
                debug!(binding = %key, "unbind not required");
                let mut updated = binding.clone();
                if !is_deleting(&updated.metadata) {
                    clear_binding_current_operation(&mut updated);
                    self.stores.bindings.update_status(&updated).await?;
                    return Ok(Outcome::Done);
                }
                self.finish_binding_deletion(&updated).await?;
                return Ok(Outcome::Done);
            }
            UnbindStatus::Required => {}
        }

        if let Err(e) = self.eject_binding_credentials(binding).await {
            let message = format!("Error deleting secret: {}", e.message());
            return Err(self
                .binding_operation_error(binding, ConditionStatus::Unknown, REASON_ERROR_EJECTING_BINDING, &message)
                .await);
        }

        let mut binding = binding.clone();
        let orphan_mitigation = status.orphan_mitigation_in_progress;
        if orphan_mitigation && !is_deleting(&binding.metadata) {
            if status.operation_start_time.is_none() {
                binding_status_mut(&mut binding).operation_start_time = Some(self.now());
            }
        } else if status.current_operation != Some(BindingOperation::Unbind) {
            binding_status_mut(&mut binding).orphan_mitigation_in_progress = false;
            self.record_start_of_binding_operation(&binding, BindingOperation::Unbind, None)
                .await?;
            return Ok(Outcome::RequeueNow);
        }

        let resolved = match self.resolve_binding(&binding).await {
            Ok(resolved) => resolved,
            Err(e) => return Err(self.handle_unbind_precondition_error(&binding, e).await),
        };
        if resolved.instance.status.as_ref().is_some_and(|s| s.async_op_in_progress) {
            let err = ControllerError::operation(
                REASON_ASYNC_OPERATION_IN_PROGRESS,
                format!(
                    "Ongoing Asynchronous operation on ServiceInstance {}; unbinding must wait",
                    resolved.instance.name_any()
                ),
            );
            return Err(self.handle_binding_error(&binding, err).await);
        }
        let originating_identity = match self.originating_identity(binding.spec.user_info.as_ref()) {
            Ok(identity) => identity,
            Err(e) => return Err(self.handle_binding_error(&binding, e).await),
        };

        let request = UnbindRequest {
            binding_id: binding.spec.external_id.clone(),
            instance_id: resolved.instance.spec.external_id.clone(),
            accepts_incomplete: resolved.class.spec.binding_retrievable,
            service_id: resolved.class.spec.external_id.clone(),
            plan_id: resolved.plan_external_id(),
            originating_identity,
        };

        info!(binding = %key, broker = %resolved.broker_name, orphan_mitigation, "unbinding");
        let result = resolved.client.unbind(&request).await;
        self.observe(resolved.client.as_ref(), "unbind", &result);

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
                    REASON_UNBINDING,
                    MESSAGE_UNBINDING,
                    now,
                );
                self.stores.bindings.update_status(&updated).await?;
                self.event(&binding, EventType::Normal, REASON_UNBINDING, MESSAGE_UNBINDING).await;
                Ok(Outcome::Poll(DEFAULT_POLL_DELAY))
            }
            Ok(_) => self.process_unbind_success(&binding).await,
            Err(e) if e.is_gone() => {
                debug!(binding = %key, "broker reports binding gone");
                self.process_unbind_success(&binding).await
            }
            Err(e) => Err(self.handle_unbind_error(&binding, &resolved.broker_name, &e).await),
        }
    }

    /// The instance, class or broker needed for the unbind is unavailable
    async fn handle_unbind_precondition_error(&self, binding: &ServiceBinding, err: ControllerError) -> ControllerError {
        let Some(reason) = err.reason().map(str::to_string) else {
            return err;
        };
        if self.retry_window_elapsed(binding_status(binding).operation_start_time) {
            let message = format!("{MESSAGE_RECONCILIATION_RETRY_TIMEOUT}: {}", err.message());
            warn!(binding = %binding.name_any(), reason = %reason, "giving up on unbind");
            return self
                .process_unbind_failure(binding, REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT, &message)
                .await;
        }
        self.handle_binding_error(binding, err).await
    }

    async fn handle_unbind_error(&self, binding: &ServiceBinding, broker_name: &str, err: &OsbError) -> ControllerError {
        let message = if err.status_code().is_some() {
            format!("Unbind call failed; received error response from broker {broker_name:?}: {err}")
        } else {
            format!("Error unbinding from ServiceBroker {broker_name:?}: {err}")
        };
        if err.status_code().is_some_and(is_terminal_http_status) {
            return self.process_unbind_failure(binding, REASON_UNBIND_CALL_FAILED, &message).await;
        }
        self.process_temporary_unbind_failure(binding, REASON_UNBIND_CALL_FAILED, &message, false)
            .await
    }

    /// Record a completed unbind, from the call itself or a poll
    pub(super) async fn process_unbind_success(&self, binding: &ServiceBinding) -> Result<Outcome, ControllerError> {
        let mut updated = binding.clone();
        let orphan_mitigation = binding_status(binding).orphan_mitigation_in_progress;
        let (reason, message) = if orphan_mitigation {
            (REASON_ORPHAN_MITIGATION_SUCCESSFUL, MESSAGE_ORPHAN_MITIGATION_SUCCESSFUL)
        } else {
            (REASON_UNBOUND_SUCCESSFULLY, MESSAGE_UNBOUND_SUCCESSFULLY)
        };
        set_condition(
            &mut binding_status_mut(&mut updated).conditions,
            ConditionType::Ready,
            ConditionStatus::False,
            reason,
            message,
            self.now(),
        );
        clear_binding_current_operation(&mut updated);
        let status = binding_status_mut(&mut updated);
        status.external_properties = None;
        status.unbind_status = UnbindStatus::Succeeded;

        if orphan_mitigation && !is_deleting(&updated.metadata) {
            self.stores.bindings.update_status(&updated).await?;
        } else {
            self.finish_binding_deletion(&updated).await?;
        }
        info!(binding = %binding.name_any(), reason, "binding unbound");
        self.event(binding, EventType::Normal, reason, message).await;
        Ok(Outcome::Done)
    }

    /// Persist status and, for a deleted binding, release it
    async fn finish_binding_deletion(&self, binding: &ServiceBinding) -> Result<(), ControllerError> {
        let mut updated = self.stores.bindings.update_status(binding).await?;
        if is_deleting(&updated.metadata) && remove_finalizer(&mut updated.metadata, FINALIZER_SERVICE_CATALOG) {
            match self.stores.bindings.update(&updated).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            debug!(binding = %binding.name_any(), "removed finalizer");
        }
        Ok(())
    }

    /// Surface a retriable unbind failure, escalating once the retry
    /// window has closed.
    ///
    /// `clear_async` makes the next pass send a new unbind request instead
    /// of polling the failed one.
    pub(super) async fn process_temporary_unbind_failure(
        &self,
        binding: &ServiceBinding,
        reason: &str,
        message: &str,
        clear_async: bool,
    ) -> ControllerError {
        if self.retry_window_elapsed(binding_status(binding).operation_start_time) {
            let message = format!("{MESSAGE_RECONCILIATION_RETRY_TIMEOUT}: {message}");
            return self
                .process_unbind_failure(binding, REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT, &message)
                .await;
        }
        let mut updated = binding.clone();
        if clear_async {
            let status = binding_status_mut(&mut updated);
            status.async_op_in_progress = false;
            status.last_operation = None;
        }
        warn!(binding = %binding.name_any(), reason, "unbind failed; will retry: {message}");
        self.binding_operation_error(&updated, ConditionStatus::Unknown, reason, message)
            .await
    }

    /// Give up on unbinding; the finalizer stays for an operator
    pub(super) async fn process_unbind_failure(
        &self,
        binding: &ServiceBinding,
        reason: &str,
        message: &str,
    ) -> ControllerError {
        let mut updated = binding.clone();
        let now = self.now();
        let status = binding_status_mut(&mut updated);
        let (reason, message) = if status.orphan_mitigation_in_progress {
            let message = format!("Orphan mitigation failed: {message}");
            set_condition(
                &mut status.conditions,
                ConditionType::Ready,
                ConditionStatus::Unknown,
                REASON_ORPHAN_MITIGATION_FAILED,
                &message,
                now,
            );
            (REASON_ORPHAN_MITIGATION_FAILED.to_string(), message)
        } else {
            set_condition(&mut status.conditions, ConditionType::Ready, ConditionStatus::Unknown, reason, message, now);
            set_condition(&mut status.conditions, ConditionType::Failed, ConditionStatus::True, reason, message, now);
            (reason.to_string(), message.to_string())
        };
        clear_binding_current_operation(&mut updated);
        binding_status_mut(&mut updated).unbind_status = UnbindStatus::Failed;

        if let Err(e) = self.stores.bindings.update_status(&updated).await {
            return e;
        }
        warn!(binding = %binding.name_any(), reason = %reason, "unbind failed: {message}");
        self.event(binding, EventType::Warning, &reason, &message).await;
        ControllerError::terminal(reason, message)
    }
}
