//! Polling the broker for an asynchronous bind or unbind.

use super::{
    MESSAGE_BINDING, MESSAGE_UNBINDING, REASON_ASYNC_OPERATION_TIMEOUT, REASON_BIND_CALL_FAILED,
    REASON_FETCHING_BINDING_FAILED, REASON_UNBIND_CALL_FAILED, REASON_BINDING, REASON_UNBINDING, binding_status,
    binding_status_mut,
};
use crate::error::ControllerError;
use crate::reconcile_helpers::set_condition;
use crate::reconciler::{
    DEFAULT_POLL_DELAY, MESSAGE_RECONCILIATION_RETRY_TIMEOUT, NO_DESCRIPTION, Outcome,
    REASON_ERROR_POLLING_LAST_OPERATION, REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT, Reconciler, poll_delay,
};
use crate::recorder::EventType;
use crate::store::object_key;
use catalog_crds::{BindingOperation, ConditionStatus, ConditionType, ServiceBinding};
use kube::ResourceExt;
use osb_client::{BindingLastOperationRequest, GetBindingRequest, LastOperationState};
use tracing::{debug, info, warn};

/// An unbind is being polled, for deletion or orphan mitigation
fn is_unbinding(binding: &ServiceBinding) -> bool {
    let status = binding_status(binding);
    status.current_operation == Some(BindingOperation::Unbind) || status.orphan_mitigation_in_progress
}

impl Reconciler {
    pub(super) async fn poll_binding(&self, binding: &ServiceBinding) -> Result<Outcome, ControllerError> {
        let key = object_key(&binding.namespace().unwrap_or_default(), &binding.name_any());
        let unbinding = is_unbinding(binding);
        let start = binding_status(binding).operation_start_time;
        debug!(binding = %key, unbinding, "polling binding last operation");

        let resolved = match self.resolve_binding(binding).await {
            Ok(resolved) => resolved,
            Err(e) if e.reason().is_none() => return Err(e),
            Err(e) => {
                warn!(binding = %key, error = %e, "unable to poll binding; will retry");
                if self.retry_window_elapsed(start) {
                    return Err(self.process_binding_polling_timeout(binding, unbinding).await);
                }
                return Ok(Outcome::Poll(DEFAULT_POLL_DELAY));
            }
        };
        let originating_identity = match self.originating_identity(binding.spec.user_info.as_ref()) {
            Ok(identity) => identity,
            Err(e) => return Err(self.handle_binding_error(binding, e).await),
        };

        let request = BindingLastOperationRequest {
            instance_id: resolved.instance.spec.external_id.clone(),
            binding_id: binding.spec.external_id.clone(),
            service_id: Some(resolved.class.spec.external_id.clone()),
            plan_id: Some(resolved.plan_external_id()).filter(|id| !id.is_empty()),
            operation_key: binding_status(binding).last_operation.clone(),
            originating_identity,
        };
        let result = resolved.client.poll_binding_last_operation(&request).await;
        self.observe(resolved.client.as_ref(), "poll_binding_last_operation", &result);

        let response = match result {
            Ok(response) => response,
            Err(e) if unbinding && e.is_gone() => {
                info!(binding = %key, "broker reports binding gone while polling unbind");
                return self.process_unbind_success(binding).await;
            }
            Err(e) => {
                let message = format!("Error polling last operation: {e}");
                warn!(binding = %key, error = %e, "error polling binding last operation");
                self.event(binding, EventType::Warning, REASON_ERROR_POLLING_LAST_OPERATION, &message)
                    .await;
                if self.retry_window_elapsed(start) {
                    return Err(self.process_binding_polling_timeout(binding, unbinding).await);
                }
                return Ok(Outcome::Poll(DEFAULT_POLL_DELAY));
            }
        };

        let description = response.description.as_deref().filter(|d| !d.is_empty());
        match response.state {
            LastOperationState::InProgress => {
                if self.retry_window_elapsed(start) {
                    return Err(self.process_binding_polling_timeout(binding, unbinding).await);
                }
                if let Some(description) = description {
                    let (reason, message) = if unbinding {
                        (REASON_UNBINDING, MESSAGE_UNBINDING)
                    } else {
                        (REASON_BINDING, MESSAGE_BINDING)
                    };
                    let message = format!("{message} ({description})");
                    let mut updated = binding.clone();
                    let changed = set_condition(
                        &mut binding_status_mut(&mut updated).conditions,
                        ConditionType::Ready,
                        ConditionStatus::False,
                        reason,
                        &message,
                        self.now(),
                    );
                    if changed {
                        self.stores.bindings.update_status(&updated).await?;
                    }
                }
                debug!(binding = %key, "binding operation still in progress");
                Ok(Outcome::Poll(poll_delay(response.poll_delay)))
            }
            LastOperationState::Succeeded if unbinding => self.process_unbind_success(binding).await,
            LastOperationState::Succeeded => {
                let request = GetBindingRequest {
                    instance_id: resolved.instance.spec.external_id.clone(),
                    binding_id: binding.spec.external_id.clone(),
                };
                let result = resolved.client.get_binding(&request).await;
                self.observe(resolved.client.as_ref(), "get_binding", &result);
                match result {
                    Ok(fetched) => self.complete_bind(binding, fetched.credentials.unwrap_or_default()).await,
                    Err(e) => {
                        let message = format!("Could not do a GET on binding resource: {e}");
                        Err(self
                            .process_bind_failure(
                                binding,
                                REASON_FETCHING_BINDING_FAILED,
                                &message,
                                Some((REASON_FETCHING_BINDING_FAILED, &message)),
                                true,
                            )
                            .await)
                    }
                }
            }
            LastOperationState::Failed => {
                let description = description.unwrap_or(NO_DESCRIPTION);
                if unbinding {
                    let message = format!("Unbind call failed: {description}");
                    return Err(self
                        .process_temporary_unbind_failure(binding, REASON_UNBIND_CALL_FAILED, &message, true)
                        .await);
                }
                let message = format!("Bind call failed: {description}");
                Err(self
                    .process_bind_failure(
                        binding,
                        REASON_BIND_CALL_FAILED,
                        &message,
                        Some((REASON_BIND_CALL_FAILED, &message)),
                        true,
                    )
                    .await)
            }
        }
    }

    /// The retry window closed while the asynchronous operation was unresolved
    async fn process_binding_polling_timeout(&self, binding: &ServiceBinding, unbinding: bool) -> ControllerError {
        let operation = if unbinding { "Unbind" } else { "Bind" };
        let message = format!("The asynchronous {operation} operation timed out and will not be retried");
        let failed_message = format!("{MESSAGE_RECONCILIATION_RETRY_TIMEOUT}: {message}");
        if unbinding {
            return self
                .process_unbind_failure(binding, REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT, &failed_message)
                .await;
        }
        self.process_bind_failure(
            binding,
            REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT,
            &failed_message,
            Some((REASON_ASYNC_OPERATION_TIMEOUT, &message)),
            true,
        )
        .await
    }
}
