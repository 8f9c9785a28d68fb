//! Polling the broker for the outcome of an asynchronous instance operation.

use super::{
    MESSAGE_DEPROVISIONING, MESSAGE_PROVISIONING, MESSAGE_UPDATING_INSTANCE, REASON_DEPROVISION_CALL_FAILED,
    REASON_DEPROVISIONING, REASON_PROVISION_CALL_FAILED, REASON_PROVISIONING, REASON_UPDATE_INSTANCE_CALL_FAILED,
    REASON_UPDATING_INSTANCE, instance_status, instance_status_mut,
};
use crate::error::ControllerError;
use crate::reconcile_helpers::set_condition;
use crate::reconciler::{
    MESSAGE_RECONCILIATION_RETRY_TIMEOUT, NO_DESCRIPTION, Outcome, REASON_ERROR_POLLING_LAST_OPERATION,
    REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT, Reconciler, is_terminal_http_status, poll_delay,
};
use crate::store::object_key;
use catalog_crds::{ConditionStatus, ConditionType, InstanceOperation, ServiceInstance};
use kube::ResourceExt;
use osb_client::{LastOperationRequest, LastOperationState};
use tracing::{debug, info, warn};

/// Which operation a poll is finishing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PolledOperation {
    Provision,
    Update,
    /// Deletion and orphan mitigation alike
    Deprovision,
}

fn polled_operation(instance: &ServiceInstance) -> PolledOperation {
    let status = instance_status(instance);
    match status.current_operation {
        _ if status.orphan_mitigation_in_progress => PolledOperation::Deprovision,
        Some(InstanceOperation::Deprovision) => PolledOperation::Deprovision,
        Some(InstanceOperation::Provision) => PolledOperation::Provision,
        Some(InstanceOperation::Update) | None => PolledOperation::Update,
    }
}

impl Reconciler {
    pub(super) async fn poll_instance(&self, instance: &ServiceInstance) -> Result<Outcome, ControllerError> {
        let key = object_key(&instance.namespace().unwrap_or_default(), &instance.name_any());
        let operation = polled_operation(instance);
        debug!(instance = %key, operation = ?operation, "polling last operation");

        let resolved = match self.resolve_instance(instance).await {
            Ok(resolved) => resolved,
            Err(e) => return Err(self.handle_instance_error(instance, e).await),
        };
        let originating_identity = match self.originating_identity(instance.spec.user_info.as_ref()) {
            Ok(identity) => identity,
            Err(e) => return Err(self.handle_instance_error(instance, e).await),
        };

        let status = instance_status(instance);
        let plan_id = status
            .in_progress_properties
            .as_ref()
            .map(|p| p.service_plan_external_id.clone())
            .filter(|id| !id.is_empty())
            .or_else(|| resolved.plan.as_ref().map(|p| p.spec.external_id.clone()));
        let request = LastOperationRequest {
            instance_id: instance.spec.external_id.clone(),
            service_id: Some(resolved.class.spec.external_id.clone()),
            plan_id,
            operation_key: status.last_operation.clone(),
            originating_identity,
        };

        let result = resolved.client.poll_last_operation(&request).await;
        self.observe(resolved.client.as_ref(), "poll_last_operation", &result);

        let response = match result {
            Ok(response) => response,
            Err(e) if operation == PolledOperation::Deprovision && e.is_gone() => {
                info!(instance = %key, "broker reports instance gone while polling deprovision");
                return self.process_deprovision_success(instance).await;
            }
            Err(e) => {
                let message = format!("Error polling last operation: {e}");
                if self.retry_window_elapsed(status.operation_start_time) {
                    return Err(self.process_terminal_polling_failure(instance, operation, &message).await);
                }
                if e.status_code().is_some_and(is_terminal_http_status) {
                    return Err(self.process_polling_failure(instance, operation, &message).await);
                }
                let ready = if operation == PolledOperation::Deprovision {
                    ConditionStatus::Unknown
                } else {
                    ConditionStatus::False
                };
                warn!(instance = %key, error = %e, "error polling last operation; will retry");
                return Err(self
                    .instance_operation_error(instance, ready, REASON_ERROR_POLLING_LAST_OPERATION, &message)
                    .await);
            }
        };

        let description = response.description.as_deref().filter(|d| !d.is_empty());
        match response.state {
            LastOperationState::InProgress => {
                if self.retry_window_elapsed(status.operation_start_time) {
                    let message = format!("Last operation still in progress: {}", description.unwrap_or(NO_DESCRIPTION));
                    return Err(self.process_terminal_polling_failure(instance, operation, &message).await);
                }
                if let Some(description) = description {
                    let (reason, message) = match operation {
                        PolledOperation::Provision => (REASON_PROVISIONING, MESSAGE_PROVISIONING),
                        PolledOperation::Update => (REASON_UPDATING_INSTANCE, MESSAGE_UPDATING_INSTANCE),
                        PolledOperation::Deprovision => (REASON_DEPROVISIONING, MESSAGE_DEPROVISIONING),
                    };
                    let message = format!("{message} ({description})");
                    let mut updated = instance.clone();
                    let changed = set_condition(
                        &mut instance_status_mut(&mut updated).conditions,
                        ConditionType::Ready,
                        ConditionStatus::False,
                        reason,
                        &message,
                        self.now(),
                    );
                    if changed {
                        self.stores.instances.update_status(&updated).await?;
                    }
                }
                debug!(instance = %key, "last operation still in progress");
                Ok(Outcome::Poll(poll_delay(response.poll_delay)))
            }
            LastOperationState::Succeeded => {
                info!(instance = %key, operation = ?operation, "asynchronous operation succeeded");
                match operation {
                    PolledOperation::Provision => self.handle_provision_success(instance, None).await,
                    PolledOperation::Update => self.handle_update_success(instance, None).await,
                    PolledOperation::Deprovision => self.process_deprovision_success(instance).await,
                }
            }
            LastOperationState::Failed => {
                let description = description.unwrap_or(NO_DESCRIPTION);
                match operation {
                    PolledOperation::Deprovision => {
                        let message = format!("Deprovision call failed: {description}");
                        Err(self
                            .process_temporary_deprovision_failure(instance, REASON_DEPROVISION_CALL_FAILED, &message, true)
                            .await)
                    }
                    PolledOperation::Provision => {
                        let message = format!("Provision call failed: {description}");
                        Err(self
                            .process_terminal_provision_failure(instance, REASON_PROVISION_CALL_FAILED, &message, true, true)
                            .await)
                    }
                    PolledOperation::Update => {
                        let message = format!("Update call failed: {description}");
                        Err(self
                            .process_terminal_update_failure(instance, REASON_UPDATE_INSTANCE_CALL_FAILED, &message)
                            .await)
                    }
                }
            }
        }
    }

    /// The broker rejected the poll itself
    async fn process_polling_failure(
        &self,
        instance: &ServiceInstance,
        operation: PolledOperation,
        message: &str,
    ) -> ControllerError {
        let reason = REASON_ERROR_POLLING_LAST_OPERATION;
        match operation {
            PolledOperation::Deprovision => self.process_deprovision_failure(instance, reason, message).await,
            PolledOperation::Provision => {
                self.process_terminal_provision_failure(instance, reason, message, true, true)
                    .await
            }
            PolledOperation::Update => self.process_terminal_update_failure(instance, reason, message).await,
        }
    }

    /// The retry window closed while the operation was still unresolved
    async fn process_terminal_polling_failure(
        &self,
        instance: &ServiceInstance,
        operation: PolledOperation,
        message: &str,
    ) -> ControllerError {
        let reason = REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT;
        let message = format!("{MESSAGE_RECONCILIATION_RETRY_TIMEOUT}: {message}");
        match operation {
            PolledOperation::Deprovision => self.process_deprovision_failure(instance, reason, &message).await,
            PolledOperation::Provision => {
                self.process_terminal_provision_failure(instance, reason, &message, true, true)
                    .await
            }
            PolledOperation::Update => self.process_terminal_update_failure(instance, reason, &message).await,
        }
    }
}
