//! Updating a provisioned instance after its spec changed.

use super::{
    MESSAGE_INSTANCE_UPDATED_SUCCESSFULLY, MESSAGE_UPDATING_INSTANCE, REASON_ERROR_CALLING_UPDATE_INSTANCE,
    REASON_INSTANCE_UPDATED_SUCCESSFULLY, REASON_UPDATE_INSTANCE_CALL_FAILED, REASON_UPDATING_INSTANCE,
    clear_async_operation, clear_current_operation, instance_properties_equal, instance_status, instance_status_mut,
    is_instance_processed, prepare_observed_generation, set_dashboard_url, set_last_operation,
};
use crate::error::ControllerError;
use crate::reconcile_helpers::{generation, set_condition};
use crate::reconciler::{
    DEFAULT_POLL_DELAY, MESSAGE_RECONCILIATION_RETRY_TIMEOUT, Outcome, REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT,
    Reconciler, is_terminal_http_status,
};
use crate::recorder::EventType;
use crate::store::object_key;
use catalog_crds::{ConditionStatus, ConditionType, InstanceOperation, ServiceInstance};
use kube::ResourceExt;
use osb_client::{OsbError, PreviousValues, UpdateInstanceRequest};
use tracing::{debug, info, warn};

impl Reconciler {
    pub(super) async fn reconcile_instance_update(&self, instance: &ServiceInstance) -> Result<Outcome, ControllerError> {
        let key = object_key(&instance.namespace().unwrap_or_default(), &instance.name_any());
        if is_instance_processed(instance) {
            debug!(instance = %key, "instance already processed on this generation");
            return Ok(Outcome::Done);
        }

        let mut instance = instance.clone();
        if instance_status(&instance).observed_generation != generation(&instance.metadata) {
            prepare_observed_generation(&mut instance);
        }
        if self.resolve_instance_references(&mut instance).await? {
            return Ok(Outcome::RequeueNow);
        }

        let (resolved, plan, parts) = match self.prepare_instance_request(&instance).await {
            Ok(prepared) => prepared,
            Err(e) => return Err(self.handle_instance_error(&instance, e).await),
        };

        let status = instance_status(&instance);
        if status.current_operation != Some(InstanceOperation::Update)
            || !instance_properties_equal(status.in_progress_properties.as_ref(), Some(&parts.in_progress))
        {
            self.record_start_of_instance_operation(&instance, InstanceOperation::Update, Some(parts.in_progress))
                .await?;
            return Ok(Outcome::RequeueNow);
        }

        // Only what changed since the last successful operation is sent.
        let external = status.external_properties.as_ref();
        let previous_plan_id = external.map(|p| p.service_plan_external_id.clone());
        let plan_changed = previous_plan_id.as_deref() != Some(plan.spec.external_id.as_str());
        let parameters_changed =
            external.and_then(|p| p.parameter_checksum.as_deref()) != parts.in_progress.parameter_checksum.as_deref();

        let request = UpdateInstanceRequest {
            instance_id: instance.spec.external_id.clone(),
            accepts_incomplete: true,
            service_id: resolved.class.spec.external_id.clone(),
            plan_id: plan_changed.then(|| plan.spec.external_id.clone()),
            parameters: if parameters_changed {
                Some(parts.parameters.unwrap_or_default())
            } else {
                None
            },
            previous_values: Some(PreviousValues {
                plan_id: previous_plan_id,
                service_id: Some(resolved.class.spec.external_id.clone()),
            }),
            context: parts.context,
            originating_identity: parts.originating_identity,
        };

        info!(
            instance = %key,
            broker = %resolved.broker_name,
            plan_changed,
            parameters_changed,
            "updating instance"
        );
        let result = resolved.client.update_instance(&request).await;
        self.observe(resolved.client.as_ref(), "update_instance", &result);

        match result {
            Ok(response) if response.is_async => {
                let mut updated = instance.clone();
                let now = self.now();
                let status = instance_status_mut(&mut updated);
                if self.config.update_dashboard_url {
                    set_dashboard_url(status, response.dashboard_url.as_deref());
                }
                set_last_operation(status, response.operation_key.as_deref());
                status.async_op_in_progress = true;
                set_condition(
                    &mut status.conditions,
                    ConditionType::Ready,
                    ConditionStatus::False,
                    REASON_UPDATING_INSTANCE,
                    MESSAGE_UPDATING_INSTANCE,
                    now,
                );
                self.stores.instances.update_status(&updated).await?;
                self.event(&instance, EventType::Normal, REASON_UPDATING_INSTANCE, MESSAGE_UPDATING_INSTANCE)
                    .await;
                Ok(Outcome::Poll(DEFAULT_POLL_DELAY))
            }
            Ok(response) => {
                let dashboard_url = response
                    .dashboard_url
                    .as_deref()
                    .filter(|_| self.config.update_dashboard_url);
                self.handle_update_success(&instance, dashboard_url).await
            }
            Err(e) => Err(self.handle_update_error(&instance, &resolved.broker_name, &e).await),
        }
    }

    /// Record a completed update, from the call itself or a poll
    pub(super) async fn handle_update_success(
        &self,
        instance: &ServiceInstance,
        dashboard_url: Option<&str>,
    ) -> Result<Outcome, ControllerError> {
        let mut updated = instance.clone();
        let now = self.now();
        let status = instance_status_mut(&mut updated);
        set_dashboard_url(status, dashboard_url);
        set_condition(
            &mut status.conditions,
            ConditionType::Ready,
            ConditionStatus::True,
            REASON_INSTANCE_UPDATED_SUCCESSFULLY,
            MESSAGE_INSTANCE_UPDATED_SUCCESSFULLY,
            now,
        );
        status.external_properties = status.in_progress_properties.take();
        clear_current_operation(status);
        status.reconciled_generation = status.observed_generation;

        let updated = self.stores.instances.update_status(&updated).await?;
        info!(instance = %updated.name_any(), "instance updated");
        self.event(
            instance,
            EventType::Normal,
            REASON_INSTANCE_UPDATED_SUCCESSFULLY,
            MESSAGE_INSTANCE_UPDATED_SUCCESSFULLY,
        )
        .await;
        self.trigger_binding_reconciliation(&updated).await;
        Ok(Outcome::Done)
    }

    async fn handle_update_error(&self, instance: &ServiceInstance, broker_name: &str, err: &OsbError) -> ControllerError {
        let start = instance_status(instance).operation_start_time;
        if let Some(code) = err.status_code() {
            let message = format!("Error updating ServiceInstance at ServiceBroker {broker_name:?}: {err}");
            if is_terminal_http_status(code) {
                return self
                    .process_terminal_update_failure(instance, REASON_UPDATE_INSTANCE_CALL_FAILED, &message)
                    .await;
            }
            if self.retry_window_elapsed(start) {
                return self.process_update_retry_timeout(instance, &message).await;
            }
            let mut updated = instance.clone();
            clear_async_operation(instance_status_mut(&mut updated));
            warn!(instance = %instance.name_any(), error = %err, "update call failed; will retry");
            return self
                .instance_operation_error(&updated, ConditionStatus::False, REASON_UPDATE_INSTANCE_CALL_FAILED, &message)
                .await;
        }

        let message = if err.is_timeout() {
            format!("Communication with the ServiceBroker timed out; operation will be retried: {err}")
        } else {
            format!(
                "The update call failed and will be retried: Error communicating with broker {broker_name:?} for updating: {err}"
            )
        };
        if self.retry_window_elapsed(start) {
            return self.process_update_retry_timeout(instance, &message).await;
        }
        warn!(instance = %instance.name_any(), error = %err, "update call failed; will retry");
        self.instance_operation_error(instance, ConditionStatus::False, REASON_ERROR_CALLING_UPDATE_INSTANCE, &message)
            .await
    }

    async fn process_update_retry_timeout(&self, instance: &ServiceInstance, message: &str) -> ControllerError {
        let message = format!("{MESSAGE_RECONCILIATION_RETRY_TIMEOUT}: {message}");
        self.process_terminal_update_failure(instance, REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT, &message)
            .await
    }

    /// Fail the update on this generation; the instance stays provisioned
    pub(super) async fn process_terminal_update_failure(
        &self,
        instance: &ServiceInstance,
        reason: &str,
        message: &str,
    ) -> ControllerError {
        let mut updated = instance.clone();
        let now = self.now();
        let status = instance_status_mut(&mut updated);
        set_condition(&mut status.conditions, ConditionType::Ready, ConditionStatus::False, reason, message, now);
        set_condition(&mut status.conditions, ConditionType::Failed, ConditionStatus::True, reason, message, now);
        clear_current_operation(status);

        if let Err(e) = self.stores.instances.update_status(&updated).await {
            return e;
        }
        warn!(instance = %instance.name_any(), reason, "update failed: {message}");
        self.event(instance, EventType::Warning, reason, message).await;
        ControllerError::terminal(reason, message)
    }
}
