//! Provisioning a new instance on its broker.

use super::{
    MESSAGE_PROVISIONED_SUCCESSFULLY, MESSAGE_PROVISIONING, MESSAGE_STARTING_ORPHAN_MITIGATION,
    REASON_ERROR_CALLING_PROVISION, REASON_PROVISION_CALL_FAILED, REASON_PROVISIONED_SUCCESSFULLY,
    REASON_PROVISIONING, REASON_STARTING_ORPHAN_MITIGATION, clear_current_operation, instance_properties_equal,
    instance_status, instance_status_mut, is_instance_processed, prepare_observed_generation, set_dashboard_url,
    set_last_operation,
};
use crate::error::ControllerError;
use crate::reconcile_helpers::{generation, set_condition};
use crate::reconciler::{
    DEFAULT_POLL_DELAY, MESSAGE_RECONCILIATION_RETRY_TIMEOUT, Outcome, REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT,
    Reconciler, is_terminal_http_status, should_start_orphan_mitigation,
};
use crate::recorder::EventType;
use crate::store::object_key;
use catalog_crds::{
    ConditionStatus, ConditionType, DeprovisionStatus, InstanceOperation, ProvisionStatus, ServiceClass,
    ServiceInstance,
};
use kube::ResourceExt;
use osb_client::{OsbError, ProvisionRequest};
use tracing::{debug, info, warn};

impl Reconciler {
    pub(super) async fn reconcile_instance_add(&self, instance: &ServiceInstance) -> Result<Outcome, ControllerError> {
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
        if status.current_operation != Some(InstanceOperation::Provision)
            || !instance_properties_equal(status.in_progress_properties.as_ref(), Some(&parts.in_progress))
        {
            self.record_start_of_instance_operation(&instance, InstanceOperation::Provision, Some(parts.in_progress))
                .await?;
            return Ok(Outcome::RequeueNow);
        }
        if status.deprovision_status != DeprovisionStatus::Required {
            instance_status_mut(&mut instance).deprovision_status = DeprovisionStatus::Required;
        }

        let request = ProvisionRequest {
            instance_id: instance.spec.external_id.clone(),
            accepts_incomplete: true,
            service_id: resolved.class.spec.external_id.clone(),
            plan_id: plan.spec.external_id.clone(),
            organization_guid: self.cluster_id.get(),
            space_guid: parts.namespace_uid,
            parameters: parts.parameters,
            context: parts.context,
            originating_identity: parts.originating_identity,
        };

        info!(
            instance = %key,
            broker = %resolved.broker_name,
            class = %resolved.class.spec.external_name,
            plan = %plan.spec.external_name,
            "provisioning instance"
        );
        let result = resolved.client.provision_instance(&request).await;
        self.observe(resolved.client.as_ref(), "provision_instance", &result);

        match result {
            Ok(response) if response.is_async => {
                self.handle_provision_accepted(
                    &instance,
                    response.dashboard_url.as_deref(),
                    response.operation_key.as_deref(),
                )
                .await
            }
            Ok(response) => {
                self.handle_provision_success(&instance, response.dashboard_url.as_deref())
                    .await
            }
            Err(e) => {
                Err(self
                    .handle_provision_error(&instance, &resolved.class, &resolved.broker_name, &e)
                    .await)
            }
        }
    }

    async fn handle_provision_accepted(
        &self,
        instance: &ServiceInstance,
        dashboard_url: Option<&str>,
        operation_key: Option<&str>,
    ) -> Result<Outcome, ControllerError> {
        let mut updated = instance.clone();
        let now = self.now();
        let status = instance_status_mut(&mut updated);
        set_dashboard_url(status, dashboard_url);
        set_last_operation(status, operation_key);
        status.async_op_in_progress = true;
        set_condition(
            &mut status.conditions,
            ConditionType::Ready,
            ConditionStatus::False,
            REASON_PROVISIONING,
            MESSAGE_PROVISIONING,
            now,
        );
        self.stores.instances.update_status(&updated).await?;
        self.event(instance, EventType::Normal, REASON_PROVISIONING, MESSAGE_PROVISIONING)
            .await;
        Ok(Outcome::Poll(DEFAULT_POLL_DELAY))
    }

    /// Record a completed provision, from the call itself or a poll
    pub(super) async fn handle_provision_success(
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
            REASON_PROVISIONED_SUCCESSFULLY,
            MESSAGE_PROVISIONED_SUCCESSFULLY,
            now,
        );
        status.external_properties = status.in_progress_properties.take();
        clear_current_operation(status);
        status.provision_status = ProvisionStatus::Provisioned;
        status.deprovision_status = DeprovisionStatus::Required;
        status.reconciled_generation = status.observed_generation;

        let updated = self.stores.instances.update_status(&updated).await?;
        info!(instance = %updated.name_any(), "instance provisioned");
        self.event(
            instance,
            EventType::Normal,
            REASON_PROVISIONED_SUCCESSFULLY,
            MESSAGE_PROVISIONED_SUCCESSFULLY,
        )
        .await;
        self.trigger_binding_reconciliation(&updated).await;
        Ok(Outcome::Done)
    }

    async fn handle_provision_error(
        &self,
        instance: &ServiceInstance,
        class: &ServiceClass,
        broker_name: &str,
        err: &OsbError,
    ) -> ControllerError {
        if let Some(code) = err.status_code() {
            let message = format!(
                "Error provisioning ServiceInstance of ServiceClass {:?} at ServiceBroker {broker_name:?}: {err}",
                class.spec.external_name
            );
            if should_start_orphan_mitigation(code) {
                return self
                    .process_terminal_provision_failure(instance, REASON_PROVISION_CALL_FAILED, &message, true, true)
                    .await;
            }
            if is_terminal_http_status(code) {
                return self
                    .process_terminal_provision_failure(instance, REASON_PROVISION_CALL_FAILED, &message, true, false)
                    .await;
            }
        }

        if err.is_timeout() {
            let message = format!("Communication with the ServiceBroker timed out; operation will be retried: {err}");
            return self
                .process_terminal_provision_failure(instance, REASON_ERROR_CALLING_PROVISION, &message, false, true)
                .await;
        }

        let message = format!(
            "The provision call failed and will be retried: Error communicating with broker {broker_name:?} for provisioning: {err}"
        );
        if self.retry_window_elapsed(instance_status(instance).operation_start_time) {
            let message = format!("{MESSAGE_RECONCILIATION_RETRY_TIMEOUT}: {message}");
            return self
                .process_terminal_provision_failure(
                    instance,
                    REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT,
                    &message,
                    true,
                    false,
                )
                .await;
        }
        warn!(instance = %instance.name_any(), error = %err, "provision call failed; will retry");
        self.instance_operation_error(instance, ConditionStatus::False, REASON_ERROR_CALLING_PROVISION, &message)
            .await
    }

    /// Persist a provision that cannot go on as it is.
    ///
    /// With `orphan_mitigation` the operation is kept and the next pass
    /// deprovisions whatever the broker may have created; the returned
    /// error is retriable so that pass happens. Without it the operation
    /// is dropped and nothing needs deprovisioning.
    pub(super) async fn process_terminal_provision_failure(
        &self,
        instance: &ServiceInstance,
        reason: &str,
        message: &str,
        mark_failed: bool,
        orphan_mitigation: bool,
    ) -> ControllerError {
        let mut updated = instance.clone();
        let now = self.now();
        let status = instance_status_mut(&mut updated);
        set_condition(&mut status.conditions, ConditionType::Ready, ConditionStatus::False, reason, message, now);
        if mark_failed {
            set_condition(&mut status.conditions, ConditionType::Failed, ConditionStatus::True, reason, message, now);
        }
        if orphan_mitigation {
            set_condition(
                &mut status.conditions,
                ConditionType::Ready,
                ConditionStatus::False,
                REASON_STARTING_ORPHAN_MITIGATION,
                MESSAGE_STARTING_ORPHAN_MITIGATION,
                now,
            );
            status.operation_start_time = None;
            status.async_op_in_progress = false;
            status.orphan_mitigation_in_progress = true;
            status.deprovision_status = DeprovisionStatus::Required;
        } else {
            clear_current_operation(status);
            status.deprovision_status = DeprovisionStatus::NotRequired;
        }

        if let Err(e) = self.stores.instances.update_status(&updated).await {
            return e;
        }
        warn!(instance = %instance.name_any(), reason, orphan_mitigation, "provision failed: {message}");
        self.event(instance, EventType::Warning, reason, message).await;
        if orphan_mitigation {
            ControllerError::operation(reason, message)
        } else {
            ControllerError::terminal(reason, message)
        }
    }
}
