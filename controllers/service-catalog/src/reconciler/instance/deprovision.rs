//! Deprovisioning, for deleted instances and for orphan mitigation.
//!
//! An instance with bindings is not deprovisioned. With cascading deletion
//! enabled the bindings are deleted first; otherwise deletion is blocked
//! until they are gone.

use super::{
    MESSAGE_DEPROVISIONED_SUCCESSFULLY, MESSAGE_DEPROVISIONING, MESSAGE_ORPHAN_MITIGATION_SUCCESSFUL,
    MESSAGE_SERVICE_BINDINGS_DELETION, REASON_DEPROVISION_BLOCKED_BY_CREDENTIALS, REASON_DEPROVISION_CALL_FAILED,
    REASON_DEPROVISIONED_SUCCESSFULLY, REASON_DEPROVISIONING, REASON_SERVICE_BINDINGS_DELETION,
    clear_async_operation, clear_current_operation, instance_status, instance_status_mut,
    prepare_observed_generation, set_last_operation,
};
use crate::error::ControllerError;
use crate::reconcile_helpers::{generation, has_finalizer, is_deleting, remove_condition, remove_finalizer, set_condition};
use crate::reconciler::{
    DEFAULT_POLL_DELAY, MESSAGE_RECONCILIATION_RETRY_TIMEOUT, Outcome, REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT,
    REASON_NONEXISTENT_SERVICE_PLAN, REASON_ORPHAN_MITIGATION_FAILED, REASON_ORPHAN_MITIGATION_SUCCESSFUL, Reconciler,
    is_terminal_http_status,
};
use crate::recorder::EventType;
use crate::store::object_key;
use catalog_crds::{
    ConditionStatus, ConditionType, DeprovisionStatus, FINALIZER_SERVICE_CATALOG, InstanceOperation,
    ProvisionStatus, ServiceBinding, ServiceInstance,
};
use kube::ResourceExt;
use osb_client::{DeprovisionRequest, OsbError};
use tracing::{debug, info, warn};

pub(crate) const MESSAGE_DEPROVISION_BLOCKED_BY_CREDENTIALS: &str =
    "All associated ServiceBindings must be removed before this ServiceInstance can be deleted";

impl Reconciler {
    pub(super) async fn reconcile_instance_delete(&self, instance: &ServiceInstance) -> Result<Outcome, ControllerError> {
        let key = object_key(&instance.namespace().unwrap_or_default(), &instance.name_any());
        if !has_finalizer(&instance.metadata, FINALIZER_SERVICE_CATALOG) {
            debug!(instance = %key, "no finalizer; nothing to deprovision");
            return Ok(Outcome::Done);
        }
        let status = instance_status(instance);
        if status.deprovision_status == DeprovisionStatus::Failed {
            debug!(instance = %key, "deprovision failed earlier; waiting for intervention");
            return Ok(Outcome::Done);
        }

        let mut instance = instance.clone();
        let orphan_mitigation = status.orphan_mitigation_in_progress;
        if !orphan_mitigation && status.observed_generation != generation(&instance.metadata) {
            prepare_observed_generation(&mut instance);
        }

        if instance_status(&instance).deprovision_status != DeprovisionStatus::Required {
            debug!(instance = %key, "deprovision not required; releasing instance");
            self.finish_instance_deletion(&instance).await?;
            return Ok(Outcome::Done);
        }

        let bindings = self.instance_bindings(&instance).await?;
        if !bindings.is_empty() {
            return self.handle_existing_bindings(&instance, &bindings).await;
        }

        let resolved = match self.resolve_instance(&instance).await {
            Ok(resolved) => resolved,
            Err(e) => return Err(self.handle_instance_error(&instance, e).await),
        };

        let status = instance_status(&instance);
        let props = if status.current_operation.is_some() || orphan_mitigation {
            status.in_progress_properties.clone()
        } else {
            status.external_properties.clone()
        };
        let plan_id = props
            .as_ref()
            .map(|p| p.service_plan_external_id.clone())
            .filter(|id| !id.is_empty())
            .or_else(|| resolved.plan.as_ref().map(|p| p.spec.external_id.clone()));
        let Some(plan_id) = plan_id else {
            let err = ControllerError::operation(
                REASON_NONEXISTENT_SERVICE_PLAN,
                "The instance references a ServicePlan that does not exist and no plan was recorded for it",
            );
            return Err(self.handle_instance_error(&instance, err).await);
        };

        if orphan_mitigation && !is_deleting(&instance.metadata) {
            if status.operation_start_time.is_none() {
                instance_status_mut(&mut instance).operation_start_time = Some(self.now());
            }
        } else if status.current_operation != Some(InstanceOperation::Deprovision) {
            if orphan_mitigation {
                let status = instance_status_mut(&mut instance);
                remove_condition(&mut status.conditions, ConditionType::OrphanMitigation);
                status.orphan_mitigation_in_progress = false;
            }
            self.record_start_of_instance_operation(&instance, InstanceOperation::Deprovision, props)
                .await?;
            return Ok(Outcome::RequeueNow);
        }

        let originating_identity = match self.originating_identity(instance.spec.user_info.as_ref()) {
            Ok(identity) => identity,
            Err(e) => return Err(self.handle_instance_error(&instance, e).await),
        };
        let request = DeprovisionRequest {
            instance_id: instance.spec.external_id.clone(),
            accepts_incomplete: true,
            service_id: resolved.class.spec.external_id.clone(),
            plan_id,
            originating_identity,
        };

        info!(instance = %key, broker = %resolved.broker_name, orphan_mitigation, "deprovisioning instance");
        let result = resolved.client.deprovision_instance(&request).await;
        self.observe(resolved.client.as_ref(), "deprovision_instance", &result);

        match result {
            Ok(response) if response.is_async => {
                let mut updated = instance.clone();
                let now = self.now();
                let status = instance_status_mut(&mut updated);
                set_last_operation(status, response.operation_key.as_deref());
                status.async_op_in_progress = true;
                set_condition(
                    &mut status.conditions,
                    ConditionType::Ready,
                    ConditionStatus::False,
                    REASON_DEPROVISIONING,
                    MESSAGE_DEPROVISIONING,
                    now,
                );
                self.stores.instances.update_status(&updated).await?;
                self.event(&instance, EventType::Normal, REASON_DEPROVISIONING, MESSAGE_DEPROVISIONING)
                    .await;
                Ok(Outcome::Poll(DEFAULT_POLL_DELAY))
            }
            Ok(_) => self.process_deprovision_success(&instance).await,
            Err(e) if e.is_gone() => {
                debug!(instance = %key, "broker reports instance gone");
                self.process_deprovision_success(&instance).await
            }
            Err(e) => Err(self.handle_deprovision_error(&instance, &resolved.broker_name, &e).await),
        }
    }

    async fn handle_existing_bindings(
        &self,
        instance: &ServiceInstance,
        bindings: &[ServiceBinding],
    ) -> Result<Outcome, ControllerError> {
        if !self.config.cascading_deletion {
            warn!(instance = %instance.name_any(), bindings = bindings.len(), "deprovision blocked by bindings");
            return Err(self
                .instance_operation_error(
                    instance,
                    ConditionStatus::Unknown,
                    REASON_DEPROVISION_BLOCKED_BY_CREDENTIALS,
                    MESSAGE_DEPROVISION_BLOCKED_BY_CREDENTIALS,
                )
                .await);
        }

        for binding in bindings.iter().filter(|b| !is_deleting(&b.metadata)) {
            let namespace = binding.namespace().unwrap_or_default();
            info!(instance = %instance.name_any(), binding = %binding.name_any(), "deleting binding of deleted instance");
            match self.stores.bindings.delete(&namespace, &binding.name_any()).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let mut updated = instance.clone();
        let changed = set_condition(
            &mut instance_status_mut(&mut updated).conditions,
            ConditionType::Ready,
            ConditionStatus::False,
            REASON_SERVICE_BINDINGS_DELETION,
            MESSAGE_SERVICE_BINDINGS_DELETION,
            self.now(),
        );
        if changed {
            self.stores.instances.update_status(&updated).await?;
            self.event(
                instance,
                EventType::Normal,
                REASON_SERVICE_BINDINGS_DELETION,
                MESSAGE_SERVICE_BINDINGS_DELETION,
            )
            .await;
        }
        Ok(Outcome::RequeueAfter(DEFAULT_POLL_DELAY))
    }

    /// Record a completed deprovision, from the call itself or a poll
    pub(super) async fn process_deprovision_success(&self, instance: &ServiceInstance) -> Result<Outcome, ControllerError> {
        let mut updated = instance.clone();
        let now = self.now();
        let status = instance_status_mut(&mut updated);
        let orphan_mitigation = status.orphan_mitigation_in_progress;
        let (reason, message) = if orphan_mitigation {
            remove_condition(&mut status.conditions, ConditionType::OrphanMitigation);
            status.orphan_mitigation_in_progress = false;
            (REASON_ORPHAN_MITIGATION_SUCCESSFUL, MESSAGE_ORPHAN_MITIGATION_SUCCESSFUL)
        } else {
            (REASON_DEPROVISIONED_SUCCESSFULLY, MESSAGE_DEPROVISIONED_SUCCESSFULLY)
        };
        set_condition(&mut status.conditions, ConditionType::Ready, ConditionStatus::False, reason, message, now);
        clear_current_operation(status);
        status.external_properties = None;
        status.provision_status = ProvisionStatus::NotProvisioned;
        status.deprovision_status = DeprovisionStatus::Succeeded;

        if orphan_mitigation && !is_deleting(&updated.metadata) {
            self.stores.instances.update_status(&updated).await?;
        } else {
            self.finish_instance_deletion(&updated).await?;
        }
        info!(instance = %instance.name_any(), reason, "instance deprovisioned");
        self.event(instance, EventType::Normal, reason, message).await;
        Ok(Outcome::Done)
    }

    /// Persist status and, for a deleted instance, release it
    async fn finish_instance_deletion(&self, instance: &ServiceInstance) -> Result<(), ControllerError> {
        let mut updated = self.stores.instances.update_status(instance).await?;
        if is_deleting(&updated.metadata) && remove_finalizer(&mut updated.metadata, FINALIZER_SERVICE_CATALOG) {
            match self.stores.instances.update(&updated).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            debug!(instance = %instance.name_any(), "removed finalizer");
        }
        Ok(())
    }

    async fn handle_deprovision_error(
        &self,
        instance: &ServiceInstance,
        broker_name: &str,
        err: &OsbError,
    ) -> ControllerError {
        let message = if err.status_code().is_some() {
            format!("Deprovision call failed; received error response from broker {broker_name:?}: {err}")
        } else {
            format!("Error deprovisioning ServiceInstance at ServiceBroker {broker_name:?}: {err}")
        };
        if err.status_code().is_some_and(is_terminal_http_status) {
            return self
                .process_deprovision_failure(instance, REASON_DEPROVISION_CALL_FAILED, &message)
                .await;
        }
        self.process_temporary_deprovision_failure(instance, REASON_DEPROVISION_CALL_FAILED, &message, false)
            .await
    }

    /// Surface a retriable deprovision failure, escalating once the retry
    /// window has closed.
    ///
    /// `clear_async` makes the next pass send a new deprovision request
    /// instead of polling the failed one.
    pub(super) async fn process_temporary_deprovision_failure(
        &self,
        instance: &ServiceInstance,
        reason: &str,
        message: &str,
        clear_async: bool,
    ) -> ControllerError {
        if self.retry_window_elapsed(instance_status(instance).operation_start_time) {
            let message = format!("{MESSAGE_RECONCILIATION_RETRY_TIMEOUT}: {message}");
            return self
                .process_deprovision_failure(instance, REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT, &message)
                .await;
        }
        let mut updated = instance.clone();
        if clear_async {
            clear_async_operation(instance_status_mut(&mut updated));
        }
        warn!(instance = %instance.name_any(), reason, "deprovision failed; will retry: {message}");
        self.instance_operation_error(&updated, ConditionStatus::Unknown, reason, message)
            .await
    }

    /// Give up on deprovisioning; the finalizer stays for an operator
    pub(super) async fn process_deprovision_failure(
        &self,
        instance: &ServiceInstance,
        reason: &str,
        message: &str,
    ) -> ControllerError {
        let mut updated = instance.clone();
        let now = self.now();
        let status = instance_status_mut(&mut updated);
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
        clear_current_operation(status);
        status.deprovision_status = DeprovisionStatus::Failed;

        if let Err(e) = self.stores.instances.update_status(&updated).await {
            return e;
        }
        warn!(instance = %instance.name_any(), reason = %reason, "deprovision failed: {message}");
        self.event(instance, EventType::Warning, &reason, &message).await;
        ControllerError::terminal(reason, message)
    }
}
