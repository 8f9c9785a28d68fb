//! ServicePlan reconciliation; mirrors [`super::class`].

use super::{Outcome, Reconciler};
use crate::error::ControllerError;
use catalog_crds::{ServiceInstance, ServicePlan};
use kube::ResourceExt;
use tracing::{debug, info};

pub fn instance_references_plan(instance: &ServiceInstance, plan_name: &str) -> bool {
    let resolved = instance
        .status
        .as_ref()
        .and_then(|s| s.service_plan_ref.as_ref())
        .is_some_and(|r| r.name == plan_name);
    resolved || instance.spec.plan_reference.service_plan_name.as_deref() == Some(plan_name)
}

impl Reconciler {
    pub async fn reconcile_service_plan(&self, plan: &ServicePlan) -> Result<Outcome, ControllerError> {
        if !plan.status.as_ref().is_some_and(|s| s.removed_from_broker_catalog) {
            return Ok(Outcome::Done);
        }
        let name = plan.name_any();
        let namespace = plan.namespace().unwrap_or_default();

        let instances = self.stores.instances.list(Some(&namespace), None).await?;
        if instances.iter().any(|i| instance_references_plan(i, &name)) {
            debug!(plan = %name, "removed service plan still has instances");
            return Ok(Outcome::Done);
        }

        info!(plan = %name, namespace = %namespace, "deleting service plan removed from broker catalog");
        match self.stores.plans.delete(&namespace, &name).await {
            Ok(()) | Err(ControllerError::NotFound(_)) => Ok(Outcome::Done),
            Err(e) => Err(e),
        }
    }
}
