//! ServiceClass reconciliation.
//!
//! A class flagged as removed from its broker's catalog is deleted once no
//! instance in its namespace refers to it any more.

use super::{Outcome, Reconciler};
use crate::error::ControllerError;
use catalog_crds::{ServiceClass, ServiceInstance};
use kube::ResourceExt;
use tracing::{debug, info};

/// Whether `instance` was resolved to, or asks for, the class named `class_name`
pub fn instance_references_class(instance: &ServiceInstance, class_name: &str) -> bool {
    let resolved = instance
        .status
        .as_ref()
        .and_then(|s| s.service_class_ref.as_ref())
        .is_some_and(|r| r.name == class_name);
    resolved || instance.spec.plan_reference.service_class_name.as_deref() == Some(class_name)
}

impl Reconciler {
    pub async fn reconcile_service_class(&self, class: &ServiceClass) -> Result<Outcome, ControllerError> {
        let removed = class.status.as_ref().is_some_and(|s| s.removed_from_broker_catalog);
        if !removed {
            return Ok(Outcome::Done);
        }
        let name = class.name_any();
        let namespace = class.namespace().unwrap_or_default();

        let instances = self.stores.instances.list(Some(&namespace), None).await?;
        if instances.iter().any(|i| instance_references_class(i, &name)) {
            debug!(class = %name, "removed service class still has instances");
            return Ok(Outcome::Done);
        }

        info!(class = %name, namespace = %namespace, "deleting service class removed from broker catalog");
        match self.stores.classes.delete(&namespace, &name).await {
            Ok(()) => Ok(Outcome::Done),
            Err(e) if e.is_not_found() => Ok(Outcome::Done),
            Err(e) => Err(e),
        }
    }
}
