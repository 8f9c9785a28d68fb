//! Broker catalog conversion and filtering.
//!
//! Turns a broker's `/v2/catalog` payload into the classes and plans stored
//! for it. Store names are reused from existing entries with the same
//! external ID so renamed or re-listed entries keep their identity; new
//! entries get a name escaped from their external ID.

use crate::error::ControllerError;
use crate::name_escape::{escape_name, label_sha};
use crate::selector::{
    PROPERTY_EXTERNAL_ID, PROPERTY_EXTERNAL_NAME, PROPERTY_NAME, PROPERTY_SERVICE_CLASS_NAME, Predicate, Properties,
};
use catalog_crds::{
    LABEL_EXTERNAL_ID, LABEL_EXTERNAL_NAME, LABEL_SERVICE_BROKER_NAME, LABEL_SERVICE_CLASS_REF_NAME,
    LocalObjectReference, ServiceBroker, ServiceClass, ServiceClassSpec, ServicePlan, ServicePlanSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use osb_client::{CatalogResponse, InputParametersSchema, Plan, Service};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Reason recorded when a catalog cannot be turned into classes and plans
pub const REASON_ERROR_SYNCING_CATALOG: &str = "ErrorSyncingCatalog";

/// Classes and plans derived from one catalog payload
#[derive(Debug, Clone, Default)]
pub struct ConvertedCatalog {
    pub classes: Vec<ServiceClass>,
    pub plans: Vec<ServicePlan>,
}

/// Label selector matching every class and plan owned by `broker_name`
pub fn broker_selector(broker_name: &str) -> String {
    format!("{}={}", LABEL_SERVICE_BROKER_NAME, label_sha(broker_name))
}

pub fn class_properties(class: &ServiceClass) -> Properties {
    [
        (PROPERTY_NAME, class.name_any()),
        (PROPERTY_EXTERNAL_NAME, class.spec.external_name.clone()),
        (PROPERTY_EXTERNAL_ID, class.spec.external_id.clone()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

pub fn plan_properties(plan: &ServicePlan) -> Properties {
    [
        (PROPERTY_NAME, plan.name_any()),
        (PROPERTY_EXTERNAL_NAME, plan.spec.external_name.clone()),
        (PROPERTY_EXTERNAL_ID, plan.spec.external_id.clone()),
        (PROPERTY_SERVICE_CLASS_NAME, plan.spec.service_class_ref.name.clone()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn sync_error(message: String) -> ControllerError {
    ControllerError::operation(REASON_ERROR_SYNCING_CATALOG, message)
}

fn names_by_external_id<'a, I>(entries: I) -> HashMap<String, String>
where
    I: Iterator<Item = (&'a str, String)>,
{
    entries.map(|(id, name)| (id.to_string(), name)).collect()
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), label_sha(v))).collect()
}

fn schema_parameters(schema: Option<&InputParametersSchema>) -> Option<serde_json::Value> {
    schema.and_then(|s| s.parameters.clone())
}

fn convert_service(broker: &ServiceBroker, service: &Service, name: String) -> ServiceClass {
    let broker_name = broker.name_any();
    let metadata = ObjectMeta {
        name: Some(name),
        namespace: broker.namespace(),
        labels: Some(labels(&[
            (LABEL_SERVICE_BROKER_NAME, &broker_name),
            (LABEL_EXTERNAL_ID, &service.id),
            (LABEL_EXTERNAL_NAME, &service.name),
        ])),
        ..Default::default()
    };
    let spec = ServiceClassSpec {
        service_broker_name: broker_name,
        external_name: service.name.clone(),
        external_id: service.id.clone(),
        description: service.description.clone(),
        bindable: service.bindable,
        binding_retrievable: service.bindings_retrievable,
        plan_updatable: service.plan_updatable,
        tags: service.tags.clone(),
        requires: service.requires.clone(),
        external_metadata: service.metadata.clone(),
    };
    let mut class = ServiceClass::new(metadata.name.as_deref().unwrap_or_default(), spec);
    class.metadata = metadata;
    class
}

fn convert_plan(broker: &ServiceBroker, plan: &Plan, class_name: &str, name: String) -> ServicePlan {
    let broker_name = broker.name_any();
    let metadata = ObjectMeta {
        name: Some(name),
        namespace: broker.namespace(),
        labels: Some(labels(&[
            (LABEL_SERVICE_BROKER_NAME, &broker_name),
            (LABEL_EXTERNAL_ID, &plan.id),
            (LABEL_EXTERNAL_NAME, &plan.name),
            (LABEL_SERVICE_CLASS_REF_NAME, class_name),
        ])),
        ..Default::default()
    };
    let schemas = plan.schemas.as_ref();
    let instance_schema = schemas.and_then(|s| s.service_instance.as_ref());
    let binding_schema = schemas.and_then(|s| s.service_binding.as_ref());
    let spec = ServicePlanSpec {
        service_broker_name: broker_name,
        external_name: plan.name.clone(),
        external_id: plan.id.clone(),
        description: plan.description.clone(),
        bindable: plan.bindable,
        // Brokers that omit `free` advertise a free plan
        free: plan.free.unwrap_or(true),
        external_metadata: plan.metadata.clone(),
        instance_create_parameter_schema: schema_parameters(instance_schema.and_then(|s| s.create.as_ref())),
        instance_update_parameter_schema: schema_parameters(instance_schema.and_then(|s| s.update.as_ref())),
        service_binding_create_parameter_schema: schema_parameters(binding_schema.and_then(|s| s.create.as_ref())),
        service_class_ref: LocalObjectReference::new(class_name),
    };
    let mut converted = ServicePlan::new(metadata.name.as_deref().unwrap_or_default(), spec);
    converted.metadata = metadata;
    converted
}

/// Convert `catalog` into classes and plans for `broker`, then apply the
/// broker's catalog restrictions.
///
/// Classes left without any plan after filtering are dropped. Invalid
/// restrictions and entries missing an ID or name are errors.
pub fn convert_and_filter_catalog(
    broker: &ServiceBroker,
    catalog: &CatalogResponse,
    existing_classes: &[ServiceClass],
    existing_plans: &[ServicePlan],
) -> Result<ConvertedCatalog, ControllerError> {
    let class_names = names_by_external_id(existing_classes.iter().map(|c| (c.spec.external_id.as_str(), c.name_any())));
    let plan_names = names_by_external_id(existing_plans.iter().map(|p| (p.spec.external_id.as_str(), p.name_any())));

    let mut converted = ConvertedCatalog::default();
    let mut seen_ids = HashSet::new();
    for service in &catalog.services {
        if service.id.is_empty() || service.name.is_empty() {
            return Err(sync_error(format!(
                "service {:?} is missing an id or name",
                if service.name.is_empty() { &service.id } else { &service.name }
            )));
        }
        if !seen_ids.insert(service.id.as_str()) {
            return Err(sync_error(format!("duplicate service id {:?} in catalog", service.id)));
        }
        let class_name = class_names.get(&service.id).cloned().unwrap_or_else(|| escape_name(&service.id));

        for plan in &service.plans {
            if plan.id.is_empty() || plan.name.is_empty() {
                return Err(sync_error(format!("plan of service {:?} is missing an id or name", service.name)));
            }
            if !seen_ids.insert(plan.id.as_str()) {
                return Err(sync_error(format!("duplicate plan id {:?} in catalog", plan.id)));
            }
            let plan_name = plan_names.get(&plan.id).cloned().unwrap_or_else(|| escape_name(&plan.id));
            converted.plans.push(convert_plan(broker, plan, &class_name, plan_name));
        }
        converted.classes.push(convert_service(broker, service, class_name));
    }

    let restrictions = broker.spec.catalog_restrictions.clone().unwrap_or_default();
    let class_predicate = Predicate::from_restrictions(&restrictions.service_class)?;
    let plan_predicate = Predicate::from_restrictions(&restrictions.service_plan)?;

    converted.classes.retain(|c| class_predicate.accepts(&class_properties(c)));
    let kept_classes: HashSet<String> = converted.classes.iter().map(ResourceExt::name_any).collect();
    converted.plans.retain(|p| {
        kept_classes.contains(&p.spec.service_class_ref.name) && plan_predicate.accepts(&plan_properties(p))
    });

    let classes_with_plans: HashSet<&str> =
        converted.plans.iter().map(|p| p.spec.service_class_ref.name.as_str()).collect();
    let before = converted.classes.len();
    converted.classes.retain(|c| classes_with_plans.contains(c.name_any().as_str()));
    if converted.classes.len() != before {
        debug!(
            broker = %broker.name_any(),
            dropped = before - converted.classes.len(),
            "dropped classes without plans"
        );
    }

    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_crds::{CatalogRestrictions, ServiceBrokerSpec};

    fn broker(restrictions: Option<CatalogRestrictions>) -> ServiceBroker {
        let mut broker = ServiceBroker::new(
            "b",
            ServiceBrokerSpec {
                url: "https://broker.example.com".to_string(),
                catalog_restrictions: restrictions,
                ..Default::default()
            },
        );
        broker.metadata.namespace = Some("default".to_string());
        broker
    }

    fn plan(id: &str, name: &str) -> Plan {
        Plan {
            id: id.to_string(),
            name: name.to_string(),
            description: format!("{name} plan"),
            free: None,
            bindable: None,
            metadata: None,
            schemas: None,
        }
    }

    fn service(id: &str, name: &str, plans: Vec<Plan>) -> Service {
        Service {
            id: id.to_string(),
            name: name.to_string(),
            description: format!("{name} service"),
            tags: vec![],
            requires: vec![],
            bindable: true,
            bindings_retrievable: false,
            plan_updatable: false,
            metadata: None,
            plans,
        }
    }

    fn catalog() -> CatalogResponse {
        CatalogResponse {
            services: vec![service("scguid", "S", vec![plan("p1guid", "P1"), plan("p2guid", "P2")])],
        }
    }

    #[test]
    fn test_convert_assigns_escaped_names_and_labels() {
        let converted = convert_and_filter_catalog(&broker(None), &catalog(), &[], &[]).unwrap();
        assert_eq!(converted.classes.len(), 1);
        assert_eq!(converted.plans.len(), 2);

        let class = &converted.classes[0];
        assert_eq!(class.name_any(), "scguid");
        assert_eq!(class.namespace().as_deref(), Some("default"));
        assert_eq!(class.labels().get(LABEL_SERVICE_BROKER_NAME), Some(&label_sha("b")));
        assert_eq!(converted.plans[0].spec.service_class_ref.name, "scguid");
        assert!(converted.plans[0].spec.free, "Plans without a free flag are free");
    }

    #[test]
    fn test_existing_names_are_reused_by_external_id() {
        let first = convert_and_filter_catalog(&broker(None), &catalog(), &[], &[]).unwrap();
        let mut renamed_class = first.classes[0].clone();
        renamed_class.metadata.name = Some("legacy-class".to_string());

        let second =
            convert_and_filter_catalog(&broker(None), &catalog(), &[renamed_class], &first.plans).unwrap();
        assert_eq!(second.classes[0].name_any(), "legacy-class");
        assert_eq!(second.plans[0].spec.service_class_ref.name, "legacy-class");
        assert_eq!(
            second.plans.iter().map(ResourceExt::name_any).collect::<Vec<_>>(),
            first.plans.iter().map(ResourceExt::name_any).collect::<Vec<_>>(),
            "Plan names must be stable across conversions"
        );
    }

    #[test]
    fn test_plan_restrictions_drop_empty_classes() {
        let restrictions = CatalogRestrictions {
            service_class: vec![],
            service_plan: vec!["spec.externalName in (P9)".to_string()],
        };
        let converted = convert_and_filter_catalog(&broker(Some(restrictions)), &catalog(), &[], &[]).unwrap();
        assert!(converted.plans.is_empty());
        assert!(converted.classes.is_empty(), "Class without surviving plans should be dropped");
    }

    #[test]
    fn test_class_restrictions_drop_their_plans() {
        let mut payload = catalog();
        payload.services.push(service("other", "O", vec![plan("o1", "O1")]));
        let restrictions = CatalogRestrictions {
            service_class: vec!["spec.externalName=O".to_string()],
            service_plan: vec![],
        };
        let converted = convert_and_filter_catalog(&broker(Some(restrictions)), &payload, &[], &[]).unwrap();
        assert_eq!(converted.classes.len(), 1);
        assert_eq!(converted.classes[0].spec.external_name, "O");
        assert_eq!(converted.plans.len(), 1);
        assert_eq!(converted.plans[0].spec.external_id, "o1");
    }

    #[test]
    fn test_invalid_restriction_is_an_error() {
        let restrictions = CatalogRestrictions {
            service_class: vec!["spec.externalName in mysql".to_string()],
            service_plan: vec![],
        };
        let err = convert_and_filter_catalog(&broker(Some(restrictions)), &catalog(), &[], &[]).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let payload = CatalogResponse {
            services: vec![service("dup", "A", vec![plan("p", "P")]), service("dup", "B", vec![plan("q", "Q")])],
        };
        let err = convert_and_filter_catalog(&broker(None), &payload, &[], &[]).unwrap_err();
        assert!(err.to_string().contains("duplicate service id"));
    }
}
