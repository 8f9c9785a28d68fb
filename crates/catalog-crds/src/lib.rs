//! Service Catalog CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the service catalog controller:
//! brokers, the classes and plans derived from their catalogs, and the
//! instances and bindings users create against them.

pub mod common;
pub mod service_broker;
pub mod service_class;
pub mod service_plan;
pub mod service_instance;
pub mod service_binding;

pub use common::*;
pub use service_broker::*;
pub use service_class::*;
pub use service_plan::*;
pub use service_instance::*;
pub use service_binding::*;

/// API group shared by every service catalog resource
pub const GROUP: &str = "servicecatalog.k8s.io";

/// Finalizer the controller places on brokers, instances and bindings
pub const FINALIZER_SERVICE_CATALOG: &str = "kubernetes-incubator/service-catalog";

/// Label carrying the hashed name of the broker that owns a class or plan
pub const LABEL_SERVICE_BROKER_NAME: &str = "servicecatalog.k8s.io/spec.serviceBrokerName";

/// Label carrying the hashed external ID of a class or plan
pub const LABEL_EXTERNAL_ID: &str = "servicecatalog.k8s.io/spec.externalID";

/// Label carrying the hashed external name of a class or plan
pub const LABEL_EXTERNAL_NAME: &str = "servicecatalog.k8s.io/spec.externalName";

/// Label carrying the hashed class name a plan belongs to
pub const LABEL_SERVICE_CLASS_REF_NAME: &str = "servicecatalog.k8s.io/spec.serviceClassRef.name";
