//! Test utilities for unit testing reconcilers
//!
//! `TestEnv` wires a `Reconciler` to in-memory stores, a scripted broker
//! client, a fake event recorder and a fixed clock, and keeps handles to all
//! of them so tests can seed objects and inspect what the reconciler wrote.

use crate::catalog::convert_and_filter_catalog;
use crate::clock::FakeClock;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::reconciler::{Kind, Outcome, Reconciler, Stores};
use crate::recorder::FakeRecorder;
use crate::store::{InMemoryStore, object_key};
use crate::workqueue::WorkQueue;
use catalog_crds::{
    ConditionType, LocalObjectReference, PlanReference, ServiceBinding, ServiceBindingSpec, ServiceBroker,
    ServiceBrokerSpec, ServiceClass, ServiceInstance, ServiceInstanceSpec, ServicePlan,
};
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use osb_client::{CatalogResponse, MockOsbClient, Plan, Service};
use std::sync::Arc;

pub const TEST_NAMESPACE: &str = "default";
pub const TEST_NAMESPACE_UID: &str = "0b6a8f4e-namespace-uid";
pub const TEST_BROKER: &str = "test-broker";
pub const TEST_SERVICE_ID: &str = "mysql-id";
pub const TEST_SERVICE_NAME: &str = "mysql";
pub const TEST_PLAN_ID: &str = "small-id";
pub const TEST_PLAN_NAME: &str = "small";

/// Passes `settle` makes before giving up on a key
const MAX_SETTLE_PASSES: usize = 20;

/// Fixed start time of every test clock
pub fn test_start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap_or_default()
}

/// A deletion timestamp for objects that are being deleted
pub fn deletion_time() -> Time {
    serde_json::from_value(serde_json::json!("2026-01-01T00:00:00Z")).expect("valid timestamp")
}

/// Everything a reconciler test touches
pub struct TestEnv {
    pub reconciler: Arc<Reconciler>,
    pub brokers: InMemoryStore<ServiceBroker>,
    pub classes: InMemoryStore<ServiceClass>,
    pub plans: InMemoryStore<ServicePlan>,
    pub instances: InMemoryStore<ServiceInstance>,
    pub bindings: InMemoryStore<ServiceBinding>,
    pub secrets: InMemoryStore<Secret>,
    pub config_maps: InMemoryStore<ConfigMap>,
    pub namespaces: InMemoryStore<Namespace>,
    pub broker_client: MockOsbClient,
    pub recorder: FakeRecorder,
    pub clock: FakeClock,
    pub metrics: Arc<Metrics>,
    pub binding_queue: Arc<WorkQueue>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let brokers = InMemoryStore::new();
        let classes = InMemoryStore::new();
        let plans = InMemoryStore::new();
        let instances = InMemoryStore::new();
        let bindings = InMemoryStore::new();
        let secrets = InMemoryStore::new();
        let config_maps = InMemoryStore::new();
        let namespaces = InMemoryStore::new();
        let stores = Stores {
            brokers: Arc::new(brokers.clone()),
            classes: Arc::new(classes.clone()),
            plans: Arc::new(plans.clone()),
            instances: Arc::new(instances.clone()),
            bindings: Arc::new(bindings.clone()),
            secrets: Arc::new(secrets.clone()),
            config_maps: Arc::new(config_maps.clone()),
            namespaces: Arc::new(namespaces.clone()),
        };

        let broker_client = MockOsbClient::for_broker(TEST_BROKER);
        let recorder = FakeRecorder::new();
        let clock = FakeClock::new(test_start_time());
        let metrics = Arc::new(Metrics::new().expect("metrics registry"));
        let binding_queue = WorkQueue::new("service-binding");

        let reconciler = Arc::new(Reconciler::new(
            stores,
            broker_client.create_fn(),
            Arc::new(recorder.clone()),
            Arc::new(clock.clone()),
            config,
            Arc::clone(&metrics),
            Arc::clone(&binding_queue),
        ));
        reconciler.cluster_id().set("test-cluster");

        namespaces.seed(create_test_namespace(TEST_NAMESPACE, TEST_NAMESPACE_UID));

        Self {
            reconciler,
            brokers,
            classes,
            plans,
            instances,
            bindings,
            secrets,
            config_maps,
            namespaces,
            broker_client,
            recorder,
            clock,
            metrics,
            binding_queue,
        }
    }

    /// Seed the test broker with the catalog from [`create_test_catalog`]
    /// already converted into classes and plans
    pub fn seed_catalog(&self) -> ServiceBroker {
        self.seed_catalog_from(&create_test_catalog())
    }

    pub fn seed_catalog_from(&self, catalog: &CatalogResponse) -> ServiceBroker {
        let broker = self.brokers.seed(create_test_broker(TEST_BROKER));
        let converted = convert_and_filter_catalog(&broker, catalog, &[], &[]).expect("catalog converts");
        for class in converted.classes {
            self.classes.seed(class);
        }
        for plan in converted.plans {
            self.plans.seed(plan);
        }
        broker
    }

    /// Run passes over `key` until one neither errors nor asks to run again
    pub async fn settle(&self, kind: Kind, key: &str) -> Result<Outcome, ControllerError> {
        for _ in 0..MAX_SETTLE_PASSES {
            match self.reconciler.reconcile_key(kind, key).await? {
                Outcome::RequeueNow => continue,
                outcome => return Ok(outcome),
            }
        }
        panic!("{kind} {key} did not settle after {MAX_SETTLE_PASSES} passes");
    }

    pub fn instance(&self, name: &str) -> ServiceInstance {
        self.instances
            .peek(TEST_NAMESPACE, name)
            .unwrap_or_else(|| panic!("instance {name} should exist"))
    }

    pub fn binding(&self, name: &str) -> ServiceBinding {
        self.bindings
            .peek(TEST_NAMESPACE, name)
            .unwrap_or_else(|| panic!("binding {name} should exist"))
    }

    /// Provision `name` synchronously and return it ready
    pub async fn provisioned_instance(&self, name: &str) -> ServiceInstance {
        self.instances.seed(create_test_instance(name));
        let outcome = self
            .settle(Kind::Instance, &key(name))
            .await
            .expect("provision should succeed");
        assert_eq!(outcome, Outcome::Done);
        let instance = self.instance(name);
        assert!(
            is_ready(instance.status.as_ref().map(|s| s.conditions.as_slice())),
            "instance {name} should be ready"
        );
        instance
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Store key of `name` in the test namespace
pub fn key(name: &str) -> String {
    object_key(TEST_NAMESPACE, name)
}

pub fn is_ready(conditions: Option<&[catalog_crds::Condition]>) -> bool {
    conditions.is_some_and(|c| crate::reconcile_helpers::is_condition_true(c, ConditionType::Ready))
}

pub fn test_meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(TEST_NAMESPACE.to_string()),
        ..Default::default()
    }
}

pub fn create_test_namespace(name: &str, uid: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(uid.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Helper to create a test ServiceBroker
pub fn create_test_broker(name: &str) -> ServiceBroker {
    let mut broker = ServiceBroker::new(
        name,
        ServiceBrokerSpec {
            url: format!("http://{name}.broker.test"),
            ..Default::default()
        },
    );
    broker.metadata = test_meta(name);
    broker
}

pub fn create_test_plan(id: &str, name: &str) -> Plan {
    Plan {
        id: id.to_string(),
        name: name.to_string(),
        description: format!("{name} plan"),
        free: Some(true),
        ..Default::default()
    }
}

pub fn create_test_service(id: &str, name: &str, plans: Vec<Plan>) -> Service {
    Service {
        id: id.to_string(),
        name: name.to_string(),
        description: format!("{name} service"),
        bindable: true,
        plans,
        ..Default::default()
    }
}

/// One bindable service with one plan
pub fn create_test_catalog() -> CatalogResponse {
    CatalogResponse {
        services: vec![create_test_service(
            TEST_SERVICE_ID,
            TEST_SERVICE_NAME,
            vec![create_test_plan(TEST_PLAN_ID, TEST_PLAN_NAME)],
        )],
    }
}

/// Helper to create a test ServiceInstance of the test service and plan
pub fn create_test_instance(name: &str) -> ServiceInstance {
    let mut instance = ServiceInstance::new(
        name,
        ServiceInstanceSpec {
            plan_reference: PlanReference {
                service_class_external_name: Some(TEST_SERVICE_NAME.to_string()),
                service_plan_external_name: Some(TEST_PLAN_NAME.to_string()),
                ..Default::default()
            },
            external_id: format!("{name}-external-id"),
            ..Default::default()
        },
    );
    instance.metadata = test_meta(name);
    instance
}

/// Helper to create a test ServiceBinding writing to a secret of the same name
pub fn create_test_binding(name: &str, instance_name: &str) -> ServiceBinding {
    let mut binding = ServiceBinding::new(
        name,
        ServiceBindingSpec {
            instance_ref: LocalObjectReference::new(instance_name),
            secret_name: name.to_string(),
            external_id: format!("{name}-external-id"),
            ..Default::default()
        },
    );
    binding.metadata = test_meta(name);
    binding
}
