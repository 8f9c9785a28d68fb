//! Service Catalog Controller
//!
//! Reconciles `ServiceBroker`, `ServiceClass`, `ServicePlan`,
//! `ServiceInstance` and `ServiceBinding` resources against brokers that
//! implement the Open Service Broker API:
//! - Brokers: fetch and filter the catalog, sync classes and plans
//! - Instances: provision, update, deprovision and poll async operations
//! - Bindings: bind, unbind and inject credentials into Secrets
//!
//! Failed provisions and binds that may have left state behind on the
//! broker are cleaned up through orphan mitigation.

pub mod backoff;
pub mod broker_client_manager;
pub mod catalog;
pub mod clock;
pub mod cluster_id;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod name_escape;
pub mod parameters;
pub mod reconcile_helpers;
pub mod reconciler;
pub mod recorder;
pub mod selector;
pub mod store;
pub mod watcher;
pub mod workqueue;

#[cfg(test)]
mod reconcile_helpers_test;
#[cfg(test)]
pub(crate) mod test_utils;

pub use config::ControllerConfig;
pub use controller::Controller;
pub use error::ControllerError;
