//! ServiceBroker CRD
//!
//! Registers an Open Service Broker endpoint whose catalog is synchronised
//! into ServiceClass and ServicePlan resources.

use crate::common::{Condition, LocalObjectReference};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceBroker",
    namespaced,
    status = "ServiceBrokerStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBrokerSpec {
    /// Broker endpoint URL
    pub url: String,

    /// Skip TLS verification when talking to the broker
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,

    /// PEM CA bundle (base64 encoded) used to verify the broker's certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,

    /// How the catalog is refreshed
    #[serde(default)]
    pub relist_behavior: RelistBehavior,

    /// Relist interval for `Duration` behavior, e.g. "15m" (controller default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relist_duration: Option<String>,

    /// Bump to force a manual relist
    #[serde(default)]
    pub relist_requests: i64,

    /// Credentials used to authenticate against the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_info: Option<ServiceBrokerAuthInfo>,

    /// Predicates restricting which classes and plans are exposed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_restrictions: Option<CatalogRestrictions>,
}

/// Catalog refresh policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum RelistBehavior {
    /// Relist periodically
    #[default]
    Duration,
    /// Relist only when the spec changes
    Manual,
}

/// Broker authentication: at most one of basic or bearer
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBrokerAuthInfo {
    /// Basic auth; the secret holds `username` and `password`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<SecretAuthConfig>,

    /// Bearer token auth; the secret holds `token`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer: Option<SecretAuthConfig>,
}

/// Pointer to the secret holding broker credentials
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretAuthConfig {
    pub secret_ref: LocalObjectReference,
}

/// Selector expressions over class and plan fields
///
/// Each list entry is a label-selector style predicate such as
/// `spec.externalName in (small, medium)`; a record is kept only when
/// every predicate admits it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRestrictions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_class: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_plan: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBrokerStatus {
    /// Observed conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation last fully reconciled
    #[serde(default)]
    pub reconciled_generation: i64,

    /// Start of the current retriable failure streak
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_start_time: Option<DateTime<Utc>>,

    /// Last successful catalog fetch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_catalog_retrieval_time: Option<DateTime<Utc>>,
}
