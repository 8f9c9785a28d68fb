//! ServiceClass CRD
//!
//! One service offered by a broker. Created and kept current by the broker
//! reconciler; users only read it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceClass",
    namespaced,
    status = "ServiceClassStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClassSpec {
    /// Name of the broker advertising this class
    pub service_broker_name: String,

    /// Broker-facing name of the service
    pub external_name: String,

    /// Broker-chosen identifier; immutable once stored
    #[serde(rename = "externalID")]
    pub external_id: String,

    #[serde(default)]
    pub description: String,

    /// Instances of this class can be bound unless a plan overrides it
    #[serde(default)]
    pub bindable: bool,

    /// The broker supports fetching bindings after creation
    #[serde(default)]
    pub binding_retrievable: bool,

    /// Instances may switch plans
    #[serde(default)]
    pub plan_updatable: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,

    /// Opaque broker metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClassStatus {
    /// The broker no longer lists this class
    #[serde(default)]
    pub removed_from_broker_catalog: bool,
}
