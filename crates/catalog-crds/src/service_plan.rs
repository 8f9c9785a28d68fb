//! ServicePlan CRD
//!
//! A tier of a ServiceClass as advertised by the owning broker.

use crate::common::LocalObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServicePlan",
    namespaced,
    status = "ServicePlanStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ServicePlanSpec {
    /// Name of the broker advertising this plan
    pub service_broker_name: String,

    /// Broker-facing name of the plan
    pub external_name: String,

    /// Broker-chosen identifier; immutable once stored
    #[serde(rename = "externalID")]
    pub external_id: String,

    #[serde(default)]
    pub description: String,

    /// Overrides the class-level bindable flag when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindable: Option<bool>,

    /// The plan carries no charge
    #[serde(default)]
    pub free: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_metadata: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_create_parameter_schema: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_update_parameter_schema: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_binding_create_parameter_schema: Option<serde_json::Value>,

    /// The class this plan belongs to
    pub service_class_ref: LocalObjectReference,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServicePlanStatus {
    /// The broker no longer lists this plan
    #[serde(default)]
    pub removed_from_broker_catalog: bool,
}
