//! ServiceInstance CRD
//!
//! Requests a provisioned instance of a (class, plan) pair from a broker.

use crate::common::{Condition, LocalObjectReference, ParametersFromSource, UserInfo};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceInstance",
    namespaced,
    status = "ServiceInstanceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceSpec {
    /// Which class and plan to provision
    #[serde(flatten)]
    pub plan_reference: PlanReference,

    /// Inline parameters (a JSON object)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,

    /// Additional parameter sources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters_from: Vec<ParametersFromSource>,

    /// Identifier sent to the broker; chosen at creation and never changed
    #[serde(rename = "externalID")]
    pub external_id: String,

    /// Requesting user, forwarded as originating identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,

    /// Bump to force an update request with unchanged parameters
    #[serde(default)]
    pub update_requests: i64,
}

/// Identifies the class and plan either by broker-facing names or by
/// resource names. Resource names win when both are given.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlanReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_class_external_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_plan_external_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_plan_name: Option<String>,
}

/// Operation the controller is driving for an instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum InstanceOperation {
    Provision,
    Update,
    Deprovision,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum ProvisionStatus {
    #[default]
    NotProvisioned,
    Provisioned,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum DeprovisionStatus {
    #[default]
    NotRequired,
    Required,
    Succeeded,
    Failed,
}

/// Snapshot of what was (or is being) sent to the broker
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstancePropertiesState {
    #[serde(default)]
    pub service_plan_external_name: String,

    #[serde(default, rename = "servicePlanExternalID")]
    pub service_plan_external_id: String,

    /// Parameters with secret-sourced values redacted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,

    /// Checksum of the unredacted parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_checksum: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// An asynchronous broker operation is being polled
    #[serde(default)]
    pub async_op_in_progress: bool,

    /// The controller is deprovisioning a possibly orphaned instance
    #[serde(default)]
    pub orphan_mitigation_in_progress: bool,

    /// Opaque operation token returned by the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<String>,

    #[serde(default, rename = "dashboardURL", skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_operation: Option<InstanceOperation>,

    #[serde(default)]
    pub reconciled_generation: i64,

    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress_properties: Option<InstancePropertiesState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_properties: Option<InstancePropertiesState>,

    #[serde(default)]
    pub provision_status: ProvisionStatus,

    #[serde(default)]
    pub deprovision_status: DeprovisionStatus,

    /// Class resolved from the plan reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_class_ref: Option<LocalObjectReference>,

    /// Plan resolved from the plan reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_plan_ref: Option<LocalObjectReference>,
}
