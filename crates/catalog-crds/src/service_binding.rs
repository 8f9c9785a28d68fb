//! ServiceBinding CRD
//!
//! Requests credentials for a ServiceInstance, delivered into a Secret.

use crate::common::{Condition, LocalObjectReference, ObjectReference, ParametersFromSource, UserInfo};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceBinding",
    namespaced,
    status = "ServiceBindingStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingSpec {
    /// Instance in the same namespace to bind to
    pub instance_ref: LocalObjectReference,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters_from: Vec<ParametersFromSource>,

    /// Secret receiving the credentials
    pub secret_name: String,

    /// When set, all credentials are written as one JSON document under this key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,

    /// Transformations applied to the credentials before they are written
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_transforms: Vec<SecretTransform>,

    /// Identifier sent to the broker
    #[serde(rename = "externalID")]
    pub external_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

/// A single credentials transformation. Exactly one field should be set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretTransform {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rename_key: Option<RenameKeyTransform>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_key: Option<AddKeyTransform>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_keys_from: Option<AddKeysFromTransform>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_key: Option<RemoveKeyTransform>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RenameKeyTransform {
    pub from: String,
    pub to: String,
}

/// Adds a key. Precedence: `value`, then `stringValue`, then `jsonPathExpression`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AddKeyTransform {
    pub key: String,

    /// Base64-encoded bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,

    /// Dotted path into the credentials, e.g. `{.connection.host}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path_expression: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AddKeysFromTransform {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<ObjectReference>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RemoveKeyTransform {
    pub key: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum BindingOperation {
    Bind,
    Unbind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum UnbindStatus {
    #[default]
    NotRequired,
    Required,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BindingPropertiesState {
    /// Parameters with secret-sourced values redacted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_checksum: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub async_op_in_progress: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_operation: Option<BindingOperation>,

    #[serde(default)]
    pub reconciled_generation: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress_properties: Option<BindingPropertiesState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_properties: Option<BindingPropertiesState>,

    /// The controller is unbinding a possibly orphaned binding
    #[serde(default)]
    pub orphan_mitigation_in_progress: bool,

    #[serde(default)]
    pub unbind_status: UnbindStatus,
}
