//! Types shared across the service catalog CRDs
//!
//! Conditions, references and parameter sources appear on several kinds,
//! so they live here rather than next to any single resource.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Condition type recorded on brokers, instances and bindings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionType {
    /// The resource has converged with the broker
    Ready,
    /// The resource hit a terminal error on its current generation
    Failed,
    /// Orphan mitigation is in progress (instances only)
    OrphanMitigation,
}

/// Tri-state status of a condition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// A single observed condition on a resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of the condition
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// Status of the condition
    pub status: ConditionStatus,

    /// Last time the status changed
    pub last_transition_time: DateTime<Utc>,

    /// Machine-readable, one-word reason for the last transition
    pub reason: String,

    /// Human-readable details of the last transition
    pub message: String,
}

/// Reference to an object in the same namespace
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    /// Name of the referenced object
    pub name: String,
}

impl LocalObjectReference {
    /// Create a reference to `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Reference to an object, optionally in another namespace
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// Namespace of the referenced object (defaults to the referrer's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Name of the referenced object
    pub name: String,
}

/// Identity of the user that requested a change, forwarded to brokers as
/// the originating identity
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub username: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Vec<String>>,
}

/// How the values of a whole-secret parameter source are decoded
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParameterValueType {
    /// Each secret value becomes a string parameter
    #[default]
    String,
    /// Each secret value must decode as a JSON object
    Json,
}

/// Reference to every key of a secret
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Name of the secret in the resource's namespace
    pub name: String,

    /// Decoding applied to each value
    #[serde(default, rename = "type")]
    pub value_type: ParameterValueType,
}

/// Reference to a single key of a secret
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyReference {
    /// Name of the secret in the resource's namespace
    pub name: String,

    /// Key within the secret whose bytes hold a JSON object
    pub key: String,
}

/// One source of request parameters. Exactly one field should be set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ParametersFromSource {
    /// Inline raw parameters (a JSON or YAML object)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,

    /// Every key of a secret becomes a top-level parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,

    /// A single secret key holding a JSON object of parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<SecretKeyReference>,
}
