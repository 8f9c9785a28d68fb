//! Open Service Broker API models
//!
//! Catalog payloads mirror the wire format. Requests and responses are the
//! client-facing shapes; `client.rs` maps them onto HTTP.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker API version sent in `X-Broker-API-Version`
pub const API_VERSION: &str = "2.13";

/// Platform name used in originating identity headers and request contexts
pub const PLATFORM_KUBERNETES: &str = "kubernetes";

/// JSON object used for parameters, contexts and credentials
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Broker credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthConfig {
    Basic { username: String, password: String },
    Bearer { token: String },
}

/// Everything needed to build a client for one broker.
///
/// Compared as a whole by the client manager to decide whether a cached
/// client must be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfiguration {
    pub name: String,
    pub url: String,
    pub api_version: String,
    pub auth_config: Option<AuthConfig>,
    pub insecure: bool,
    pub ca_data: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl ClientConfiguration {
    /// Configuration with the default API version and a 60s timeout
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            api_version: API_VERSION.to_string(),
            auth_config: None,
            insecure: false,
            ca_data: None,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Identity of the platform user on whose behalf a request is made
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginatingIdentity {
    pub platform: String,
    /// JSON document describing the user
    pub value: String,
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CatalogResponse {
    #[serde(default)]
    pub services: Vec<Service>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub bindings_retrievable: bool,
    #[serde(default, rename = "plan_updateable")]
    pub plan_updatable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub plans: Vec<Plan>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Plan {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemas: Option<Schemas>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Schemas {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_instance: Option<ServiceInstanceSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_binding: Option<ServiceBindingSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServiceInstanceSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<InputParametersSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<InputParametersSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServiceBindingSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<InputParametersSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InputParametersSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProvisionRequest {
    pub instance_id: String,
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
    pub organization_guid: String,
    pub space_guid: String,
    pub parameters: Option<JsonMap>,
    pub context: Option<JsonMap>,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProvisionResponse {
    pub is_async: bool,
    pub dashboard_url: Option<String>,
    pub operation_key: Option<String>,
}

/// Values the broker had before an update
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct PreviousValues {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateInstanceRequest {
    pub instance_id: String,
    pub accepts_incomplete: bool,
    pub service_id: String,
    /// Only sent when the plan changes
    pub plan_id: Option<String>,
    /// Only sent when the parameters change
    pub parameters: Option<JsonMap>,
    pub previous_values: Option<PreviousValues>,
    pub context: Option<JsonMap>,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateInstanceResponse {
    pub is_async: bool,
    pub dashboard_url: Option<String>,
    pub operation_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeprovisionRequest {
    pub instance_id: String,
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeprovisionResponse {
    pub is_async: bool,
    pub operation_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Last operation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LastOperationState {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LastOperationRequest {
    pub instance_id: String,
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
    pub operation_key: Option<String>,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LastOperationResponse {
    pub state: LastOperationState,
    pub description: Option<String>,
    /// Broker-suggested delay before the next poll (`Retry-After`)
    pub poll_delay: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BindingLastOperationRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
    pub operation_key: Option<String>,
    pub originating_identity: Option<OriginatingIdentity>,
}

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct BindResource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_guid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BindRequest {
    pub binding_id: String,
    pub instance_id: String,
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
    pub app_guid: Option<String>,
    pub bind_resource: Option<BindResource>,
    pub parameters: Option<JsonMap>,
    pub context: Option<JsonMap>,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BindResponse {
    pub is_async: bool,
    pub credentials: Option<JsonMap>,
    pub syslog_drain_url: Option<String>,
    pub route_service_url: Option<String>,
    pub operation_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UnbindRequest {
    pub binding_id: String,
    pub instance_id: String,
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UnbindResponse {
    pub is_async: bool,
    pub operation_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GetBindingRequest {
    pub instance_id: String,
    pub binding_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GetBindingResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syslog_drain_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<JsonMap>,
}
