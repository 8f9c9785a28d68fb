//! Open Service Broker API client
//!
//! Implements the broker REST API over `reqwest`:
//! `/v2/catalog`, `/v2/service_instances/{id}` and
//! `/v2/service_instances/{id}/service_bindings/{binding_id}`.

use crate::error::OsbError;
use crate::models::*;
use crate::osb_trait::OsbClientTrait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const API_VERSION_HEADER: &str = "X-Broker-API-Version";
const ORIGINATING_IDENTITY_HEADER: &str = "X-Broker-API-Originating-Identity";

/// Open Service Broker API client
#[derive(Debug)]
pub struct OsbClient {
    client: Client,
    config: ClientConfiguration,
    base_url: String,
}

#[derive(Debug, Deserialize, Default)]
struct ErrorBody {
    error: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AsyncBody {
    operation: Option<String>,
    dashboard_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LastOperationBody {
    state: LastOperationState,
    description: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct BindBody {
    credentials: Option<JsonMap>,
    syslog_drain_url: Option<String>,
    route_service_url: Option<String>,
    operation: Option<String>,
}

#[derive(Serialize)]
struct ProvisionBody<'a> {
    service_id: &'a str,
    plan_id: &'a str,
    organization_guid: &'a str,
    space_guid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<&'a JsonMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a JsonMap>,
}

#[derive(Serialize)]
struct UpdateBody<'a> {
    service_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<&'a JsonMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_values: Option<&'a PreviousValues>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a JsonMap>,
}

#[derive(Serialize)]
struct BindBodyRequest<'a> {
    service_id: &'a str,
    plan_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_guid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bind_resource: Option<&'a BindResource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<&'a JsonMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a JsonMap>,
}

impl OsbClient {
    /// Create a new broker client
    ///
    /// The configuration's timeout applies to every request. A CA bundle,
    /// when present, must be PEM encoded.
    pub fn new(config: ClientConfiguration) -> Result<Self, OsbError> {
        if config.url.is_empty() {
            return Err(OsbError::InvalidConfig("broker URL must not be empty".to_string()));
        }

        let mut builder = Client::builder().timeout(config.timeout);
        if config.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(ca) = &config.ca_data {
            let cert = reqwest::Certificate::from_pem(ca)
                .map_err(|e| OsbError::InvalidConfig(format!("invalid CA bundle: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            config,
        })
    }

    fn instance_url(&self, instance_id: &str) -> String {
        format!("{}/v2/service_instances/{}", self.base_url, urlencoding::encode(instance_id))
    }

    fn binding_url(&self, instance_id: &str, binding_id: &str) -> String {
        format!(
            "{}/service_bindings/{}",
            self.instance_url(instance_id),
            urlencoding::encode(binding_id)
        )
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        identity: Option<&OriginatingIdentity>,
    ) -> Result<Response, OsbError> {
        let mut builder = builder
            .header(API_VERSION_HEADER, &self.config.api_version)
            .header("Accept", "application/json");
        builder = match &self.config.auth_config {
            Some(AuthConfig::Basic { username, password }) => builder.basic_auth(username, Some(password)),
            Some(AuthConfig::Bearer { token }) => builder.bearer_auth(token),
            None => builder,
        };
        if let Some(identity) = identity {
            builder = builder.header(ORIGINATING_IDENTITY_HEADER, originating_identity_header(identity));
        }

        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                OsbError::Timeout(e.to_string())
            } else if e.is_connect() {
                OsbError::Connection(e.to_string())
            } else {
                OsbError::Http(e)
            }
        })
    }

    async fn status_error(response: Response) -> OsbError {
        let status_code = response.status().as_u16();
        let body: ErrorBody = response.json().await.unwrap_or_default();
        OsbError::Status {
            status_code,
            error_message: body.error,
            description: body.description,
        }
    }

    async fn poll(
        &self,
        url: String,
        service_id: Option<&str>,
        plan_id: Option<&str>,
        operation_key: Option<&str>,
        identity: Option<&OriginatingIdentity>,
    ) -> Result<LastOperationResponse, OsbError> {
        let query = build_query(&[
            ("service_id", service_id),
            ("plan_id", plan_id),
            ("operation", operation_key),
        ]);
        let url = format!("{url}/last_operation{query}");
        debug!("Polling last operation: {}", url);

        let response = self.send(self.client.get(&url), identity).await?;
        if response.status() != StatusCode::OK {
            return Err(Self::status_error(response).await);
        }
        let poll_delay = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body: LastOperationBody = response.json().await?;
        Ok(LastOperationResponse {
            state: body.state,
            description: body.description,
            poll_delay,
        })
    }
}

/// Renders the originating identity header: `<platform> <base64(value)>`
pub fn originating_identity_header(identity: &OriginatingIdentity) -> String {
    format!("{} {}", identity.platform, STANDARD.encode(identity.value.as_bytes()))
}

/// Builds a query string from the pairs whose value is present
fn build_query(pairs: &[(&str, Option<&str>)]) -> String {
    let encoded: Vec<String> = pairs
        .iter()
        .filter_map(|(k, v)| v.map(|v| format!("{}={}", k, urlencoding::encode(v))))
        .collect();
    if encoded.is_empty() {
        String::new()
    } else {
        format!("?{}", encoded.join("&"))
    }
}

fn accepts_incomplete(flag: bool) -> Option<&'static str> {
    if flag { Some("true") } else { None }
}

#[async_trait::async_trait]
impl OsbClientTrait for OsbClient {
    fn configuration(&self) -> &ClientConfiguration {
        &self.config
    }

    async fn get_catalog(&self) -> Result<CatalogResponse, OsbError> {
        let url = format!("{}/v2/catalog", self.base_url);
        debug!("Fetching catalog from {}", url);

        let response = self.send(self.client.get(&url), None).await?;
        if response.status() != StatusCode::OK {
            return Err(Self::status_error(response).await);
        }
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            OsbError::InvalidResponse(format!(
                "error decoding catalog: {} - Response (first 500 chars): {}",
                e,
                text.chars().take(500).collect::<String>()
            ))
        })
    }

    async fn provision_instance(&self, request: &ProvisionRequest) -> Result<ProvisionResponse, OsbError> {
        let query = build_query(&[("accepts_incomplete", accepts_incomplete(request.accepts_incomplete))]);
        let url = format!("{}{}", self.instance_url(&request.instance_id), query);
        let body = ProvisionBody {
            service_id: &request.service_id,
            plan_id: &request.plan_id,
            organization_guid: &request.organization_guid,
            space_guid: &request.space_guid,
            parameters: request.parameters.as_ref(),
            context: request.context.as_ref(),
        };
        debug!("Provisioning instance {}", request.instance_id);

        let response = self
            .send(self.client.put(&url).json(&body), request.originating_identity.as_ref())
            .await?;
        match response.status().as_u16() {
            200 | 201 => {
                let body: AsyncBody = response.json().await.unwrap_or_default();
                Ok(ProvisionResponse {
                    is_async: false,
                    dashboard_url: body.dashboard_url,
                    operation_key: None,
                })
            }
            202 => {
                let body: AsyncBody = response.json().await.unwrap_or_default();
                Ok(ProvisionResponse {
                    is_async: true,
                    dashboard_url: body.dashboard_url,
                    operation_key: body.operation,
                })
            }
            _ => Err(Self::status_error(response).await),
        }
    }

    async fn update_instance(&self, request: &UpdateInstanceRequest) -> Result<UpdateInstanceResponse, OsbError> {
        let query = build_query(&[("accepts_incomplete", accepts_incomplete(request.accepts_incomplete))]);
        let url = format!("{}{}", self.instance_url(&request.instance_id), query);
        let body = UpdateBody {
            service_id: &request.service_id,
            plan_id: request.plan_id.as_deref(),
            parameters: request.parameters.as_ref(),
            previous_values: request.previous_values.as_ref(),
            context: request.context.as_ref(),
        };
        debug!("Updating instance {}", request.instance_id);

        let response = self
            .send(self.client.patch(&url).json(&body), request.originating_identity.as_ref())
            .await?;
        match response.status().as_u16() {
            200 => {
                let body: AsyncBody = response.json().await.unwrap_or_default();
                Ok(UpdateInstanceResponse {
                    is_async: false,
                    dashboard_url: body.dashboard_url,
                    operation_key: None,
                })
            }
            202 => {
                let body: AsyncBody = response.json().await.unwrap_or_default();
                Ok(UpdateInstanceResponse {
                    is_async: true,
                    dashboard_url: body.dashboard_url,
                    operation_key: body.operation,
                })
            }
            _ => Err(Self::status_error(response).await),
        }
    }

    async fn deprovision_instance(&self, request: &DeprovisionRequest) -> Result<DeprovisionResponse, OsbError> {
        let query = build_query(&[
            ("service_id", Some(request.service_id.as_str())),
            ("plan_id", Some(request.plan_id.as_str())),
            ("accepts_incomplete", accepts_incomplete(request.accepts_incomplete)),
        ]);
        let url = format!("{}{}", self.instance_url(&request.instance_id), query);
        debug!("Deprovisioning instance {}", request.instance_id);

        let response = self
            .send(self.client.delete(&url), request.originating_identity.as_ref())
            .await?;
        match response.status().as_u16() {
            200 | 410 => Ok(DeprovisionResponse::default()),
            202 => {
                let body: AsyncBody = response.json().await.unwrap_or_default();
                Ok(DeprovisionResponse {
                    is_async: true,
                    operation_key: body.operation,
                })
            }
            _ => Err(Self::status_error(response).await),
        }
    }

    async fn poll_last_operation(&self, request: &LastOperationRequest) -> Result<LastOperationResponse, OsbError> {
        self.poll(
            self.instance_url(&request.instance_id),
            request.service_id.as_deref(),
            request.plan_id.as_deref(),
            request.operation_key.as_deref(),
            request.originating_identity.as_ref(),
        )
        .await
    }

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, OsbError> {
        let query = build_query(&[("accepts_incomplete", accepts_incomplete(request.accepts_incomplete))]);
        let url = format!("{}{}", self.binding_url(&request.instance_id, &request.binding_id), query);
        let body = BindBodyRequest {
            service_id: &request.service_id,
            plan_id: &request.plan_id,
            app_guid: request.app_guid.as_deref(),
            bind_resource: request.bind_resource.as_ref(),
            parameters: request.parameters.as_ref(),
            context: request.context.as_ref(),
        };
        debug!("Binding {} to instance {}", request.binding_id, request.instance_id);

        let response = self
            .send(self.client.put(&url).json(&body), request.originating_identity.as_ref())
            .await?;
        match response.status().as_u16() {
            200 | 201 => {
                let body: BindBody = response.json().await?;
                Ok(BindResponse {
                    is_async: false,
                    credentials: body.credentials,
                    syslog_drain_url: body.syslog_drain_url,
                    route_service_url: body.route_service_url,
                    operation_key: None,
                })
            }
            202 => {
                let body: BindBody = response.json().await.unwrap_or_default();
                Ok(BindResponse {
                    is_async: true,
                    operation_key: body.operation,
                    ..Default::default()
                })
            }
            _ => Err(Self::status_error(response).await),
        }
    }

    async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse, OsbError> {
        let query = build_query(&[
            ("service_id", Some(request.service_id.as_str())),
            ("plan_id", Some(request.plan_id.as_str())),
            ("accepts_incomplete", accepts_incomplete(request.accepts_incomplete)),
        ]);
        let url = format!("{}{}", self.binding_url(&request.instance_id, &request.binding_id), query);
        debug!("Unbinding {} from instance {}", request.binding_id, request.instance_id);

        let response = self
            .send(self.client.delete(&url), request.originating_identity.as_ref())
            .await?;
        match response.status().as_u16() {
            200 | 410 => Ok(UnbindResponse::default()),
            202 => {
                let body: AsyncBody = response.json().await.unwrap_or_default();
                Ok(UnbindResponse {
                    is_async: true,
                    operation_key: body.operation,
                })
            }
            _ => Err(Self::status_error(response).await),
        }
    }

    async fn poll_binding_last_operation(
        &self,
        request: &BindingLastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError> {
        self.poll(
            self.binding_url(&request.instance_id, &request.binding_id),
            request.service_id.as_deref(),
            request.plan_id.as_deref(),
            request.operation_key.as_deref(),
            request.originating_identity.as_ref(),
        )
        .await
    }

    async fn get_binding(&self, request: &GetBindingRequest) -> Result<GetBindingResponse, OsbError> {
        let url = self.binding_url(&request.instance_id, &request.binding_id);
        let response = self.send(self.client.get(&url), None).await?;
        if response.status() != StatusCode::OK {
            return Err(Self::status_error(response).await);
        }
        Ok(response.json().await?)
    }
}
