//! OsbClient trait for mocking
//!
//! The concrete `OsbClient` implements this trait; controller tests use
//! `MockOsbClient` instead.

use crate::error::OsbError;
use crate::models::*;
use std::sync::Arc;

/// Trait for Open Service Broker API operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait OsbClientTrait: Send + Sync {
    /// Configuration the client was built from
    fn configuration(&self) -> &ClientConfiguration;

    async fn get_catalog(&self) -> Result<CatalogResponse, OsbError>;

    async fn provision_instance(&self, request: &ProvisionRequest) -> Result<ProvisionResponse, OsbError>;
    async fn update_instance(&self, request: &UpdateInstanceRequest) -> Result<UpdateInstanceResponse, OsbError>;
    async fn deprovision_instance(&self, request: &DeprovisionRequest) -> Result<DeprovisionResponse, OsbError>;
    async fn poll_last_operation(&self, request: &LastOperationRequest) -> Result<LastOperationResponse, OsbError>;

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, OsbError>;
    async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse, OsbError>;
    async fn poll_binding_last_operation(&self, request: &BindingLastOperationRequest) -> Result<LastOperationResponse, OsbError>;
    async fn get_binding(&self, request: &GetBindingRequest) -> Result<GetBindingResponse, OsbError>;
}

/// Builds a broker client from its configuration
pub type CreateClientFn =
    Arc<dyn Fn(ClientConfiguration) -> Result<Arc<dyn OsbClientTrait>, OsbError> + Send + Sync>;
