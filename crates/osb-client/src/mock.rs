//! Mock OsbClient for unit testing
//!
//! Each operation has a queue of scripted reactions. A reaction is consumed
//! when more follow it; the last one is repeated for every further call.
//! Every request is recorded so tests can assert on what was sent.

use crate::error::OsbError;
use crate::models::*;
use crate::osb_trait::{CreateClientFn, OsbClientTrait};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Failure a scripted reaction produces
#[derive(Debug, Clone, PartialEq)]
pub enum MockFailure {
    /// Broker answered with this HTTP status
    Status(u16),
    /// Broker answered with a status and an error body
    StatusWithBody {
        status_code: u16,
        error_message: String,
        description: String,
    },
    Timeout,
    Connection(String),
    InvalidResponse(String),
}

impl From<MockFailure> for OsbError {
    fn from(failure: MockFailure) -> Self {
        match failure {
            MockFailure::Status(code) => OsbError::status(code),
            MockFailure::StatusWithBody {
                status_code,
                error_message,
                description,
            } => OsbError::Status {
                status_code,
                error_message: Some(error_message),
                description: Some(description),
            },
            MockFailure::Timeout => OsbError::Timeout("mock request timed out".to_string()),
            MockFailure::Connection(msg) => OsbError::Connection(msg),
            MockFailure::InvalidResponse(msg) => OsbError::InvalidResponse(msg),
        }
    }
}

/// A request received by the mock
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    GetCatalog,
    Provision(ProvisionRequest),
    Update(UpdateInstanceRequest),
    Deprovision(DeprovisionRequest),
    PollLastOperation(LastOperationRequest),
    Bind(BindRequest),
    Unbind(UnbindRequest),
    PollBindingLastOperation(BindingLastOperationRequest),
    GetBinding(GetBindingRequest),
}

impl MockCall {
    pub fn name(&self) -> &'static str {
        match self {
            MockCall::GetCatalog => "get_catalog",
            MockCall::Provision(_) => "provision_instance",
            MockCall::Update(_) => "update_instance",
            MockCall::Deprovision(_) => "deprovision_instance",
            MockCall::PollLastOperation(_) => "poll_last_operation",
            MockCall::Bind(_) => "bind",
            MockCall::Unbind(_) => "unbind",
            MockCall::PollBindingLastOperation(_) => "poll_binding_last_operation",
            MockCall::GetBinding(_) => "get_binding",
        }
    }
}

type Reactions<T> = VecDeque<Result<T, MockFailure>>;

#[derive(Default)]
struct Script {
    catalog: Reactions<CatalogResponse>,
    provision: Reactions<ProvisionResponse>,
    update: Reactions<UpdateInstanceResponse>,
    deprovision: Reactions<DeprovisionResponse>,
    last_operation: Reactions<LastOperationResponse>,
    bind: Reactions<BindResponse>,
    unbind: Reactions<UnbindResponse>,
    binding_last_operation: Reactions<LastOperationResponse>,
    get_binding: Reactions<GetBindingResponse>,
}

fn next<T: Clone>(queue: &mut Reactions<T>, default: impl FnOnce() -> T) -> Result<T, OsbError> {
    let reaction = if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    };
    match reaction {
        Some(Ok(value)) => Ok(value),
        Some(Err(failure)) => Err(failure.into()),
        None => Ok(default()),
    }
}

fn succeeded() -> LastOperationResponse {
    LastOperationResponse {
        state: LastOperationState::Succeeded,
        description: None,
        poll_delay: None,
    }
}

/// Mock OsbClient for testing
///
/// Unscripted operations succeed synchronously: an empty catalog, sync
/// provision/update/deprovision/unbind, a bind with empty credentials and
/// `succeeded` for last-operation polls.
#[derive(Clone)]
pub struct MockOsbClient {
    config: ClientConfiguration,
    script: Arc<Mutex<Script>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    built_with: Arc<Mutex<Vec<ClientConfiguration>>>,
}

impl MockOsbClient {
    /// Create a new mock client
    pub fn new(config: ClientConfiguration) -> Self {
        Self {
            config,
            script: Arc::new(Mutex::new(Script::default())),
            calls: Arc::new(Mutex::new(Vec::new())),
            built_with: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Mock for a broker named `name` at a placeholder URL
    pub fn for_broker(name: &str) -> Self {
        Self::new(ClientConfiguration::new(name, format!("http://{name}.broker.test")))
    }

    /// A client factory that always hands out this mock
    ///
    /// The configurations passed to the factory are kept; see [`Self::built_with`].
    pub fn create_fn(&self) -> CreateClientFn {
        let mock = self.clone();
        Arc::new(move |config: ClientConfiguration| {
            mock.built_with.lock().unwrap_or_else(PoisonError::into_inner).push(config.clone());
            let mut client = mock.clone();
            client.config = config;
            Ok(Arc::new(client) as Arc<dyn OsbClientTrait>)
        })
    }

    /// Configurations handed to the factory returned by [`Self::create_fn`]
    pub fn built_with(&self) -> Vec<ClientConfiguration> {
        self.built_with.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn push_catalog(&self, reaction: Result<CatalogResponse, MockFailure>) {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).catalog.push_back(reaction);
    }

    pub fn push_provision(&self, reaction: Result<ProvisionResponse, MockFailure>) {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).provision.push_back(reaction);
    }

    pub fn push_update(&self, reaction: Result<UpdateInstanceResponse, MockFailure>) {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).update.push_back(reaction);
    }

    pub fn push_deprovision(&self, reaction: Result<DeprovisionResponse, MockFailure>) {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).deprovision.push_back(reaction);
    }

    pub fn push_last_operation(&self, reaction: Result<LastOperationResponse, MockFailure>) {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).last_operation.push_back(reaction);
    }

    pub fn push_bind(&self, reaction: Result<BindResponse, MockFailure>) {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).bind.push_back(reaction);
    }

    pub fn push_unbind(&self, reaction: Result<UnbindResponse, MockFailure>) {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).unbind.push_back(reaction);
    }

    pub fn push_binding_last_operation(&self, reaction: Result<LastOperationResponse, MockFailure>) {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).binding_last_operation.push_back(reaction);
    }

    pub fn push_get_binding(&self, reaction: Result<GetBindingResponse, MockFailure>) {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).get_binding.push_back(reaction);
    }

    /// All requests received so far, in order
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of calls to the operation named `name` (see [`MockCall::name`])
    pub fn count(&self, name: &str) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).iter().filter(|c| c.name() == name).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn provision_requests(&self) -> Vec<ProvisionRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Provision(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn update_requests(&self) -> Vec<UpdateInstanceRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Update(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn deprovision_requests(&self) -> Vec<DeprovisionRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Deprovision(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn bind_requests(&self) -> Vec<BindRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Bind(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(call);
    }
}

#[async_trait::async_trait]
impl OsbClientTrait for MockOsbClient {
    fn configuration(&self) -> &ClientConfiguration {
        &self.config
    }

    async fn get_catalog(&self) -> Result<CatalogResponse, OsbError> {
        self.record(MockCall::GetCatalog);
        next(&mut self.script.lock().unwrap_or_else(PoisonError::into_inner).catalog, CatalogResponse::default)
    }

    async fn provision_instance(&self, request: &ProvisionRequest) -> Result<ProvisionResponse, OsbError> {
        self.record(MockCall::Provision(request.clone()));
        next(&mut self.script.lock().unwrap_or_else(PoisonError::into_inner).provision, ProvisionResponse::default)
    }

    async fn update_instance(&self, request: &UpdateInstanceRequest) -> Result<UpdateInstanceResponse, OsbError> {
        self.record(MockCall::Update(request.clone()));
        next(&mut self.script.lock().unwrap_or_else(PoisonError::into_inner).update, UpdateInstanceResponse::default)
    }

    async fn deprovision_instance(&self, request: &DeprovisionRequest) -> Result<DeprovisionResponse, OsbError> {
        self.record(MockCall::Deprovision(request.clone()));
        next(&mut self.script.lock().unwrap_or_else(PoisonError::into_inner).deprovision, DeprovisionResponse::default)
    }

    async fn poll_last_operation(&self, request: &LastOperationRequest) -> Result<LastOperationResponse, OsbError> {
        self.record(MockCall::PollLastOperation(request.clone()));
        next(&mut self.script.lock().unwrap_or_else(PoisonError::into_inner).last_operation, succeeded)
    }

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, OsbError> {
        self.record(MockCall::Bind(request.clone()));
        next(&mut self.script.lock().unwrap_or_else(PoisonError::into_inner).bind, || BindResponse {
            credentials: Some(JsonMap::new()),
            ..Default::default()
        })
    }

    async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse, OsbError> {
        self.record(MockCall::Unbind(request.clone()));
        next(&mut self.script.lock().unwrap_or_else(PoisonError::into_inner).unbind, UnbindResponse::default)
    }

    async fn poll_binding_last_operation(
        &self,
        request: &BindingLastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError> {
        self.record(MockCall::PollBindingLastOperation(request.clone()));
        next(&mut self.script.lock().unwrap_or_else(PoisonError::into_inner).binding_last_operation, succeeded)
    }

    async fn get_binding(&self, request: &GetBindingRequest) -> Result<GetBindingResponse, OsbError> {
        self.record(MockCall::GetBinding(request.clone()));
        next(&mut self.script.lock().unwrap_or_else(PoisonError::into_inner).get_binding, GetBindingResponse::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_last_reaction_repeats() {
        let mock = MockOsbClient::for_broker("b1");
        mock.push_provision(Err(MockFailure::Status(500)));
        mock.push_provision(Ok(ProvisionResponse::default()));

        let request = ProvisionRequest::default();
        let first = mock.provision_instance(&request).await;
        assert_eq!(first.unwrap_err().status_code(), Some(500));
        assert!(mock.provision_instance(&request).await.is_ok());
        assert!(mock.provision_instance(&request).await.is_ok(), "Last reaction should be reused");
        assert_eq!(mock.count("provision_instance"), 3);
    }

    #[tokio::test]
    async fn test_create_fn_records_configuration() {
        let mock = MockOsbClient::for_broker("b1");
        let factory = mock.create_fn();
        let config = ClientConfiguration::new("b1", "http://other");
        let client = factory(config.clone()).expect("factory should succeed");
        assert_eq!(client.configuration(), &config);
        assert_eq!(mock.built_with(), vec![config]);
    }
}
