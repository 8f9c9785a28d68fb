//! Process-wide cache of broker clients.
//!
//! One client per broker key, replaced whenever the broker's client
//! configuration (URL, credentials, TLS settings, timeout) changes.

use crate::error::ControllerError;
use crate::store::{ResourceStore, object_key};
use catalog_crds::ServiceBroker;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use osb_client::{AuthConfig, ClientConfiguration, CreateClientFn, OsbClientTrait, OsbError};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Reason recorded when broker credentials cannot be read
pub const REASON_ERROR_GETTING_AUTH_CREDENTIALS: &str = "ErrorGettingAuthCredentials";

struct CachedClient {
    config: ClientConfiguration,
    client: Arc<dyn OsbClientTrait>,
}

pub struct BrokerClientManager {
    create_client: CreateClientFn,
    clients: RwLock<HashMap<String, CachedClient>>,
}

impl std::fmt::Debug for BrokerClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("BrokerClientManager").field("clients", &keys).finish()
    }
}

impl BrokerClientManager {
    pub fn new(create_client: CreateClientFn) -> Self {
        Self {
            create_client,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Return the cached client for `key`, building a new one if none exists
    /// or `config` differs from the one it was built with
    pub fn update_broker_client(
        &self,
        key: &str,
        config: ClientConfiguration,
    ) -> Result<Arc<dyn OsbClientTrait>, OsbError> {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = clients.get(key).filter(|cached| cached.config == config) {
            return Ok(Arc::clone(&cached.client));
        }
        debug!(broker = %key, url = %config.url, "building broker client");
        let client = (self.create_client)(config.clone())?;
        clients.insert(
            key.to_string(),
            CachedClient {
                config,
                client: Arc::clone(&client),
            },
        );
        Ok(client)
    }

    pub fn broker_client(&self, key: &str) -> Option<Arc<dyn OsbClientTrait>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|cached| Arc::clone(&cached.client))
    }

    pub fn remove_broker_client(&self, key: &str) {
        debug!(broker = %key, "removing broker client");
        self.clients.write().unwrap_or_else(PoisonError::into_inner).remove(key);
    }
}

/// Cache key of a broker
pub fn broker_key(broker: &ServiceBroker) -> String {
    object_key(&broker.namespace().unwrap_or_default(), &broker.name_any())
}

fn secret_field(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
        .or_else(|| secret.string_data.as_ref().and_then(|data| data.get(key).cloned()))
}

fn auth_error(broker: &ServiceBroker, detail: String) -> ControllerError {
    ControllerError::operation(
        REASON_ERROR_GETTING_AUTH_CREDENTIALS,
        format!("Error getting broker auth credentials for broker {:?}: {}", broker.name_any(), detail),
    )
}

/// Read the credentials referenced by the broker's auth info
pub async fn broker_auth_config(
    broker: &ServiceBroker,
    secrets: &dyn ResourceStore<Secret>,
) -> Result<Option<AuthConfig>, ControllerError> {
    let Some(auth) = broker.spec.auth_info.as_ref() else {
        return Ok(None);
    };
    let namespace = broker.namespace().unwrap_or_default();

    if let Some(basic) = &auth.basic {
        let secret = secrets
            .get(&namespace, &basic.secret_ref.name)
            .await
            .map_err(|e| auth_error(broker, e.to_string()))?;
        let username = secret_field(&secret, "username")
            .ok_or_else(|| auth_error(broker, format!("secret {} has no username", basic.secret_ref.name)))?;
        let password = secret_field(&secret, "password")
            .ok_or_else(|| auth_error(broker, format!("secret {} has no password", basic.secret_ref.name)))?;
        return Ok(Some(AuthConfig::Basic { username, password }));
    }
    if let Some(bearer) = &auth.bearer {
        let secret = secrets
            .get(&namespace, &bearer.secret_ref.name)
            .await
            .map_err(|e| auth_error(broker, e.to_string()))?;
        let token = secret_field(&secret, "token")
            .ok_or_else(|| auth_error(broker, format!("secret {} has no token", bearer.secret_ref.name)))?;
        return Ok(Some(AuthConfig::Bearer { token }));
    }
    Ok(None)
}

/// Client configuration for `broker`, including its resolved credentials
pub async fn client_configuration(
    broker: &ServiceBroker,
    secrets: &dyn ResourceStore<Secret>,
    timeout: Duration,
) -> Result<ClientConfiguration, ControllerError> {
    let mut config = ClientConfiguration::new(broker_key(broker), broker.spec.url.clone());
    config.auth_config = broker_auth_config(broker, secrets).await?;
    config.insecure = broker.spec.insecure_skip_tls_verify;
    config.ca_data = broker.spec.ca_bundle.as_ref().map(|ca| ca.as_bytes().to_vec());
    config.timeout = timeout;
    Ok(config)
}
