//! Open Service Broker API Client
//!
//! A Rust client for brokers implementing the Open Service Broker API
//! (version 2.13). Provides typed requests and responses for catalog,
//! instance, binding and last-operation endpoints.
//!
//! # Example
//!
//! ```no_run
//! use osb_client::{ClientConfiguration, OsbClient, OsbClientTrait, ProvisionRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfiguration::new("my-broker", "https://broker.example.com");
//! let client = OsbClient::new(config)?;
//!
//! let catalog = client.get_catalog().await?;
//! let service = &catalog.services[0];
//!
//! let response = client
//!     .provision_instance(&ProvisionRequest {
//!         instance_id: "instance-1".to_string(),
//!         accepts_incomplete: true,
//!         service_id: service.id.clone(),
//!         plan_id: service.plans[0].id.clone(),
//!         ..Default::default()
//!     })
//!     .await?;
//! println!("async: {}", response.is_async);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod osb_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::OsbClient;
pub use error::OsbError;
pub use models::*;
pub use osb_trait::{CreateClientFn, OsbClientTrait};
#[cfg(feature = "test-util")]
pub use mock::{MockCall, MockFailure, MockOsbClient};
