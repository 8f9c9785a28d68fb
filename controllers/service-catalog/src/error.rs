//! Controller-specific error types.
//!
//! This module defines error types specific to the service catalog controller
//! that are not covered by upstream library errors.

use crate::metrics::MetricsError;
use kube::Error as KubeError;
use osb_client::OsbError;
use thiserror::Error;

/// Errors that can occur in the service catalog controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Broker API error that was not mapped onto a condition
    #[error("Broker error: {0}")]
    Broker(#[from] OsbError),

    /// Object does not exist in the store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Write lost an optimistic concurrency race
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Retriable failure, already recorded as a condition on the object
    #[error("{reason}: {message}")]
    Operation { reason: String, message: String },

    /// Failure that must not be retried on this generation
    #[error("{reason}: {message}")]
    Terminal { reason: String, message: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Parameters could not be assembled
    #[error("Error with parameters: {0}")]
    Parameters(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metric registration or the metrics endpoint failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),
}

impl ControllerError {
    pub fn operation(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Operation {
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn terminal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Terminal {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// The store reported the object missing
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Kube(KubeError::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Kube(KubeError::Api(e)) => e.code == 409,
            _ => false,
        }
    }

    /// Work queue should not requeue the key
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. } | Self::InvalidConfig(_))
    }

    /// Condition reason carried by operation and terminal errors
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Operation { reason, .. } | Self::Terminal { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Human-readable detail without the reason prefix
    pub fn message(&self) -> String {
        match self {
            Self::Operation { message, .. } | Self::Terminal { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
