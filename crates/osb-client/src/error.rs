//! Broker client errors

use thiserror::Error;

/// Errors that can occur when talking to a service broker
#[derive(Debug, Error)]
pub enum OsbError {
    /// Transport-level failure reported by the HTTP stack
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The broker answered with an unexpected status code
    #[error("Status: {status_code}; ErrorMessage: {}; Description: {}", error_message.as_deref().unwrap_or("<nil>"), description.as_deref().unwrap_or("<nil>"))]
    Status {
        status_code: u16,
        error_message: Option<String>,
        description: Option<String>,
    },

    /// The request did not complete before the client timeout
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The broker could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The broker returned a body that does not match the API
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The client configuration is unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl OsbError {
    /// Builds a status error without a broker-provided body
    pub fn status(status_code: u16) -> Self {
        Self::Status {
            status_code,
            error_message: None,
            description: None,
        }
    }

    /// HTTP status code when the broker answered with an error response
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }

    /// The broker answered `410 Gone`
    pub fn is_gone(&self) -> bool {
        self.status_code() == Some(410)
    }

    /// The request timed out on the client side
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_display_includes_body() {
        let err = OsbError::Status {
            status_code: 409,
            error_message: Some("Conflict".to_string()),
            description: Some("instance exists".to_string()),
        };
        assert_eq!(err.to_string(), "Status: 409; ErrorMessage: Conflict; Description: instance exists");
        assert_eq!(err.status_code(), Some(409));
        assert!(!err.is_gone());
    }

    #[test]
    fn test_classification_helpers() {
        assert!(OsbError::status(410).is_gone());
        assert!(OsbError::Timeout("deadline".to_string()).is_timeout());
        assert!(!OsbError::Connection("refused".to_string()).is_timeout());
        assert_eq!(OsbError::Connection("refused".to_string()).status_code(), None);
    }
}
