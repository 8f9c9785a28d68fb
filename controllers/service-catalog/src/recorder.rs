//! Event recording for reconciliation outcomes.
//!
//! Every condition a reconciler writes is mirrored as an event with the same
//! reason. Publishing is best effort: failures are logged and never fail a
//! reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube_runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// Component name events are reported under
pub const REPORTING_CONTROLLER: &str = "service-catalog-controller";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("Normal"),
            Self::Warning => f.write_str("Warning"),
        }
    }
}

#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str);
}

/// Publishes events through the Kubernetes events API
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: REPORTING_CONTROLLER.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        let event = Event {
            type_: match event_type {
                EventType::Normal => KubeEventType::Normal,
                EventType::Warning => KubeEventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, object).await {
            warn!(
                object = ?object.name,
                reason,
                error = %e,
                "failed to publish event"
            );
        }
    }
}

/// Writes events to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingRecorder;

#[async_trait]
impl EventRecorder for LoggingRecorder {
    async fn record(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        let namespace = object.namespace.as_deref().unwrap_or_default();
        let name = object.name.as_deref().unwrap_or_default();
        match event_type {
            EventType::Normal => info!(namespace, name, reason, "{}", message),
            EventType::Warning => warn!(namespace, name, reason, "{}", message),
        }
    }
}

/// Collects events as `"{type} {reason} {message}"` strings
#[derive(Debug, Default, Clone)]
pub struct FakeRecorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl FakeRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Whether any recorded event carries `reason`
    pub fn has_reason(&self, reason: &str) -> bool {
        self.events().iter().any(|e| e.split(' ').nth(1) == Some(reason))
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[async_trait]
impl EventRecorder for FakeRecorder {
    async fn record(&self, _object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{event_type} {reason} {message}"));
    }
}
