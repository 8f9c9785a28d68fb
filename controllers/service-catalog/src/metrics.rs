//! Prometheus metrics and the probe/metrics HTTP endpoint.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `servicecatalog_broker_service_class_count` | Gauge | `broker` |
//! | `servicecatalog_broker_service_plan_count` | Gauge | `broker` |
//! | `servicecatalog_osb_request_count` | Counter | `broker`, `method`, `status` |
//! | `servicecatalog_reconcile_count` | Counter | `kind`, `result` |
//!
//! Broker-labelled series are removed when the broker is deleted.

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use osb_client::OsbError;
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    service_class_count: GaugeVec,
    service_plan_count: GaugeVec,
    osb_request_count: CounterVec,
    reconcile_count: CounterVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create the metric families in a fresh registry
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let service_class_count = GaugeVec::new(
            Opts::new(
                "servicecatalog_broker_service_class_count",
                "Number of services classes by Broker.",
            ),
            &["broker"],
        )?;
        registry.register(Box::new(service_class_count.clone()))?;

        let service_plan_count = GaugeVec::new(
            Opts::new(
                "servicecatalog_broker_service_plan_count",
                "Number of services plans by Broker.",
            ),
            &["broker"],
        )?;
        registry.register(Box::new(service_plan_count.clone()))?;

        let osb_request_count = CounterVec::new(
            Opts::new(
                "servicecatalog_osb_request_count",
                "Cumulative number of HTTP requests from the OSB Client to the specified Service Broker grouped by broker name, broker method, and response status.",
            ),
            &["broker", "method", "status"],
        )?;
        registry.register(Box::new(osb_request_count.clone()))?;

        let reconcile_count = CounterVec::new(
            Opts::new("servicecatalog_reconcile_count", "Reconciliation passes by kind and result."),
            &["kind", "result"],
        )?;
        registry.register(Box::new(reconcile_count.clone()))?;

        Ok(Self {
            registry,
            service_class_count,
            service_plan_count,
            osb_request_count,
            reconcile_count,
        })
    }

    /// Publish how many classes and plans `broker` offers
    pub fn set_broker_counts(&self, broker: &str, classes: usize, plans: usize) {
        self.service_class_count.with_label_values(&[broker]).set(classes as f64);
        self.service_plan_count.with_label_values(&[broker]).set(plans as f64);
    }

    /// Drop every series labelled with `broker`
    pub fn remove_broker(&self, broker: &str) {
        // Absent label sets are not an error worth surfacing
        let _ = self.service_class_count.remove_label_values(&[broker]);
        let _ = self.service_plan_count.remove_label_values(&[broker]);
    }

    /// Current class gauge for `broker`
    pub fn class_count(&self, broker: &str) -> f64 {
        self.service_class_count.with_label_values(&[broker]).get()
    }

    pub fn plan_count(&self, broker: &str) -> f64 {
        self.service_plan_count.with_label_values(&[broker]).get()
    }

    /// Count a broker request by the outcome of the call
    pub fn record_osb_request<T>(&self, broker: &str, method: &str, result: &Result<T, OsbError>) {
        let status = match result {
            Ok(_) => "2xx".to_string(),
            Err(e) => match e.status_code() {
                Some(code) => format!("{}xx", code / 100),
                None if e.is_timeout() => "timeout".to_string(),
                None => "client-error".to_string(),
            },
        };
        self.osb_request_count.with_label_values(&[broker, method, status.as_str()]).inc();
    }

    /// Requests counted for one broker, method and status bucket
    pub fn osb_request_count(&self, broker: &str, method: &str, status: &str) -> f64 {
        self.osb_request_count.with_label_values(&[broker, method, status]).get()
    }

    /// Count one reconcile pass of `kind` ending in `result`
    pub fn record_reconcile(&self, kind: &str, result: &str) {
        self.reconcile_count.with_label_values(&[kind, result]).inc();
    }

    /// Passes counted for one kind and result label
    pub fn reconcile_count(&self, kind: &str, result: &str) -> f64 {
        self.reconcile_count.with_label_values(&[kind, result]).get()
    }

    /// Text exposition of every registered family
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    match metrics.encode_text() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// `/metrics` and `/healthz`
pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(metrics)
}

/// Serve [`router`] on `addr` until `stop` fires
pub async fn serve(addr: SocketAddr, metrics: Arc<Metrics>, mut stop: watch::Receiver<bool>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "serving metrics and health probes");
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move {
            // A dropped sender also means shutdown
            let _ = stop.wait_for(|stopped| *stopped).await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[test]
    fn test_broker_counts_and_removal() {
        let metrics = Metrics::new().unwrap();
        metrics.set_broker_counts("default/b", 2, 5);
        assert_eq!(metrics.class_count("default/b"), 2.0);
        assert_eq!(metrics.plan_count("default/b"), 5.0);

        metrics.remove_broker("default/b");
        let text = metrics.encode_text().unwrap();
        assert!(!text.contains("default/b"), "Removed broker should have no series");
    }

    #[test]
    fn test_osb_request_status_buckets() {
        let metrics = Metrics::new().unwrap();
        metrics.record_osb_request::<()>("b", "provision_instance", &Ok(()));
        metrics.record_osb_request::<()>("b", "provision_instance", &Err(OsbError::status(503)));
        metrics.record_osb_request::<()>("b", "provision_instance", &Err(OsbError::Timeout("deadline".to_string())));

        assert_eq!(metrics.osb_request_count("b", "provision_instance", "2xx"), 1.0);
        assert_eq!(metrics.osb_request_count("b", "provision_instance", "5xx"), 1.0);
        assert_eq!(metrics.osb_request_count("b", "provision_instance", "timeout"), 1.0);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.set_broker_counts("default/b", 1, 2);

        let response = router(Arc::clone(&metrics))
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("servicecatalog_broker_service_plan_count{broker=\"default/b\"} 2"));

        let health = router(metrics)
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
    }
}
