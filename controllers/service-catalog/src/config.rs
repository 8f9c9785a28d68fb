//! Controller configuration loaded from the environment.

use crate::error::ControllerError;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Tunables and feature flags for the controller
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Catalog refresh cadence for brokers with the `Duration` relist policy
    pub broker_relist_interval: Duration,
    /// Window after which retriable failures escalate to terminal ones
    pub reconciliation_retry_duration: Duration,
    pub osb_api_request_timeout: Duration,
    /// Workers per reconciled kind
    pub concurrent_syncs: usize,
    /// Send the platform context profile with broker requests
    pub osb_api_context_profile: bool,
    pub cluster_id_config_map_name: String,
    pub cluster_id_config_map_namespace: String,
    pub originating_identity: bool,
    pub cascading_deletion: bool,
    pub update_dashboard_url: bool,
    pub metrics_addr: SocketAddr,
    /// Restrict watches to one namespace
    pub watch_namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            broker_relist_interval: Duration::from_secs(15 * 60),
            reconciliation_retry_duration: Duration::from_secs(7 * 24 * 60 * 60),
            osb_api_request_timeout: Duration::from_secs(60),
            concurrent_syncs: 5,
            osb_api_context_profile: true,
            cluster_id_config_map_name: "cluster-info".to_string(),
            cluster_id_config_map_namespace: "default".to_string(),
            originating_identity: false,
            cascading_deletion: false,
            update_dashboard_url: false,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            watch_namespace: None,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("BROKER_RELIST_INTERVAL") {
            config.broker_relist_interval = parse_duration(&v)?;
        }
        if let Some(v) = lookup("RECONCILIATION_RETRY_DURATION") {
            config.reconciliation_retry_duration = parse_duration(&v)?;
        }
        if let Some(v) = lookup("OSB_API_REQUEST_TIMEOUT") {
            config.osb_api_request_timeout = parse_duration(&v)?;
        }
        if let Some(v) = lookup("CONCURRENT_SYNCS") {
            config.concurrent_syncs = v.trim().parse().map_err(|e| {
                ControllerError::InvalidConfig(format!("CONCURRENT_SYNCS={v}: {e}"))
            })?;
            if config.concurrent_syncs == 0 {
                return Err(ControllerError::InvalidConfig(
                    "CONCURRENT_SYNCS must be at least 1".to_string(),
                ));
            }
        }
        if let Some(v) = lookup("OSB_API_CONTEXT_PROFILE") {
            config.osb_api_context_profile = parse_bool("OSB_API_CONTEXT_PROFILE", &v)?;
        }
        if let Some(v) = lookup("CLUSTER_ID_CONFIGMAP_NAME") {
            config.cluster_id_config_map_name = v;
        }
        if let Some(v) = lookup("CLUSTER_ID_CONFIGMAP_NAMESPACE") {
            config.cluster_id_config_map_namespace = v;
        }
        if let Some(v) = lookup("ORIGINATING_IDENTITY") {
            config.originating_identity = parse_bool("ORIGINATING_IDENTITY", &v)?;
        }
        if let Some(v) = lookup("CASCADING_DELETION") {
            config.cascading_deletion = parse_bool("CASCADING_DELETION", &v)?;
        }
        if let Some(v) = lookup("UPDATE_DASHBOARD_URL") {
            config.update_dashboard_url = parse_bool("UPDATE_DASHBOARD_URL", &v)?;
        }
        if let Some(v) = lookup("METRICS_ADDR") {
            config.metrics_addr = v
                .parse()
                .map_err(|e| ControllerError::InvalidConfig(format!("METRICS_ADDR={v}: {e}")))?;
        }
        config.watch_namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty());

        Ok(config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ControllerError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ControllerError::InvalidConfig(format!("{key}={other}: expected a boolean"))),
    }
}

/// Parse a duration with unit suffixes, e.g. `15m`, `1h30m`, `500ms`
pub fn parse_duration(input: &str) -> Result<Duration, ControllerError> {
    let s = input.trim();
    let invalid = || ControllerError::InvalidConfig(format!("invalid duration {input:?}"));
    if s.is_empty() {
        return Err(invalid());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if number_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total += Duration::from_secs_f64(value * seconds_per_unit);
    }
    Ok(total)
}
