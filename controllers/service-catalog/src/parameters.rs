//! Parameter assembly for instances and bindings.
//!
//! Merges the inline `parameters` object with every `parametersFrom` source
//! into one flat JSON object. Values taken from secrets are replaced by
//! [`REDACTED`] in the copy that is persisted in status; the checksum is
//! always computed over the unredacted map.

use crate::error::ControllerError;
use crate::store::ResourceStore;
use catalog_crds::{ParameterValueType, ParametersFromSource};
use k8s_openapi::api::core::v1::Secret;
use osb_client::JsonMap;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Placeholder stored in status for secret-sourced values
pub const REDACTED: &str = "<redacted>";

/// Result of merging all parameter sources
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltParameters {
    /// Sent to the broker
    pub parameters: JsonMap,
    /// Persisted in status
    pub redacted: JsonMap,
    /// Hex SHA-256 of the canonical form of `parameters`
    pub checksum: String,
}

impl BuiltParameters {
    pub fn redacted_value(&self) -> Value {
        Value::Object(self.redacted.clone())
    }
}

/// Hex SHA-256 over the canonical serialization of `params`.
///
/// `serde_json::Map` keeps keys sorted, so equal maps serialize identically
/// regardless of insertion order.
pub fn checksum(params: &JsonMap) -> String {
    let canonical = serde_json::to_string(params).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Build the broker parameters for an object in `namespace`.
///
/// Returns `None` when no source contributed any key. Overlapping keys,
/// malformed JSON and unreadable secrets are all reported as
/// [`ControllerError::Parameters`].
pub async fn build_parameters(
    secrets: &dyn ResourceStore<Secret>,
    namespace: &str,
    parameters_from: &[ParametersFromSource],
    parameters: Option<&Value>,
) -> Result<Option<BuiltParameters>, ControllerError> {
    let mut merged = JsonMap::new();
    let mut redacted = JsonMap::new();

    if let Some(inline) = parameters {
        let inline = as_object(inline, "parameters")?;
        merge(&mut merged, &mut redacted, inline, false)?;
    }

    for source in parameters_from {
        if let Some(value) = &source.value {
            let map = as_object(value, "parametersFrom value")?;
            merge(&mut merged, &mut redacted, map, false)?;
        }
        if let Some(secret_ref) = &source.secret_ref {
            let data = secret_data(secrets, namespace, &secret_ref.name).await?;
            let mut map = JsonMap::new();
            for (key, bytes) in data {
                map.insert(key, decode_value(&bytes, secret_ref.value_type)?);
            }
            merge(&mut merged, &mut redacted, map, true)?;
        }
        if let Some(key_ref) = &source.secret_key_ref {
            let data = secret_data(secrets, namespace, &key_ref.name).await?;
            let bytes = data.into_iter().find(|(k, _)| *k == key_ref.key).map(|(_, v)| v).ok_or_else(|| {
                ControllerError::Parameters(format!("secret {}/{} has no key {:?}", namespace, key_ref.name, key_ref.key))
            })?;
            if let Value::Object(map) = decode_value(&bytes, ParameterValueType::Json)? {
                merge(&mut merged, &mut redacted, map, true)?;
            }
        }
    }

    if merged.is_empty() {
        return Ok(None);
    }
    let checksum = checksum(&merged);
    Ok(Some(BuiltParameters {
        parameters: merged,
        redacted,
        checksum,
    }))
}

fn as_object(value: &Value, what: &str) -> Result<JsonMap, ControllerError> {
    match value {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(JsonMap::new()),
        other => Err(ControllerError::Parameters(format!(
            "{what} must be a JSON object, got {}",
            type_name(other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn merge(merged: &mut JsonMap, redacted: &mut JsonMap, source: JsonMap, secret: bool) -> Result<(), ControllerError> {
    for (key, value) in source {
        if merged.contains_key(&key) {
            return Err(ControllerError::Parameters(format!(
                "conflict: duplicate entry for parameter {key:?}"
            )));
        }
        let shown = if secret { Value::String(REDACTED.to_string()) } else { value.clone() };
        redacted.insert(key.clone(), shown);
        merged.insert(key, value);
    }
    Ok(())
}

async fn secret_data(
    secrets: &dyn ResourceStore<Secret>,
    namespace: &str,
    name: &str,
) -> Result<Vec<(String, Vec<u8>)>, ControllerError> {
    let secret = secrets.get(namespace, name).await.map_err(|e| {
        ControllerError::Parameters(format!("failed to read secret {namespace}/{name}: {e}"))
    })?;
    Ok(secret
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.0))
        .collect())
}

fn decode_value(bytes: &[u8], value_type: ParameterValueType) -> Result<Value, ControllerError> {
    match value_type {
        ParameterValueType::String => Ok(Value::String(String::from_utf8_lossy(bytes).into_owned())),
        ParameterValueType::Json => match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(map)) => Ok(Value::Object(map)),
            Ok(other) => Err(ControllerError::Parameters(format!(
                "failed to unmarshal parameters as JSON object: got {}",
                type_name(&other)
            ))),
            Err(e) => Err(ControllerError::Parameters(format!(
                "failed to unmarshal parameters as JSON object: {e}"
            ))),
        },
    }
}
