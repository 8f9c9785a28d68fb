//! Credentials Secret of a binding.
//!
//! The Secret named by `spec.secretName` is created with the binding as its
//! controller owner. A Secret of that name owned by anything else is never
//! written or deleted.

use super::REASON_ERROR_INJECTING_BIND_RESULT;
use crate::error::ControllerError;
use crate::reconciler::{Reconciler, fetch};
use crate::store::ResourceStore;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use catalog_crds::{SecretTransform, ServiceBinding};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use osb_client::JsonMap;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// A credential before it is written to the Secret
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialValue {
    /// As returned by the broker
    Json(Value),
    /// Raw bytes, from a transform value or another Secret
    Bytes(Vec<u8>),
}

impl CredentialValue {
    /// Secret payload: strings verbatim, other JSON serialized
    fn to_secret_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Json(Value::String(s)) => Ok(s.as_bytes().to_vec()),
            Self::Json(value) => serde_json::to_vec(value),
            Self::Bytes(bytes) => Ok(bytes.clone()),
        }
    }

    /// JSON form; bytes are base64 encoded
    fn to_json(&self) -> Value {
        match self {
            Self::Json(value) => value.clone(),
            Self::Bytes(bytes) => Value::String(STANDARD.encode(bytes)),
        }
    }
}

pub type Credentials = BTreeMap<String, CredentialValue>;

/// Resolve a dotted path such as `{.connection.host}` against the credentials.
///
/// Numeric segments index into arrays.
pub fn evaluate_json_path(expression: &str, credentials: &Credentials) -> Result<CredentialValue, String> {
    let path = expression.trim();
    let path = path.strip_prefix('{').and_then(|p| p.strip_suffix('}')).unwrap_or(path);
    let path = path.trim().trim_start_matches('$').trim_start_matches('.');
    let mut segments = path.split('.').filter(|s| !s.is_empty());

    let Some(first) = segments.next() else {
        return Err(format!("empty JSONPath expression {expression:?}"));
    };
    let root = credentials
        .get(first)
        .ok_or_else(|| format!("{expression}: key {first:?} not found"))?;

    let mut current = match root {
        CredentialValue::Json(value) => value,
        CredentialValue::Bytes(_) => {
            return match segments.next() {
                None => Ok(root.clone()),
                Some(segment) => Err(format!("{expression}: cannot descend into {segment:?} of a binary value")),
            };
        }
    };
    for segment in segments {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| format!("{expression}: {segment:?} not found"))?;
    }
    Ok(CredentialValue::Json(current.clone()))
}

/// Apply `transforms` to `credentials` in order.
///
/// `AddKeysFrom` reads Secrets from `namespace` unless the reference names
/// another one.
pub async fn apply_secret_transforms(
    secrets: &dyn ResourceStore<Secret>,
    namespace: &str,
    transforms: &[SecretTransform],
    credentials: &mut Credentials,
) -> Result<(), ControllerError> {
    for transform in transforms {
        if let Some(add) = &transform.add_key {
            let value = if let Some(encoded) = &add.value {
                let bytes = STANDARD.decode(encoded).map_err(|e| {
                    ControllerError::operation(
                        REASON_ERROR_INJECTING_BIND_RESULT,
                        format!("invalid base64 value for key {:?}: {e}", add.key),
                    )
                })?;
                CredentialValue::Bytes(bytes)
            } else if let Some(s) = &add.string_value {
                CredentialValue::Json(Value::String(s.clone()))
            } else if let Some(expression) = &add.json_path_expression {
                evaluate_json_path(expression, credentials)
                    .map_err(|e| ControllerError::operation(REASON_ERROR_INJECTING_BIND_RESULT, e))?
            } else {
                return Err(ControllerError::operation(
                    REASON_ERROR_INJECTING_BIND_RESULT,
                    format!(
                        "addKey transform for key {:?} needs one of value, stringValue or jsonPathExpression",
                        add.key
                    ),
                ));
            };
            credentials.insert(add.key.clone(), value);
        }
        if let Some(rename) = &transform.rename_key {
            if let Some(value) = credentials.remove(&rename.from) {
                credentials.insert(rename.to.clone(), value);
            }
        }
        if let Some(secret_ref) = transform.add_keys_from.as_ref().and_then(|a| a.secret_ref.as_ref()) {
            let source_namespace = secret_ref.namespace.as_deref().unwrap_or(namespace);
            let secret = secrets.get(source_namespace, &secret_ref.name).await.map_err(|e| {
                ControllerError::operation(
                    REASON_ERROR_INJECTING_BIND_RESULT,
                    format!("failed to read secret {source_namespace}/{}: {e}", secret_ref.name),
                )
            })?;
            for (key, value) in secret.data.unwrap_or_default() {
                credentials.insert(key, CredentialValue::Bytes(value.0));
            }
        }
        if let Some(remove) = &transform.remove_key {
            credentials.remove(&remove.key);
        }
    }
    Ok(())
}

/// Secret data for `credentials`, under a single key when one is given
fn secret_data(credentials: &Credentials, secret_key: Option<&str>) -> Result<BTreeMap<String, ByteString>, ControllerError> {
    if let Some(secret_key) = secret_key {
        let document: serde_json::Map<String, Value> =
            credentials.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
        let bytes = serde_json::to_vec(&document)?;
        return Ok(BTreeMap::from([(secret_key.to_string(), ByteString(bytes))]));
    }
    credentials
        .iter()
        .map(|(key, value)| -> Result<(String, ByteString), ControllerError> {
            Ok((key.clone(), ByteString(value.to_secret_bytes()?)))
        })
        .collect()
}

/// The Secret's controller owner is this binding
fn is_controlled_by(secret: &Secret, binding: &ServiceBinding) -> bool {
    let Some(uid) = binding.metadata.uid.as_deref() else {
        return false;
    };
    secret
        .metadata
        .owner_references
        .iter()
        .flatten()
        .any(|owner| owner.controller == Some(true) && owner.uid == uid)
}

fn controller_name(secret: &Secret) -> String {
    secret
        .metadata
        .owner_references
        .iter()
        .flatten()
        .find(|owner| owner.controller == Some(true))
        .map_or_else(|| "none".to_string(), |owner| format!("{}/{}", owner.kind, owner.name))
}

impl Reconciler {
    /// Write the broker credentials into the binding's Secret
    pub(super) async fn inject_binding_credentials(
        &self,
        binding: &ServiceBinding,
        credentials: JsonMap,
    ) -> Result<(), ControllerError> {
        let namespace = binding.namespace().unwrap_or_default();
        let name = &binding.spec.secret_name;
        let mut credentials: Credentials = credentials
            .into_iter()
            .map(|(k, v)| (k, CredentialValue::Json(v)))
            .collect();
        apply_secret_transforms(
            self.stores.secrets.as_ref(),
            &namespace,
            &binding.spec.secret_transforms,
            &mut credentials,
        )
        .await?;
        let data = secret_data(&credentials, binding.spec.secret_key.as_deref())?;

        match fetch(self.stores.secrets.as_ref(), &namespace, name).await? {
            Some(mut existing) => {
                if !is_controlled_by(&existing, binding) {
                    return Err(ControllerError::terminal(
                        REASON_ERROR_INJECTING_BIND_RESULT,
                        format!(
                            "Secret {namespace}/{name} is not owned by ServiceBinding, controllerRef: {}",
                            controller_name(&existing)
                        ),
                    ));
                }
                existing.data = Some(data);
                existing.string_data = None;
                self.stores.secrets.update(&existing).await?;
                debug!(binding = %binding.name_any(), secret = %name, "updated credentials secret");
            }
            None => {
                let owner = binding.controller_owner_ref(&()).ok_or_else(|| {
                    ControllerError::operation(
                        REASON_ERROR_INJECTING_BIND_RESULT,
                        format!("ServiceBinding {namespace}/{} has no uid to own its Secret", binding.name_any()),
                    )
                })?;
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(name.clone()),
                        namespace: Some(namespace.clone()),
                        owner_references: Some(vec![owner]),
                        ..Default::default()
                    },
                    data: Some(data),
                    type_: Some("Opaque".to_string()),
                    ..Default::default()
                };
                self.stores.secrets.create(&secret).await?;
                info!(binding = %binding.name_any(), secret = %name, "created credentials secret");
            }
        }
        Ok(())
    }

    /// Delete the binding's Secret if the binding owns it
    pub(super) async fn eject_binding_credentials(&self, binding: &ServiceBinding) -> Result<(), ControllerError> {
        let namespace = binding.namespace().unwrap_or_default();
        let name = &binding.spec.secret_name;
        let Some(secret) = fetch(self.stores.secrets.as_ref(), &namespace, name).await? else {
            return Ok(());
        };
        if !is_controlled_by(&secret, binding) {
            warn!(
                binding = %binding.name_any(),
                secret = %name,
                controller = %controller_name(&secret),
                "secret not owned by binding; leaving it in place"
            );
            return Ok(());
        }
        match self.stores.secrets.delete(&namespace, name).await {
            Ok(()) => {
                info!(binding = %binding.name_any(), secret = %name, "deleted credentials secret");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use catalog_crds::{
        AddKeyTransform, AddKeysFromTransform, ObjectReference, RemoveKeyTransform, RenameKeyTransform,
    };
    use serde_json::json;

    fn credentials(value: Value) -> Credentials {
        let Value::Object(map) = value else {
            panic!("credentials must be an object");
        };
        map.into_iter().map(|(k, v)| (k, CredentialValue::Json(v))).collect()
    }

    fn add_key(key: &str, f: impl FnOnce(&mut AddKeyTransform)) -> SecretTransform {
        let mut add = AddKeyTransform {
            key: key.to_string(),
            ..Default::default()
        };
        f(&mut add);
        SecretTransform {
            add_key: Some(add),
            ..Default::default()
        }
    }

    #[test]
    fn test_json_path_walks_objects_and_arrays() {
        let creds = credentials(json!({
            "connection": {"host": "db.local", "ports": [5432, 5433]},
        }));
        assert_eq!(
            evaluate_json_path("{.connection.host}", &creds),
            Ok(CredentialValue::Json(json!("db.local")))
        );
        assert_eq!(
            evaluate_json_path("connection.ports.1", &creds),
            Ok(CredentialValue::Json(json!(5433)))
        );
        assert!(evaluate_json_path("{.connection.user}", &creds).is_err());
        assert!(evaluate_json_path("{}", &creds).is_err());
    }

    #[tokio::test]
    async fn test_transforms_apply_in_order() {
        let secrets = InMemoryStore::<Secret>::new();
        secrets.seed(Secret {
            metadata: ObjectMeta {
                name: Some("extra".to_string()),
                namespace: Some("shared".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("ca.crt".to_string(), ByteString(b"PEM".to_vec()))])),
            ..Default::default()
        });

        let transforms = vec![
            add_key("host", |a| a.json_path_expression = Some("{.connection.host}".to_string())),
            add_key("mode", |a| a.string_value = Some("tls".to_string())),
            add_key("raw", |a| a.value = Some(STANDARD.encode(b"bytes"))),
            SecretTransform {
                rename_key: Some(RenameKeyTransform {
                    from: "password".to_string(),
                    to: "pass".to_string(),
                }),
                ..Default::default()
            },
            SecretTransform {
                add_keys_from: Some(AddKeysFromTransform {
                    secret_ref: Some(ObjectReference {
                        namespace: Some("shared".to_string()),
                        name: "extra".to_string(),
                    }),
                }),
                ..Default::default()
            },
            SecretTransform {
                remove_key: Some(RemoveKeyTransform {
                    key: "connection".to_string(),
                }),
                ..Default::default()
            },
        ];

        let mut creds = credentials(json!({
            "connection": {"host": "db.local"},
            "password": "hunter2",
        }));
        apply_secret_transforms(&secrets, "default", &transforms, &mut creds).await.unwrap();

        let data = secret_data(&creds, None).unwrap();
        let keys: Vec<&str> = data.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["ca.crt", "host", "mode", "pass", "raw"]);
        assert_eq!(data["host"].0, b"db.local");
        assert_eq!(data["pass"].0, b"hunter2");
        assert_eq!(data["raw"].0, b"bytes");
        assert_eq!(data["ca.crt"].0, b"PEM");
    }

    #[tokio::test]
    async fn test_add_keys_from_missing_secret_fails() {
        let secrets = InMemoryStore::<Secret>::new();
        let transforms = vec![SecretTransform {
            add_keys_from: Some(AddKeysFromTransform {
                secret_ref: Some(ObjectReference {
                    namespace: None,
                    name: "absent".to_string(),
                }),
            }),
            ..Default::default()
        }];
        let mut creds = Credentials::new();
        let err = apply_secret_transforms(&secrets, "default", &transforms, &mut creds)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some(REASON_ERROR_INJECTING_BIND_RESULT));
    }

    #[tokio::test]
    async fn test_add_key_without_source_fails() {
        let secrets = InMemoryStore::<Secret>::new();
        let transforms = vec![add_key("empty", |_| {})];
        let mut creds = credentials(json!({"user": "admin"}));
        let err = apply_secret_transforms(&secrets, "default", &transforms, &mut creds)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some(REASON_ERROR_INJECTING_BIND_RESULT));
        assert!(!err.is_terminal());
        assert!(!creds.contains_key("empty"), "Nothing is written for an unusable transform");
    }

    #[test]
    fn test_secret_key_writes_one_json_document() {
        let mut creds = credentials(json!({"user": "admin", "port": 5432}));
        creds.insert("cert".to_string(), CredentialValue::Bytes(b"abc".to_vec()));

        let data = secret_data(&creds, Some("credentials.json")).unwrap();
        assert_eq!(data.len(), 1);
        let document: Value = serde_json::from_slice(&data["credentials.json"].0).unwrap();
        assert_eq!(document, json!({"user": "admin", "port": 5432, "cert": STANDARD.encode(b"abc")}));
    }

    #[test]
    fn test_non_string_values_are_serialized() {
        let creds = credentials(json!({"port": 5432, "tags": ["a"]}));
        let data = secret_data(&creds, None).unwrap();
        assert_eq!(data["port"].0, b"5432");
        assert_eq!(data["tags"].0, br#"["a"]"#);
    }
}
