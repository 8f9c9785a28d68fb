//! Unit tests for the ServiceBinding reconciler

#[cfg(test)]
mod tests {
    use crate::reconcile_helpers::{get_condition, has_finalizer, is_condition_true};
    use crate::reconciler::binding::*;
    use crate::reconciler::{
        DEFAULT_POLL_DELAY, Kind, Outcome, REASON_ASYNC_OPERATION_IN_PROGRESS, REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT,
        REASON_NONEXISTENT_INSTANCE, REASON_ORPHAN_MITIGATION_SUCCESSFUL,
    };
    use crate::store::ResourceStore;
    use crate::test_utils::*;
    use catalog_crds::{
        BindingOperation, ConditionStatus, ConditionType, FINALIZER_SERVICE_CATALOG, ServiceBinding, UnbindStatus,
    };
    use k8s_openapi::ByteString;
    use k8s_openapi::api::core::v1::Secret;
    use osb_client::{
        BindResponse, GetBindingResponse, JsonMap, LastOperationResponse, LastOperationState, MockFailure,
        ProvisionResponse,
    };
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    const RETRY_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    fn credentials() -> JsonMap {
        let mut map = JsonMap::new();
        map.insert("username".to_string(), json!("admin"));
        map.insert("port".to_string(), json!(3306));
        map
    }

    fn ready_reason(binding: &ServiceBinding) -> String {
        let status = binding.status.as_ref().expect("binding should have status");
        get_condition(&status.conditions, ConditionType::Ready)
            .map(|c| c.reason.clone())
            .unwrap_or_default()
    }

    fn secret(env: &TestEnv, name: &str) -> Option<Secret> {
        env.secrets.peek(TEST_NAMESPACE, name)
    }

    fn secret_value(secret: &Secret, key: &str) -> Vec<u8> {
        secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .map(|b| b.0.clone())
            .unwrap_or_default()
    }

    /// Provisioned instance `db` whose bindings the broker answers
    /// synchronously with [`credentials`]
    async fn env_with_instance() -> TestEnv {
        let env = TestEnv::new();
        env.seed_catalog();
        env.provisioned_instance("db").await;
        env
    }

    async fn bound_binding(env: &TestEnv, name: &str) -> ServiceBinding {
        env.broker_client.push_bind(Ok(BindResponse {
            credentials: Some(credentials()),
            ..Default::default()
        }));
        env.bindings.seed(create_test_binding(name, "db"));
        let outcome = env.settle(Kind::Binding, &key(name)).await.expect("bind should succeed");
        assert_eq!(outcome, Outcome::Done);
        env.binding(name)
    }

    #[tokio::test]
    async fn test_sync_bind_injects_credentials() {
        let env = env_with_instance().await;
        let binding = bound_binding(&env, "creds").await;

        let requests = env.broker_client.bind_requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.binding_id, "creds-external-id");
        assert_eq!(request.instance_id, "db-external-id");
        assert_eq!(request.service_id, TEST_SERVICE_ID);
        assert_eq!(request.plan_id, TEST_PLAN_ID);
        assert_eq!(request.app_guid.as_deref(), Some(TEST_NAMESPACE_UID));
        assert!(!request.accepts_incomplete, "The class does not support fetching bindings");

        assert!(has_finalizer(&binding.metadata, FINALIZER_SERVICE_CATALOG));
        let status = binding.status.as_ref().expect("status");
        assert!(is_condition_true(&status.conditions, ConditionType::Ready));
        assert_eq!(ready_reason(&binding), REASON_INJECTED_BIND_RESULT);
        assert_eq!(status.reconciled_generation, 1);
        assert_eq!(status.unbind_status, UnbindStatus::Required);
        assert!(status.current_operation.is_none());

        let secret = secret(&env, "creds").expect("secret should be created");
        assert_eq!(secret_value(&secret, "username"), b"admin");
        assert_eq!(secret_value(&secret, "port"), b"3306");
        let owner = secret
            .metadata
            .owner_references
            .as_ref()
            .and_then(|refs| refs.first())
            .expect("secret should be owned");
        assert_eq!(owner.kind, "ServiceBinding");
        assert_eq!(Some(owner.uid.as_str()), binding.metadata.uid.as_deref());
        assert_eq!(owner.controller, Some(true));

        let outcome = env.settle(Kind::Binding, &key("creds")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(env.broker_client.count("bind"), 1, "A processed binding is not bound again");
    }

    #[tokio::test]
    async fn test_async_bind_fetches_credentials_after_poll() {
        let env = TestEnv::new();
        let mut catalog = create_test_catalog();
        catalog.services[0].bindings_retrievable = true;
        env.seed_catalog_from(&catalog);
        env.provisioned_instance("db").await;

        env.broker_client.push_bind(Ok(BindResponse {
            is_async: true,
            operation_key: Some("bind-op".to_string()),
            ..Default::default()
        }));
        env.broker_client.push_binding_last_operation(Ok(LastOperationResponse {
            state: LastOperationState::Succeeded,
            description: None,
            poll_delay: None,
        }));
        env.broker_client.push_get_binding(Ok(GetBindingResponse {
            credentials: Some(credentials()),
            ..Default::default()
        }));
        env.bindings.seed(create_test_binding("creds", "db"));

        let outcome = env.settle(Kind::Binding, &key("creds")).await.unwrap();
        assert_eq!(outcome, Outcome::Poll(DEFAULT_POLL_DELAY));
        let binding = env.binding("creds");
        let status = binding.status.as_ref().expect("status");
        assert!(status.async_op_in_progress);
        assert_eq!(status.last_operation.as_deref(), Some("bind-op"));
        assert_eq!(ready_reason(&binding), REASON_BINDING);
        assert!(env.broker_client.bind_requests()[0].accepts_incomplete);
        assert!(secret(&env, "creds").is_none());

        let outcome = env.reconciler.reconcile_key(Kind::Binding, &key("creds")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(env.broker_client.count("get_binding"), 1);
        assert_eq!(ready_reason(&env.binding("creds")), REASON_INJECTED_BIND_RESULT);
        let secret = secret(&env, "creds").expect("secret should be created");
        assert_eq!(secret_value(&secret, "username"), b"admin");
    }

    #[tokio::test]
    async fn test_secret_key_and_transforms_shape_the_secret() {
        let env = env_with_instance().await;
        env.broker_client.push_bind(Ok(BindResponse {
            credentials: Some(credentials()),
            ..Default::default()
        }));
        let mut binding = create_test_binding("creds", "db");
        binding.spec.secret_transforms = vec![catalog_crds::SecretTransform {
            rename_key: Some(catalog_crds::RenameKeyTransform {
                from: "username".to_string(),
                to: "user".to_string(),
            }),
            ..Default::default()
        }];
        binding.spec.secret_key = Some("credentials.json".to_string());
        env.bindings.seed(binding);

        let outcome = env.settle(Kind::Binding, &key("creds")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        let secret = secret(&env, "creds").expect("secret should be created");
        let document: serde_json::Value = serde_json::from_slice(&secret_value(&secret, "credentials.json")).unwrap();
        assert_eq!(document, json!({"user": "admin", "port": 3306}));
    }

    #[tokio::test]
    async fn test_bind_server_error_unbinds_orphan() {
        let env = env_with_instance().await;
        env.broker_client.push_bind(Err(MockFailure::Status(500)));
        env.bindings.seed(create_test_binding("creds", "db"));

        let err = env.settle(Kind::Binding, &key("creds")).await.unwrap_err();
        assert!(!err.is_terminal(), "Orphan mitigation needs another pass");
        assert_eq!(err.reason(), Some(REASON_BIND_RETURNED_FAILURE));
        let binding = env.binding("creds");
        let status = binding.status.as_ref().expect("status");
        assert!(status.orphan_mitigation_in_progress);
        assert!(is_condition_true(&status.conditions, ConditionType::Failed));
        assert_eq!(ready_reason(&binding), REASON_NEEDS_ORPHAN_MITIGATION);
        assert!(status.in_progress_properties.is_none());

        let outcome = env.settle(Kind::Binding, &key("creds")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(env.broker_client.count("unbind"), 1);
        let binding = env.binding("creds");
        let status = binding.status.as_ref().expect("status");
        assert!(!status.orphan_mitigation_in_progress);
        assert_eq!(status.unbind_status, UnbindStatus::Succeeded);
        assert_eq!(ready_reason(&binding), REASON_ORPHAN_MITIGATION_SUCCESSFUL);

        let outcome = env.settle(Kind::Binding, &key("creds")).await.unwrap();
        assert_eq!(outcome, Outcome::Done, "The failed generation is not bound again");
        assert_eq!(env.broker_client.count("bind"), 1);
    }

    #[tokio::test]
    async fn test_bind_rejected_by_broker_is_terminal() {
        let env = env_with_instance().await;
        env.broker_client.push_bind(Err(MockFailure::Status(400)));
        env.bindings.seed(create_test_binding("creds", "db"));

        let err = env.settle(Kind::Binding, &key("creds")).await.unwrap_err();
        assert!(err.is_terminal());
        let binding = env.binding("creds");
        let status = binding.status.as_ref().expect("status");
        assert!(!status.orphan_mitigation_in_progress);
        assert!(is_condition_true(&status.conditions, ConditionType::Failed));
        assert_eq!(status.unbind_status, UnbindStatus::NotRequired, "The broker holds nothing to unbind");
        assert_eq!(env.broker_client.count("unbind"), 0);

        env.bindings.delete(TEST_NAMESPACE, "creds").await.unwrap();
        let outcome = env.settle(Kind::Binding, &key("creds")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(env.broker_client.count("unbind"), 0, "A rejected bind is never unbound");
        assert!(env.bindings.peek(TEST_NAMESPACE, "creds").is_none());
    }

    #[tokio::test]
    async fn test_bind_retries_escalate_after_retry_window() {
        let env = env_with_instance().await;
        env.broker_client
            .push_bind(Err(MockFailure::Connection("connection refused".to_string())));
        env.bindings.seed(create_test_binding("creds", "db"));

        let err = env.settle(Kind::Binding, &key("creds")).await.unwrap_err();
        assert!(!err.is_terminal(), "Transient failures retry inside the window");
        assert_eq!(err.reason(), Some(REASON_BIND_CALL_FAILED));

        env.clock.advance(RETRY_WINDOW + Duration::from_secs(1));
        let err = env.reconciler.reconcile_key(Kind::Binding, &key("creds")).await.unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(err.reason(), Some(REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT));

        let binding = env.binding("creds");
        let status = binding.status.as_ref().expect("status");
        let failed = get_condition(&status.conditions, ConditionType::Failed).expect("failed condition");
        assert_eq!(failed.status, ConditionStatus::True);
        assert_eq!(failed.reason, REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT);
        assert!(!status.orphan_mitigation_in_progress);
        assert!(status.current_operation.is_none());
        assert_eq!(status.unbind_status, UnbindStatus::NotRequired);
        assert_eq!(env.broker_client.count("bind"), 2);
        assert_eq!(env.broker_client.count("unbind"), 0);
    }

    #[tokio::test]
    async fn test_bind_waits_for_ready_instance() {
        let env = TestEnv::new();
        env.seed_catalog();
        env.instances.seed(create_test_instance("db"));
        env.broker_client
            .push_provision(Err(MockFailure::Connection("connection refused".to_string())));
        assert!(env.settle(Kind::Instance, &key("db")).await.is_err());
        env.bindings.seed(create_test_binding("creds", "db"));

        let err = env.settle(Kind::Binding, &key("creds")).await.unwrap_err();
        assert!(!err.is_terminal());
        assert_eq!(err.reason(), Some(REASON_ERROR_INSTANCE_NOT_READY));
        let binding = env.binding("creds");
        let ready = get_condition(&binding.status.as_ref().expect("status").conditions, ConditionType::Ready)
            .expect("ready condition");
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(env.broker_client.count("bind"), 0);
    }

    #[tokio::test]
    async fn test_bind_waits_for_instance_operation() {
        let env = TestEnv::new();
        env.seed_catalog();
        env.instances.seed(create_test_instance("db"));
        env.broker_client.push_provision(Ok(ProvisionResponse {
            is_async: true,
            ..Default::default()
        }));
        env.settle(Kind::Instance, &key("db")).await.unwrap();
        env.bindings.seed(create_test_binding("creds", "db"));

        let err = env.settle(Kind::Binding, &key("creds")).await.unwrap_err();
        assert_eq!(err.reason(), Some(REASON_ASYNC_OPERATION_IN_PROGRESS));
        assert_eq!(env.broker_client.count("bind"), 0);
    }

    #[tokio::test]
    async fn test_missing_instance_is_reported() {
        let env = TestEnv::new();
        env.seed_catalog();
        env.bindings.seed(create_test_binding("creds", "absent"));

        let err = env.settle(Kind::Binding, &key("creds")).await.unwrap_err();
        assert_eq!(err.reason(), Some(REASON_NONEXISTENT_INSTANCE));
        assert_eq!(ready_reason(&env.binding("creds")), REASON_NONEXISTENT_INSTANCE);
    }

    #[tokio::test]
    async fn test_nonbindable_plan_fails_binding() {
        let env = TestEnv::new();
        let mut catalog = create_test_catalog();
        catalog.services[0].plans[0].bindable = Some(false);
        env.seed_catalog_from(&catalog);
        env.provisioned_instance("db").await;
        env.bindings.seed(create_test_binding("creds", "db"));

        let err = env.settle(Kind::Binding, &key("creds")).await.unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(err.reason(), Some(REASON_ERROR_NONBINDABLE_SERVICE_CLASS));
        let binding = env.binding("creds");
        assert!(is_condition_true(
            &binding.status.as_ref().expect("status").conditions,
            ConditionType::Failed
        ));

        let outcome = env.settle(Kind::Binding, &key("creds")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(env.broker_client.count("bind"), 0);
    }

    #[tokio::test]
    async fn test_delete_unbinds_and_removes_secret() {
        let env = env_with_instance().await;
        bound_binding(&env, "creds").await;
        assert!(secret(&env, "creds").is_some());

        env.bindings.delete(TEST_NAMESPACE, "creds").await.unwrap();
        assert!(env.bindings.peek(TEST_NAMESPACE, "creds").is_some(), "The finalizer holds the binding");

        let outcome = env.settle(Kind::Binding, &key("creds")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(env.broker_client.count("unbind"), 1);
        assert!(secret(&env, "creds").is_none());
        assert!(env.bindings.peek(TEST_NAMESPACE, "creds").is_none());
        assert!(env.recorder.has_reason(REASON_UNBOUND_SUCCESSFULLY));
    }

    #[tokio::test]
    async fn test_foreign_secret_is_never_touched() {
        let env = env_with_instance().await;
        let original = BTreeMap::from([("token".to_string(), ByteString(b"keep-me".to_vec()))]);
        env.secrets.seed(Secret {
            metadata: test_meta("creds"),
            data: Some(original.clone()),
            ..Default::default()
        });

        env.broker_client.push_bind(Ok(BindResponse {
            credentials: Some(credentials()),
            ..Default::default()
        }));
        env.bindings.seed(create_test_binding("creds", "db"));

        let err = env.settle(Kind::Binding, &key("creds")).await.unwrap_err();
        assert_eq!(err.reason(), Some(REASON_ERROR_INJECTING_BIND_RESULT));
        assert!(err.message().contains("is not owned by ServiceBinding"));
        assert!(binding_has_orphan(&env.binding("creds")), "Credentials were issued and must be revoked");

        let outcome = env.settle(Kind::Binding, &key("creds")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(env.broker_client.count("unbind"), 1);
        let secret = secret(&env, "creds").expect("foreign secret must survive");
        assert_eq!(secret.data, Some(original));
    }

    #[tokio::test]
    async fn test_overlapping_parameters_block_bind() {
        let env = env_with_instance().await;
        env.secrets.seed(Secret {
            metadata: test_meta("params"),
            data: Some(BTreeMap::from([("json".to_string(), ByteString(br#"{"a":2}"#.to_vec()))])),
            ..Default::default()
        });
        let mut binding = create_test_binding("creds", "db");
        binding.spec.parameters = Some(json!({"a": 1}));
        binding.spec.parameters_from = vec![catalog_crds::ParametersFromSource {
            secret_key_ref: Some(catalog_crds::SecretKeyReference {
                name: "params".to_string(),
                key: "json".to_string(),
            }),
            ..Default::default()
        }];
        env.bindings.seed(binding);

        let err = env.settle(Kind::Binding, &key("creds")).await.unwrap_err();
        assert!(!err.is_terminal());
        assert_eq!(err.reason(), Some(crate::reconciler::REASON_ERROR_WITH_PARAMETERS));
        assert_eq!(ready_reason(&env.binding("creds")), crate::reconciler::REASON_ERROR_WITH_PARAMETERS);
        assert_eq!(env.broker_client.count("bind"), 0);
    }

    #[tokio::test]
    async fn test_delete_during_async_bind_injects_then_unbinds() {
        let env = TestEnv::new();
        let mut catalog = create_test_catalog();
        catalog.services[0].bindings_retrievable = true;
        env.seed_catalog_from(&catalog);
        env.provisioned_instance("db").await;

        env.broker_client.push_bind(Ok(BindResponse {
            is_async: true,
            ..Default::default()
        }));
        env.broker_client.push_binding_last_operation(Ok(LastOperationResponse {
            state: LastOperationState::InProgress,
            description: None,
            poll_delay: None,
        }));
        env.broker_client.push_binding_last_operation(Ok(LastOperationResponse {
            state: LastOperationState::Succeeded,
            description: None,
            poll_delay: None,
        }));
        env.broker_client.push_get_binding(Ok(GetBindingResponse {
            credentials: Some(credentials()),
            ..Default::default()
        }));
        env.bindings.seed(create_test_binding("creds", "db"));

        assert_eq!(env.settle(Kind::Binding, &key("creds")).await.unwrap(), Outcome::Poll(DEFAULT_POLL_DELAY));
        assert_eq!(env.settle(Kind::Binding, &key("creds")).await.unwrap(), Outcome::Poll(DEFAULT_POLL_DELAY));

        env.bindings.delete(TEST_NAMESPACE, "creds").await.unwrap();
        let outcome = env.settle(Kind::Binding, &key("creds")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);

        assert_eq!(env.broker_client.count("get_binding"), 1);
        assert!(env.recorder.has_reason(REASON_INJECTED_BIND_RESULT), "Credentials are injected first");
        assert_eq!(env.broker_client.count("unbind"), 1);
        assert!(env.recorder.has_reason(REASON_UNBOUND_SUCCESSFULLY));
        assert!(secret(&env, "creds").is_none());
        assert!(env.bindings.peek(TEST_NAMESPACE, "creds").is_none());
    }

    fn binding_has_orphan(binding: &ServiceBinding) -> bool {
        binding.status.as_ref().is_some_and(|s| s.orphan_mitigation_in_progress)
    }

    #[tokio::test]
    async fn test_unbind_without_instance_gives_up_after_retry_window() {
        let env = env_with_instance().await;
        bound_binding(&env, "creds").await;

        // Drop the instance outright, finalizer and all
        let mut instance = env.instance("db");
        instance.metadata.finalizers = None;
        let instance = env.instances.update(&instance).await.unwrap();
        env.instances.delete(TEST_NAMESPACE, &instance.metadata.name.unwrap_or_default()).await.unwrap();
        assert!(env.instances.peek(TEST_NAMESPACE, "db").is_none());

        env.bindings.delete(TEST_NAMESPACE, "creds").await.unwrap();
        let err = env.settle(Kind::Binding, &key("creds")).await.unwrap_err();
        assert!(!err.is_terminal());
        assert_eq!(err.reason(), Some(REASON_NONEXISTENT_INSTANCE));
        let binding = env.binding("creds");
        assert_eq!(
            binding.status.as_ref().and_then(|s| s.current_operation),
            Some(BindingOperation::Unbind)
        );

        env.clock.advance(RETRY_WINDOW + Duration::from_secs(1));
        let err = env.reconciler.reconcile_key(Kind::Binding, &key("creds")).await.unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(err.reason(), Some(REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT));
        let binding = env.binding("creds");
        assert!(has_finalizer(&binding.metadata, FINALIZER_SERVICE_CATALOG));
        assert_eq!(binding.status.as_ref().map(|s| s.unbind_status), Some(UnbindStatus::Failed));
        assert_eq!(env.broker_client.count("unbind"), 0);
    }

    #[test]
    fn test_binding_properties_equal() {
        let a = catalog_crds::BindingPropertiesState {
            parameter_checksum: Some("abc".to_string()),
            ..Default::default()
        };
        assert!(binding_properties_equal(Some(&a), Some(&a.clone())));
        assert!(!binding_properties_equal(Some(&a), None));
        let b = catalog_crds::BindingPropertiesState {
            parameter_checksum: Some("def".to_string()),
            ..Default::default()
        };
        assert!(!binding_properties_equal(Some(&a), Some(&b)));
    }
}
