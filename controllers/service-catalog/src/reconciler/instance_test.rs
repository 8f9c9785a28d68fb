//! Unit tests for the ServiceInstance reconciler

#[cfg(test)]
mod tests {
    use crate::config::ControllerConfig;
    use crate::reconcile_helpers::{get_condition, has_finalizer, is_condition_true};
    use crate::reconciler::instance::*;
    use crate::reconciler::{
        DEFAULT_POLL_DELAY, Kind, Outcome, REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT,
        REASON_ORPHAN_MITIGATION_SUCCESSFUL,
    };
    use crate::store::ResourceStore;
    use crate::test_utils::*;
    use catalog_crds::{
        ConditionStatus, ConditionType, DeprovisionStatus, FINALIZER_SERVICE_CATALOG, InstanceOperation,
        InstancePropertiesState, ProvisionStatus, ServiceInstance, ServiceInstanceStatus,
    };
    use osb_client::{
        DeprovisionResponse, LastOperationResponse, LastOperationState, MockFailure, ProvisionResponse,
        UpdateInstanceResponse,
    };
    use serde_json::json;
    use std::time::Duration;

    const RETRY_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    fn broker_key() -> String {
        key(TEST_BROKER)
    }

    fn ready_reason(instance: &ServiceInstance) -> String {
        let status = instance.status.as_ref().expect("instance should have status");
        get_condition(&status.conditions, ConditionType::Ready)
            .map(|c| c.reason.clone())
            .unwrap_or_default()
    }

    fn status_of(instance: &ServiceInstance) -> &ServiceInstanceStatus {
        instance.status.as_ref().expect("instance should have status")
    }

    fn last_operation(state: LastOperationState, description: Option<&str>) -> LastOperationResponse {
        LastOperationResponse {
            state,
            description: description.map(str::to_string),
            poll_delay: None,
        }
    }

    async fn delete_instance(env: &TestEnv, name: &str) {
        env.instances
            .delete(TEST_NAMESPACE, name)
            .await
            .expect("delete should succeed");
    }

    #[tokio::test]
    async fn test_sync_provision() {
        let env = TestEnv::new();
        env.seed_catalog();
        env.instances.seed(create_test_instance("db"));

        let outcome = env.settle(Kind::Instance, &key("db")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);

        let requests = env.broker_client.provision_requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.instance_id, "db-external-id");
        assert_eq!(request.service_id, TEST_SERVICE_ID);
        assert_eq!(request.plan_id, TEST_PLAN_ID);
        assert_eq!(request.organization_guid, "test-cluster");
        assert_eq!(request.space_guid, TEST_NAMESPACE_UID);
        assert!(request.accepts_incomplete);
        assert!(request.parameters.is_none());
        let context = request.context.as_ref().expect("context should be sent");
        assert_eq!(context["platform"], json!("kubernetes"));
        assert_eq!(context["namespace"], json!(TEST_NAMESPACE));

        let instance = env.instance("db");
        assert!(has_finalizer(&instance.metadata, FINALIZER_SERVICE_CATALOG));
        let status = status_of(&instance);
        assert!(is_condition_true(&status.conditions, ConditionType::Ready));
        assert_eq!(ready_reason(&instance), REASON_PROVISIONED_SUCCESSFULLY);
        assert_eq!(status.provision_status, ProvisionStatus::Provisioned);
        assert_eq!(status.deprovision_status, DeprovisionStatus::Required);
        assert_eq!(status.reconciled_generation, 1);
        assert!(status.current_operation.is_none());
        assert!(status.in_progress_properties.is_none());
        let external = status.external_properties.as_ref().expect("external properties should be set");
        assert_eq!(external.service_plan_external_id, TEST_PLAN_ID);
        assert_eq!(external.service_plan_external_name, TEST_PLAN_NAME);
        assert_eq!(status.service_class_ref.as_ref().map(|r| r.name.as_str()), Some(TEST_SERVICE_ID));
        assert_eq!(status.service_plan_ref.as_ref().map(|r| r.name.as_str()), Some(TEST_PLAN_ID));

        assert_eq!(env.metrics.osb_request_count(&broker_key(), "provision_instance", "2xx"), 1.0);
        assert!(env.recorder.has_reason(REASON_PROVISIONED_SUCCESSFULLY));

        let outcome = env.settle(Kind::Instance, &key("db")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(env.broker_client.count("provision_instance"), 1, "A processed instance is not provisioned again");
    }

    #[tokio::test]
    async fn test_async_provision_is_polled_to_completion() {
        let env = TestEnv::new();
        env.seed_catalog();
        env.instances.seed(create_test_instance("db"));
        env.broker_client.push_provision(Ok(ProvisionResponse {
            is_async: true,
            dashboard_url: Some("http://dashboard.test/db".to_string()),
            operation_key: Some("op-1".to_string()),
        }));
        env.broker_client
            .push_last_operation(Ok(last_operation(LastOperationState::InProgress, Some("creating vm"))));
        env.broker_client
            .push_last_operation(Ok(last_operation(LastOperationState::Succeeded, None)));

        let outcome = env.settle(Kind::Instance, &key("db")).await.unwrap();
        assert_eq!(outcome, Outcome::Poll(DEFAULT_POLL_DELAY));
        let instance = env.instance("db");
        let status = status_of(&instance);
        assert!(status.async_op_in_progress);
        assert_eq!(status.last_operation.as_deref(), Some("op-1"));
        assert_eq!(status.dashboard_url.as_deref(), Some("http://dashboard.test/db"));
        assert_eq!(status.current_operation, Some(InstanceOperation::Provision));
        assert_eq!(ready_reason(&instance), REASON_PROVISIONING);

        let outcome = env.reconciler.reconcile_key(Kind::Instance, &key("db")).await.unwrap();
        assert_eq!(outcome, Outcome::Poll(DEFAULT_POLL_DELAY));
        let instance = env.instance("db");
        let ready = get_condition(&status_of(&instance).conditions, ConditionType::Ready).expect("ready condition");
        assert!(ready.message.contains("creating vm"), "Poll description surfaces in the condition");

        let outcome = env.reconciler.reconcile_key(Kind::Instance, &key("db")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        let instance = env.instance("db");
        let status = status_of(&instance);
        assert!(!status.async_op_in_progress);
        assert!(status.last_operation.is_none());
        assert_eq!(status.provision_status, ProvisionStatus::Provisioned);
        assert_eq!(ready_reason(&instance), REASON_PROVISIONED_SUCCESSFULLY);
        assert_eq!(env.broker_client.count("poll_last_operation"), 2);
    }

    #[tokio::test]
    async fn test_provision_rejected_by_broker_is_terminal() {
        let env = TestEnv::new();
        env.seed_catalog();
        env.instances.seed(create_test_instance("db"));
        env.broker_client.push_provision(Err(MockFailure::Status(404)));

        let err = env.settle(Kind::Instance, &key("db")).await.unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(err.reason(), Some(REASON_PROVISION_CALL_FAILED));

        let instance = env.instance("db");
        let status = status_of(&instance);
        assert!(is_condition_true(&status.conditions, ConditionType::Failed));
        assert!(!status.orphan_mitigation_in_progress);
        assert_eq!(status.deprovision_status, DeprovisionStatus::NotRequired);
        assert!(status.current_operation.is_none());

        let outcome = env.settle(Kind::Instance, &key("db")).await.unwrap();
        assert_eq!(outcome, Outcome::Done, "A failed generation is not retried");
        assert_eq!(env.broker_client.count("provision_instance"), 1);
        assert_eq!(env.broker_client.count("deprovision_instance"), 0);
    }

    async fn assert_orphan_mitigated(env: &TestEnv, failure: MockFailure, expect_failed: bool) {
        env.instances.seed(create_test_instance("db"));
        env.broker_client.push_provision(Err(failure));

        let err = env.settle(Kind::Instance, &key("db")).await.unwrap_err();
        assert!(!err.is_terminal(), "Orphan mitigation needs another pass");
        let instance = env.instance("db");
        let status = status_of(&instance);
        assert!(status.orphan_mitigation_in_progress);
        assert_eq!(status.deprovision_status, DeprovisionStatus::Required);
        assert_eq!(is_condition_true(&status.conditions, ConditionType::Failed), expect_failed);
        assert_eq!(ready_reason(&instance), REASON_STARTING_ORPHAN_MITIGATION);

        let outcome = env.settle(Kind::Instance, &key("db")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(env.broker_client.count("deprovision_instance"), 1);
        let requests = env.broker_client.deprovision_requests();
        assert_eq!(requests[0].plan_id, TEST_PLAN_ID);
        assert_eq!(requests[0].instance_id, "db-external-id");

        let instance = env.instance("db");
        let status = status_of(&instance);
        assert!(!status.orphan_mitigation_in_progress);
        assert!(!is_condition_true(&status.conditions, ConditionType::OrphanMitigation));
        assert_eq!(ready_reason(&instance), REASON_ORPHAN_MITIGATION_SUCCESSFUL);
        assert_eq!(status.provision_status, ProvisionStatus::NotProvisioned);
        assert_eq!(status.deprovision_status, DeprovisionStatus::Succeeded);
        assert!(env.recorder.has_reason(REASON_STARTING_ORPHAN_MITIGATION));
    }

    #[tokio::test]
    async fn test_provision_server_error_starts_orphan_mitigation() {
        let env = TestEnv::new();
        env.seed_catalog();
        assert_orphan_mitigated(&env, MockFailure::Status(500), true).await;

        let outcome = env.settle(Kind::Instance, &key("db")).await.unwrap();
        assert_eq!(outcome, Outcome::Done, "The failed generation stays failed after mitigation");
        assert_eq!(env.broker_client.count("provision_instance"), 1);
    }

    #[tokio::test]
    async fn test_provision_request_timeout_status_starts_orphan_mitigation() {
        let env = TestEnv::new();
        env.seed_catalog();
        assert_orphan_mitigated(&env, MockFailure::Status(408), true).await;
    }

    #[tokio::test]
    async fn test_provision_client_timeout_mitigates_without_failing() {
        let env = TestEnv::new();
        env.seed_catalog();
        assert_orphan_mitigated(&env, MockFailure::Timeout, false).await;
    }

    #[tokio::test]
    async fn test_provision_connection_error_is_retried() {
        let env = TestEnv::new();
        env.seed_catalog();
        env.instances.seed(create_test_instance("db"));
        env.broker_client
            .push_provision(Err(MockFailure::Connection("connection refused".to_string())));

        let err = env.settle(Kind::Instance, &key("db")).await.unwrap_err();
        assert!(!err.is_terminal());
        assert_eq!(err.reason(), Some(REASON_ERROR_CALLING_PROVISION));
        let instance = env.instance("db");
        let status = status_of(&instance);
        assert!(!status.orphan_mitigation_in_progress);
        assert_eq!(status.current_operation, Some(InstanceOperation::Provision));
        assert!(!is_condition_true(&status.conditions, ConditionType::Failed));
    }

    #[tokio::test]
    async fn test_unknown_plan_is_reported_on_ready() {
        let env = TestEnv::new();
        env.seed_catalog();
        let mut instance = create_test_instance("db");
        instance.spec.plan_reference.service_plan_external_name = Some("huge".to_string());
        env.instances.seed(instance);

        let err = env.settle(Kind::Instance, &key("db")).await.unwrap_err();
        assert_eq!(err.reason(), Some(crate::reconciler::REASON_NONEXISTENT_SERVICE_PLAN));
        let instance = env.instance("db");
        assert_eq!(ready_reason(&instance), crate::reconciler::REASON_NONEXISTENT_SERVICE_PLAN);
        assert_eq!(env.broker_client.count("provision_instance"), 0);
    }

    #[tokio::test]
    async fn test_delete_deprovisions_and_releases() {
        let env = TestEnv::new();
        env.seed_catalog();
        env.provisioned_instance("db").await;
        delete_instance(&env, "db").await;
        assert!(env.instances.peek(TEST_NAMESPACE, "db").is_some(), "The finalizer holds the instance");

        let outcome = env.settle(Kind::Instance, &key("db")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert!(env.instances.peek(TEST_NAMESPACE, "db").is_none());

        let requests = env.broker_client.deprovision_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].service_id, TEST_SERVICE_ID);
        assert_eq!(requests[0].plan_id, TEST_PLAN_ID);
        assert!(requests[0].accepts_incomplete);
        assert!(env.recorder.has_reason(REASON_DEPROVISIONED_SUCCESSFULLY));
    }

    #[tokio::test]
    async fn test_delete_of_never_provisioned_instance_skips_broker() {
        let env = TestEnv::new();
        env.seed_catalog();
        env.instances.seed(create_test_instance("db"));
        env.broker_client.push_provision(Err(MockFailure::Status(400)));
        assert!(env.settle(Kind::Instance, &key("db")).await.is_err());

        delete_instance(&env, "db").await;
        let outcome = env.settle(Kind::Instance, &key("db")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert!(env.instances.peek(TEST_NAMESPACE, "db").is_none());
        assert_eq!(env.broker_client.count("deprovision_instance"), 0);
    }

    #[tokio::test]
    async fn test_bindings_block_deletion() {
        let env = TestEnv::new();
        env.seed_catalog();
        env.provisioned_instance("db").await;
        env.bindings.seed(create_test_binding("creds", "db"));
        delete_instance(&env, "db").await;

        let err = env.settle(Kind::Instance, &key("db")).await.unwrap_err();
        assert_eq!(err.reason(), Some(REASON_DEPROVISION_BLOCKED_BY_CREDENTIALS));
        let instance = env.instance("db");
        let ready = get_condition(&status_of(&instance).conditions, ConditionType::Ready).expect("ready condition");
        assert_eq!(ready.status, ConditionStatus::Unknown);
        assert_eq!(env.broker_client.count("deprovision_instance"), 0);
        assert!(env.bindings.peek(TEST_NAMESPACE, "creds").is_some(), "Bindings are left alone");
    }

    #[tokio::test]
    async fn test_cascading_deletion_removes_bindings_first() {
        let env = TestEnv::with_config(ControllerConfig {
            cascading_deletion: true,
            ..Default::default()
        });
        env.seed_catalog();
        env.provisioned_instance("db").await;
        env.bindings.seed(create_test_binding("creds", "db"));
        delete_instance(&env, "db").await;

        let outcome = env.settle(Kind::Instance, &key("db")).await.unwrap();
        assert_eq!(outcome, Outcome::RequeueAfter(DEFAULT_POLL_DELAY));
        assert!(env.bindings.peek(TEST_NAMESPACE, "creds").is_none());
        assert_eq!(ready_reason(&env.instance("db")), REASON_SERVICE_BINDINGS_DELETION);
        assert_eq!(env.broker_client.count("deprovision_instance"), 0);

        let outcome = env.settle(Kind::Instance, &key("db")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert!(env.instances.peek(TEST_NAMESPACE, "db").is_none());
        assert_eq!(env.broker_client.count("deprovision_instance"), 1);
    }

    #[tokio::test]
    async fn test_async_deprovision_gone_counts_as_success() {
        let env = TestEnv::new();
        env.seed_catalog();
        env.provisioned_instance("db").await;
        env.broker_client.push_deprovision(Ok(DeprovisionResponse {
            is_async: true,
            operation_key: Some("op-del".to_string()),
        }));
        env.broker_client.push_last_operation(Err(MockFailure::Status(410)));
        delete_instance(&env, "db").await;

        let outcome = env.settle(Kind::Instance, &key("db")).await.unwrap();
        assert_eq!(outcome, Outcome::Poll(DEFAULT_POLL_DELAY));
        let instance = env.instance("db");
        assert_eq!(ready_reason(&instance), REASON_DEPROVISIONING);
        assert_eq!(status_of(&instance).last_operation.as_deref(), Some("op-del"));

        let outcome = env.reconciler.reconcile_key(Kind::Instance, &key("db")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert!(env.instances.peek(TEST_NAMESPACE, "db").is_none());
    }

    #[tokio::test]
    async fn test_deprovision_rejected_by_broker_keeps_finalizer() {
        let env = TestEnv::new();
        env.seed_catalog();
        env.provisioned_instance("db").await;
        env.broker_client.push_deprovision(Err(MockFailure::Status(400)));
        delete_instance(&env, "db").await;

        let err = env.settle(Kind::Instance, &key("db")).await.unwrap_err();
        assert!(err.is_terminal());
        let instance = env.instance("db");
        assert!(has_finalizer(&instance.metadata, FINALIZER_SERVICE_CATALOG));
        assert_eq!(status_of(&instance).deprovision_status, DeprovisionStatus::Failed);

        let outcome = env.settle(Kind::Instance, &key("db")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(env.broker_client.count("deprovision_instance"), 1, "A failed deprovision waits for an operator");
    }

    #[tokio::test]
    async fn test_parameter_change_updates_instance() {
        let env = TestEnv::new();
        env.seed_catalog();
        let mut instance = env.provisioned_instance("db").await;
        instance.spec.parameters = Some(json!({"size": "large"}));
        let instance = env.instances.update(&instance).await.unwrap();
        assert_eq!(instance.metadata.generation, Some(2));

        let outcome = env.settle(Kind::Instance, &key("db")).await.unwrap();
        assert_eq!(outcome, Outcome::Done);

        let requests = env.broker_client.update_requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.instance_id, "db-external-id");
        assert_eq!(request.plan_id, None, "The plan did not change");
        let parameters = request.parameters.as_ref().expect("changed parameters are sent");
        assert_eq!(parameters.get("size"), Some(&json!("large")));
        let previous = request.previous_values.as_ref().expect("previous values are sent");
        assert_eq!(previous.plan_id.as_deref(), Some(TEST_PLAN_ID));

        let instance = env.instance("db");
        let status = status_of(&instance);
        assert_eq!(ready_reason(&instance), REASON_INSTANCE_UPDATED_SUCCESSFULLY);
        assert_eq!(status.reconciled_generation, 2);
        assert_eq!(status.observed_generation, 2);
        let external = status.external_properties.as_ref().expect("external properties");
        assert_eq!(external.parameters, Some(json!({"size": "large"})));
        assert!(external.parameter_checksum.is_some());
    }

    #[tokio::test]
    async fn test_async_update_failure_fails_generation() {
        let env = TestEnv::new();
        env.seed_catalog();
        let mut instance = env.provisioned_instance("db").await;
        env.broker_client.push_update(Ok(UpdateInstanceResponse {
            is_async: true,
            ..Default::default()
        }));
        env.broker_client
            .push_last_operation(Ok(last_operation(LastOperationState::Failed, Some("quota exceeded"))));
        instance.spec.parameters = Some(json!({"size": "huge"}));
        env.instances.update(&instance).await.unwrap();

        let outcome = env.settle(Kind::Instance, &key("db")).await.unwrap();
        assert_eq!(outcome, Outcome::Poll(DEFAULT_POLL_DELAY));
        assert_eq!(ready_reason(&env.instance("db")), REASON_UPDATING_INSTANCE);

        let err = env.reconciler.reconcile_key(Kind::Instance, &key("db")).await.unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(err.reason(), Some(REASON_UPDATE_INSTANCE_CALL_FAILED));
        let instance = env.instance("db");
        let status = status_of(&instance);
        assert!(is_condition_true(&status.conditions, ConditionType::Failed));
        assert_eq!(status.provision_status, ProvisionStatus::Provisioned, "The instance itself still exists");
        assert!(!status.async_op_in_progress);
    }

    #[tokio::test]
    async fn test_poll_past_retry_window_gives_up() {
        let env = TestEnv::new();
        env.seed_catalog();
        env.instances.seed(create_test_instance("db"));
        env.broker_client.push_provision(Ok(ProvisionResponse {
            is_async: true,
            ..Default::default()
        }));
        env.broker_client
            .push_last_operation(Ok(last_operation(LastOperationState::InProgress, None)));

        let outcome = env.settle(Kind::Instance, &key("db")).await.unwrap();
        assert_eq!(outcome, Outcome::Poll(DEFAULT_POLL_DELAY));

        env.clock.advance(RETRY_WINDOW + Duration::from_secs(1));
        let err = env.reconciler.reconcile_key(Kind::Instance, &key("db")).await.unwrap_err();
        assert_eq!(err.reason(), Some(REASON_ERROR_RECONCILIATION_RETRY_TIMEOUT));
        let instance = env.instance("db");
        let status = status_of(&instance);
        assert!(is_condition_true(&status.conditions, ConditionType::Failed));
        assert!(status.orphan_mitigation_in_progress, "An abandoned provision may have left something behind");
    }

    #[test]
    fn test_instance_action() {
        let mut instance = create_test_instance("db");
        assert_eq!(instance_action(&instance), InstanceAction::Provision);

        instance.status = Some(ServiceInstanceStatus {
            provision_status: ProvisionStatus::Provisioned,
            ..Default::default()
        });
        assert_eq!(instance_action(&instance), InstanceAction::Update);

        instance.metadata.deletion_timestamp = Some(deletion_time());
        assert_eq!(instance_action(&instance), InstanceAction::Deprovision);

        if let Some(status) = instance.status.as_mut() {
            status.async_op_in_progress = true;
        }
        assert_eq!(instance_action(&instance), InstanceAction::Poll, "Polling wins over everything");
    }

    #[test]
    fn test_is_instance_processed() {
        let mut instance = create_test_instance("db");
        instance.metadata.generation = Some(2);
        let mut status = ServiceInstanceStatus {
            observed_generation: 2,
            ..Default::default()
        };
        crate::reconcile_helpers::set_condition(
            &mut status.conditions,
            ConditionType::Ready,
            ConditionStatus::True,
            REASON_PROVISIONED_SUCCESSFULLY,
            MESSAGE_PROVISIONED_SUCCESSFULLY,
            test_start_time(),
        );
        instance.status = Some(status);
        assert!(is_instance_processed(&instance));

        instance.metadata.generation = Some(3);
        assert!(!is_instance_processed(&instance), "A newer generation needs work");

        instance.metadata.generation = Some(2);
        if let Some(status) = instance.status.as_mut() {
            status.orphan_mitigation_in_progress = true;
        }
        assert!(!is_instance_processed(&instance), "Pending orphan mitigation needs work");
    }

    #[test]
    fn test_instance_properties_equal() {
        let base = InstancePropertiesState {
            service_plan_external_name: TEST_PLAN_NAME.to_string(),
            service_plan_external_id: TEST_PLAN_ID.to_string(),
            parameter_checksum: Some("abc".to_string()),
            ..Default::default()
        };
        assert!(instance_properties_equal(None, None));
        assert!(instance_properties_equal(Some(&base), Some(&base.clone())));
        assert!(!instance_properties_equal(Some(&base), None));

        let redacted_differently = InstancePropertiesState {
            parameters: Some(json!({"password": "<redacted>"})),
            ..base.clone()
        };
        assert!(
            instance_properties_equal(Some(&base), Some(&redacted_differently)),
            "Only the checksum decides parameter equality"
        );

        let other_plan = InstancePropertiesState {
            service_plan_external_id: "large-id".to_string(),
            ..base.clone()
        };
        assert!(!instance_properties_equal(Some(&base), Some(&other_plan)));
    }
}
