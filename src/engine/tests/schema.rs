use super::*;

fn schema_engine() -> PolicyEngine {
    schema_engine_from_policy(TEST_SCHEMA_POLICY, TEST_SCHEMA)
        .with_entities(documents())
        .unwrap()
}

#[test]
fn test_schema_rejects_invalid_policy_at_load() {
    let invalid_policy = r#"
        permit (
            principal == User::"alice",
            action == Action::"write",
            resource is Document
        );
    "#;

    let result = PolicyEngine::new_from_str_with_cedarschema(invalid_policy, TEST_SCHEMA);
    assert!(matches!(result, Err(PolicyError::PolicyValidation(_))));
}

#[test]
fn test_schema_rejects_undeclared_attribute_in_policy() {
    let invalid_policy = r#"
        permit (principal, action == Action::"read", resource is Document)
        when { resource.owner == principal };
    "#;

    let result = PolicyEngine::new_from_str_with_cedarschema(invalid_policy, TEST_SCHEMA);
    assert!(matches!(
        result,
        Err(PolicyError::PolicyValidation(msg)) if msg.contains("`owner`")
    ));
}

#[test]
fn test_schema_object_constructor_works() {
    let schema: Schema = TEST_SCHEMA.parse().unwrap();
    let engine = PolicyEngine::new_from_str_with_schema(TEST_SCHEMA_POLICY, schema)
        .expect("schema + policy should load")
        .with_entities(documents())
        .unwrap();

    let response = engine
        .evaluate(&user_request("alice", "read", r#"Document::"doc1""#))
        .unwrap();
    assert_allow(&response);

    let response = engine
        .evaluate(&user_request("alice", "read", r#"Document::"secret""#))
        .unwrap();
    assert_deny(&response);
}

#[test]
fn test_json_schema_constructor_works() {
    let schema_json = r#"{
        "": {
            "entityTypes": {
                "User": {"memberOfTypes": ["Group"]},
                "Group": {},
                "Document": {"shape": {"type": "Record", "attributes": {
                    "id": {"type": "String"},
                    "sensitivity": {"type": "Long"}
                }}}
            },
            "actions": {
                "read": {"appliesTo": {"principalTypes": ["User"], "resourceTypes": ["Document"]}}
            }
        }
    }"#;
    let engine = schema_engine_from_policy(TEST_SCHEMA_POLICY, schema_json)
        .with_entities(documents())
        .unwrap();

    assert_eq!(
        engine.current_snapshot().schema(),
        Some(&TEST_SCHEMA.parse::<Schema>().unwrap())
    );
    assert_allow(
        &engine
            .evaluate(&user_request("alice", "read", r#"Document::"doc1""#))
            .unwrap(),
    );
}

#[test]
fn test_schema_text_constructor_rejects_invalid_schema() {
    let result = PolicyEngine::new_from_str_with_cedarschema(
        TEST_SCHEMA_POLICY,
        "this is not valid schema text",
    );
    assert!(matches!(result, Err(PolicyError::SyntaxError { .. })));
}

#[parameterized(
    group_principal = {
        request(r#"Group::"admins""#, r#"Action::"read""#, r#"Document::"doc1""#),
        RequestValidationError::PrincipalNotApplicable {
            action: uid(r#"Action::"read""#),
            principal_type: "Group".to_string(),
        }
    },
    unknown_action = {
        user_request("alice", "delete", r#"Document::"doc1""#),
        RequestValidationError::UnknownAction(uid(r#"Action::"delete""#))
    },
    undeclared_resource_type = {
        user_request("alice", "read", r#"Photo::"p1""#),
        RequestValidationError::UndeclaredEntityType("Photo".to_string())
    },
    unexpected_context = {
        user_request("alice", "read", r#"Document::"doc1""#)
            .with_context(Context::new().with_attr("mfa", true)),
        RequestValidationError::UnexpectedContextAttribute {
            action: uid(r#"Action::"read""#),
            attribute: "mfa".to_string(),
        }
    },
)]
fn test_schema_validates_requests(req: Request, expected: RequestValidationError) {
    let engine = schema_engine();
    assert_eq!(
        engine.evaluate(&req),
        Err(PolicyError::RequestValidation(expected))
    );
}

#[test]
#[serial_test::serial]
fn test_permissive_mode_logs_and_evaluates() {
    let sink = log_sink();
    let engine = schema_engine()
        .with_config(AuthorizerConfig {
            validation_mode: ValidationMode::Permissive,
            ..AuthorizerConfig::default()
        })
        .unwrap();

    sink.clear();
    let response = engine
        .evaluate(&user_request("alice", "delete", r#"Document::"doc1""#))
        .unwrap();
    assert_deny(&response);

    let logs = sink.contents();
    assert!(
        logs.contains("does not match the schema"),
        "expected validation warning, logs: {logs}"
    );
}

#[test]
fn test_schema_validates_entity_attribute_types() {
    let engine = schema_engine_from_policy(TEST_SCHEMA_POLICY, TEST_SCHEMA);
    let entities = Entities::from_entities([Entity::with_uid(uid(r#"Document::"doc1""#))
        .with_attr("id", "doc1")
        .with_attr("sensitivity", "high")])
    .unwrap();

    let result = engine.with_entities(entities);
    assert!(matches!(result, Err(PolicyError::EntityValidation(_))));
}

#[test]
fn test_entities_from_json_with_schema() {
    let json = serde_json::json!([
        {"uid": {"type": "User", "id": "alice"}, "attrs": {}, "parents": [{"type": "Group", "id": "readers"}]},
        {"uid": {"type": "Document", "id": "doc1"}, "attrs": {"id": "doc1", "sensitivity": 2}, "parents": []}
    ]);
    let entities = Entities::from_json_value(&json).unwrap();
    let engine = schema_engine_from_policy(TEST_SCHEMA_POLICY, TEST_SCHEMA)
        .with_entities(entities)
        .unwrap();

    assert_allow(
        &engine
            .evaluate(&user_request("alice", "read", r#"Document::"doc1""#))
            .unwrap(),
    );
}

#[test]
fn test_reload_preserves_schema_validation() {
    let engine = schema_engine();
    let invalid_policy = r#"
        permit (
            principal == User::"alice",
            action == Action::"write",
            resource is Document
        );
    "#;

    let result = engine.reload_from_str(invalid_policy);
    assert!(matches!(result, Err(PolicyError::PolicyValidation(_))));
    assert!(engine.current_snapshot().schema().is_some());
}

#[test]
fn test_reload_with_schema_object_changes_enforcement() {
    let engine = schema_engine();

    let read_request = user_request("alice", "read", r#"Document::"doc1""#);
    assert_allow(&engine.evaluate(&read_request).unwrap());

    let schema_write: Schema = TEST_SCHEMA_WRITE.parse().unwrap();
    engine
        .reload_from_str_with_schema(TEST_SCHEMA_POLICY_WRITE, schema_write)
        .unwrap();

    let write_request = user_request("alice", "write", r#"Document::"doc1""#);
    assert_allow(&engine.evaluate(&write_request).unwrap());

    assert!(matches!(
        engine.evaluate(&read_request),
        Err(PolicyError::RequestValidation(_))
    ));
}

#[test]
fn test_reload_with_schema_revalidates_entities() {
    let engine = schema_engine();
    let version_before = engine.current_version();
    let narrower = r#"
        entity User;
        entity Document { id: String };
        action "read" appliesTo { principal: User, resource: Document };
    "#;

    let result = engine.reload_from_str_with_cedarschema(TEST_SCHEMA_POLICY, narrower);
    // The policy still reads `sensitivity`, so it fails before the entities are checked.
    assert!(matches!(result, Err(PolicyError::PolicyValidation(_))));

    let policy = r#"permit (principal, action == Action::"read", resource);"#;
    let result = engine.reload_from_str_with_cedarschema(policy, narrower);
    assert!(matches!(result, Err(PolicyError::EntityValidation(_))));
    assert_eq!(engine.current_version(), version_before);
}

#[test]
fn test_reload_with_schema_text_rejects_invalid_schema() {
    let engine = engine_from_policy(TEST_SCHEMA_POLICY);
    let result = engine
        .reload_from_str_with_cedarschema(TEST_SCHEMA_POLICY, "this is not valid schema text");
    assert!(matches!(result, Err(PolicyError::SyntaxError { .. })));
}

#[test]
fn test_reload_with_schema_object_failure_is_atomic() {
    let engine = schema_engine();
    let read_request = user_request("alice", "read", r#"Document::"doc1""#);
    let version_before = engine.current_version();

    assert_allow(&engine.evaluate(&read_request).unwrap());

    let schema_write: Schema = TEST_SCHEMA_WRITE.parse().unwrap();
    let result = engine.reload_from_str_with_schema(TEST_SCHEMA_POLICY, schema_write);
    assert!(matches!(result, Err(PolicyError::PolicyValidation(_))));

    assert_eq!(engine.current_version(), version_before);
    assert_allow(&engine.evaluate(&read_request).unwrap());
}

#[test]
fn test_non_schema_engine_can_reload_with_schema() {
    let engine = engine_from_policy(TEST_SCHEMA_POLICY_WRITE)
        .with_entities(documents())
        .unwrap();
    let write_request = user_request("alice", "write", r#"Document::"doc1""#);

    assert_allow(&engine.evaluate(&write_request).unwrap());

    engine
        .reload_from_str_with_cedarschema(TEST_SCHEMA_POLICY, TEST_SCHEMA)
        .unwrap();

    let read_request = user_request("alice", "read", r#"Document::"doc1""#);
    assert_allow(&engine.evaluate(&read_request).unwrap());

    assert!(matches!(
        engine.evaluate(&write_request),
        Err(PolicyError::RequestValidation(_))
    ));
}

#[test]
#[serial_test::serial]
fn test_reload_logs_schema_status() {
    let sink = log_sink();
    sink.clear();
    let engine = schema_engine();

    let schema_write: Schema = TEST_SCHEMA_WRITE.parse().unwrap();
    engine
        .reload_from_str_with_schema(TEST_SCHEMA_POLICY_WRITE, schema_write)
        .unwrap();

    let logs = sink.contents();
    assert!(
        logs.contains("PolicyReload"),
        "expected reload log event, logs: {logs}"
    );
    assert!(
        logs.contains("schema_reloaded=true"),
        "expected schema_reloaded=true in logs: {logs}"
    );
}

#[test]
fn test_non_schema_engine_behavior_unchanged() {
    let policy_not_allowed_by_test_schema = r#"
        permit (
            principal == User::"alice",
            action == Action::"write",
            resource is Document
        );
    "#;

    let engine = engine_from_policy(policy_not_allowed_by_test_schema);
    let response = engine
        .evaluate(&user_request("alice", "write", r#"Document::"doc1""#))
        .unwrap();
    assert_allow(&response);
}
