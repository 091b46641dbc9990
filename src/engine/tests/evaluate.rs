#[parameterized(
    alice_views_photo_in_album = { "alice", r#"Photo::"p1""#, Decision::Allow, &["policy0"] },
    bob_is_not_alice = { "bob", r#"Photo::"p1""#, Decision::Deny, &[] },
    album_itself_is_in_scope = { "alice", r#"Album::"jane_vacation""#, Decision::Allow, &["policy0"] },
    photo_outside_album = { "alice", r#"Photo::"loose""#, Decision::Deny, &[] },
    unknown_photo = { "alice", r#"Photo::"nowhere""#, Decision::Deny, &[] },
)]
fn test_photo_album_requests(user: &str, resource: &str, decision: Decision, expected: &[&str]) {
    let engine = engine_from_policy(PHOTO_POLICY)
        .with_entities(photo_entities())
        .unwrap();
    let response = engine.evaluate(&user_request(user, "view", resource)).unwrap();

    assert_eq!(response.decision, decision);
    assert_eq!(reasons(&response), expected);
    assert!(response.diagnostics.errors.is_empty());
}

#[test]
fn test_forbid_overrides_permit() {
    let engine = engine_from_policy(POLICY_WITH_FORBID);
    let response = engine
        .evaluate(&user_request("alice", "view", r#"Photo::"p1""#))
        .unwrap();

    assert_deny(&response);
    assert_eq!(reasons(&response), ["deny-all"]);
}

#[parameterized(
    owner_without_group = { r#"User::"alice""#, r#"Photo::"owned""#, Decision::Allow, &["owner-only"], &[] },
    missing_owner_errors = { r#"User::"bob""#, r#"Photo::"loose""#, Decision::Deny, &[], &["owner-only"] },
    error_does_not_block_permit = { r#"User::"sam""#, r#"Photo::"loose""#, Decision::Allow, &["staff-edit"], &["owner-only"] },
)]
fn test_errored_policies_are_skipped(
    principal: &str,
    resource: &str,
    decision: Decision,
    expected_reasons: &[&str],
    expected_errors: &[&str],
) {
    let engine = engine_from_policy(POLICY_WITH_OWNER)
        .with_entities(photo_entities())
        .unwrap();
    let response = engine
        .evaluate(&request(principal, r#"Action::"edit""#, resource))
        .unwrap();

    assert_eq!(response.decision, decision);
    assert_eq!(reasons(&response), expected_reasons);
    assert_eq!(errors(&response), expected_errors);
}

#[parameterized(
    admin_deletes = { "alice", "delete", Decision::Allow, &["admins"] },
    admin_views_through_both_groups = { "alice", "view", Decision::Allow, &["admins", "users"] },
    user_views = { "bob", "view", Decision::Allow, &["users"] },
    user_cannot_delete = { "bob", "delete", Decision::Deny, &[] },
    outsider_cannot_view = { "sam", "view", Decision::Deny, &[] },
)]
fn test_group_membership(user: &str, action: &str, decision: Decision, expected: &[&str]) {
    let engine = engine_from_policy(POLICY_WITH_GROUPS)
        .with_entities(photo_entities())
        .unwrap();
    let response = engine
        .evaluate(&user_request(user, action, r#"Photo::"p1""#))
        .unwrap();

    assert_eq!(response.decision, decision);
    assert_eq!(reasons(&response), expected);
}

#[test]
fn test_hierarchy_is_transitive_and_bounded() {
    let policy = r#"permit (principal, action, resource in Account::"jane");"#;
    let engine = engine_from_policy(policy)
        .with_entities(photo_entities())
        .unwrap();

    for (resource, allowed) in [
        (r#"Photo::"p1""#, true),
        (r#"Album::"jane_vacation""#, true),
        (r#"Account::"jane""#, true),
        (r#"Photo::"loose""#, false),
    ] {
        let response = engine
            .evaluate(&user_request("bob", "view", resource))
            .unwrap();
        assert_eq!(response.is_allowed(), allowed, "{resource}");
    }
}

#[test]
fn test_context_conditions() {
    let policy = r#"
        permit (principal, action == Action::"view", resource)
        when { context.mfa && context.ip like "10.*" };
    "#;
    let engine = engine_from_policy(policy);
    let with_context = |mfa: bool, ip: &str| {
        user_request("alice", "view", r#"Photo::"p1""#)
            .with_context(Context::new().with_attr("mfa", mfa).with_attr("ip", ip))
    };

    assert_allow(&engine.evaluate(&with_context(true, "10.0.0.1")).unwrap());
    assert_deny(&engine.evaluate(&with_context(false, "10.0.0.1")).unwrap());
    assert_deny(&engine.evaluate(&with_context(true, "192.168.0.1")).unwrap());
}

#[test]
fn test_evaluate_batch_preserves_order() {
    let engine = engine_from_policy(POLICY_WITH_GROUPS)
        .with_entities(photo_entities())
        .unwrap();
    let requests = [
        user_request("alice", "delete", r#"Photo::"p1""#),
        user_request("bob", "delete", r#"Photo::"p1""#),
        user_request("bob", "view", r#"Photo::"p1""#).with_correlation_id("third"),
    ];

    let responses = engine.evaluate_batch(&requests).unwrap();
    let decisions: Vec<Decision> = responses.iter().map(|r| r.decision).collect();
    assert_eq!(decisions, [Decision::Allow, Decision::Deny, Decision::Allow]);
    assert_eq!(responses[2].correlation_id.as_deref(), Some("third"));
}

#[test]
fn test_evaluate_batch_is_empty_for_no_requests() {
    let engine = engine_from_policy(PHOTO_POLICY);
    assert!(engine.evaluate_batch(&[]).unwrap().is_empty());
}
