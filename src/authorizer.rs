//! Policy combination: one request in, one decision plus diagnostics out.

use std::collections::BTreeSet;
use std::sync::Arc;

use itertools::Itertools;
use tracing::{debug, warn};

use crate::ast::{Effect, Policy};
use crate::config::{AuthorizerConfig, ValidationMode};
use crate::entities::Entities;
use crate::error::{EvaluationError, PolicyError};
use crate::evaluator::{Env, Evaluator};
use crate::policy_match::scope_matches;
use crate::policy_set::PolicySet;
use crate::schema::Schema;
use crate::traits::EntityLookup;
use crate::types::{Decision, Diagnostics, PolicyId, Request, Response};

/// Evaluates requests against a fixed policy set.
///
/// Template links are materialized once at construction. The authorizer
/// holds no mutable state and can be shared freely across threads.
#[derive(Debug, Clone)]
pub struct Authorizer {
    policy_set: PolicySet,
    effective: Vec<Policy>,
    schema: Option<Arc<Schema>>,
    config: AuthorizerConfig,
}

impl Authorizer {
    pub fn new(policies: PolicySet) -> Result<Self, PolicyError> {
        Self::build(policies, None)
    }

    /// Like `new`, but the policies must pass validation against `schema`.
    /// Requests are then validated per the configured `ValidationMode`.
    pub fn with_schema(policies: PolicySet, schema: Schema) -> Result<Self, PolicyError> {
        Self::with_shared_schema(policies, Arc::new(schema))
    }

    pub(crate) fn with_shared_schema(
        policies: PolicySet,
        schema: Arc<Schema>,
    ) -> Result<Self, PolicyError> {
        let result = schema.validate_policies(&policies);
        for warning in &result.warnings {
            warn!(
                event = "Schema",
                phase = "ValidatePolicies",
                policy = warning.policy_id.as_str(),
                kind = %warning.kind,
                "{}",
                warning.message
            );
        }
        if !result.passed() {
            let message = result
                .errors
                .iter()
                .map(|e| format!("{}: {}", e.policy_id, e.message))
                .join(" - ");
            return Err(PolicyError::PolicyValidation(message));
        }
        Self::build(policies, Some(schema))
    }

    /// Attach `schema` for request and entity validation without checking
    /// the policies against it.
    pub(crate) fn build(
        policies: PolicySet,
        schema: Option<Arc<Schema>>,
    ) -> Result<Self, PolicyError> {
        let effective = policies.effective_policies()?;
        Ok(Self {
            policy_set: policies,
            effective,
            schema,
            config: AuthorizerConfig::default(),
        })
    }

    pub fn with_config(mut self, config: AuthorizerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn policy_set(&self) -> &PolicySet {
        &self.policy_set
    }

    /// Static policies followed by materialized template links.
    pub fn effective_policies(&self) -> &[Policy] {
        &self.effective
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_deref()
    }

    pub(crate) fn shared_schema(&self) -> Option<Arc<Schema>> {
        self.schema.clone()
    }

    pub fn config(&self) -> &AuthorizerConfig {
        &self.config
    }

    /// Decide one request.
    ///
    /// With a schema attached, a request that fails validation is an error in
    /// `Strict` mode and a logged warning in `Permissive` mode. Evaluation
    /// errors never fail the call; they are reported in the diagnostics.
    pub fn is_authorized(
        &self,
        request: &Request,
        entities: &dyn EntityLookup,
    ) -> Result<Response, PolicyError> {
        self.validate_request(request)?;
        Ok(self.decide(request, entities))
    }

    pub(crate) fn validate_request(&self, request: &Request) -> Result<(), PolicyError> {
        let Some(schema) = &self.schema else {
            return Ok(());
        };
        match schema.validate_request(request) {
            Ok(()) => Ok(()),
            Err(err) => match self.config.validation_mode {
                ValidationMode::Strict => Err(err.into()),
                ValidationMode::Permissive => {
                    warn!(
                        event = "Request",
                        phase = "Validation",
                        principal = %request.principal,
                        action = %request.action,
                        resource = %request.resource,
                        error = %err,
                        "Evaluating request that does not match the schema"
                    );
                    Ok(())
                }
            },
        }
    }

    pub(crate) fn validate_entities(&self, entities: &Entities) -> Result<(), PolicyError> {
        match &self.schema {
            Some(schema) if self.config.validate_entities => entities.validate(schema),
            _ => Ok(()),
        }
    }

    /// Deny overrides permit; no satisfied policy means deny.
    pub(crate) fn decide(&self, request: &Request, entities: &dyn EntityLookup) -> Response {
        debug!(
            event = "Request",
            phase = "Evaluation",
            principal = %request.principal,
            action = %request.action,
            resource = %request.resource,
            correlation_id = request.correlation_id.as_deref()
        );

        let evaluator = Evaluator::new(Env::new(request, entities))
            .with_max_depth(self.config.max_expression_depth);
        let mut diagnostics = Diagnostics::default();
        let mut permits = BTreeSet::new();
        let mut forbids = BTreeSet::new();

        for policy in &self.effective {
            match satisfied(policy, request, entities, &evaluator) {
                Ok(false) => {}
                Ok(true) => {
                    let bucket = match policy.effect() {
                        Effect::Permit => &mut permits,
                        Effect::Forbid => &mut forbids,
                    };
                    bucket.insert(policy.id().clone());
                }
                Err(err) => {
                    warn!(
                        event = "Request",
                        phase = "Policy",
                        policy = policy.id().as_str(),
                        error = %err,
                        "Policy evaluation failed"
                    );
                    diagnostics.record_error(policy.id().clone(), err);
                }
            }
        }

        let (decision, reasons): (Decision, BTreeSet<PolicyId>) = if !forbids.is_empty() {
            (Decision::Deny, forbids)
        } else if !permits.is_empty() {
            (Decision::Allow, permits)
        } else {
            (Decision::Deny, BTreeSet::new())
        };
        diagnostics.reasons = reasons;

        debug!(
            event = "Request",
            phase = "Result",
            decision = %decision,
            reasons = ?diagnostics.reasons,
            errors = ?diagnostics.errors
        );

        Response {
            decision,
            correlation_id: request.correlation_id.clone(),
            diagnostics,
        }
    }
}

/// Scope first, then clauses in order; the first failing clause stops.
fn satisfied(
    policy: &Policy,
    request: &Request,
    entities: &dyn EntityLookup,
    evaluator: &Evaluator<'_>,
) -> Result<bool, EvaluationError> {
    let in_scope = scope_matches(policy.principal(), &request.principal, entities)?
        && scope_matches(policy.action(), &request.action, entities)?
        && scope_matches(policy.resource(), &request.resource, entities)?;
    if !in_scope {
        return Ok(false);
    }
    for clause in policy.conditions() {
        if !evaluator.clause_holds(clause)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Many requests against one authorizer and one entity store.
pub struct BatchAuthorizer<'a> {
    authorizer: &'a Authorizer,
    entities: &'a Entities,
}

impl<'a> BatchAuthorizer<'a> {
    /// Validates the entities once when the authorizer carries a schema.
    pub fn new(authorizer: &'a Authorizer, entities: &'a Entities) -> Result<Self, PolicyError> {
        authorizer.validate_entities(entities)?;
        Ok(Self {
            authorizer,
            entities,
        })
    }

    /// Every request is validated before any is evaluated, so a fatal
    /// validation error yields no partial results. Output order follows input.
    pub fn is_authorized_batch(&self, requests: &[Request]) -> Result<Vec<Response>, PolicyError> {
        for request in requests {
            self.authorizer.validate_request(request)?;
        }
        debug!(
            event = "Request",
            phase = "Batch",
            requests = requests.len()
        );
        Ok(requests
            .iter()
            .map(|request| self.authorizer.decide(request, self.entities))
            .collect())
    }
}

/// One-shot authorization. A schema, when given, validates the entities and
/// the request; the policies themselves are not validated here.
pub fn is_authorized(
    request: &Request,
    policies: &PolicySet,
    entities: &Entities,
    schema: Option<&Schema>,
) -> Result<Response, PolicyError> {
    let authorizer = Authorizer::build(policies.clone(), schema.cloned().map(Arc::new))?;
    authorizer.validate_entities(entities)?;
    authorizer.is_authorized(request, entities)
}

pub fn is_authorized_batch(
    requests: &[Request],
    policies: &PolicySet,
    entities: &Entities,
    schema: Option<&Schema>,
) -> Result<Vec<Response>, PolicyError> {
    let authorizer = Authorizer::build(policies.clone(), schema.cloned().map(Arc::new))?;
    BatchAuthorizer::new(&authorizer, entities)?.is_authorized_batch(requests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RequestValidationError;
    use crate::types::{Context, Entity, EntityUid};
    use yare::parameterized;

    const POLICIES: &str = r#"
        @id("owner-edit")
        permit(principal, action == Action::"edit", resource)
        when { resource.owner == principal };

        @id("staff-view")
        permit(principal in Group::"staff", action == Action::"view", resource);

        @id("no-archived")
        forbid(principal, action, resource)
        when { resource has archived && resource.archived };
    "#;

    fn uid(s: &str) -> EntityUid {
        s.parse().unwrap()
    }

    fn entities() -> Entities {
        Entities::from_entities([
            Entity::with_uid(uid(r#"User::"alice""#)).with_parent(uid(r#"Group::"staff""#)),
            Entity::with_uid(uid(r#"User::"bob""#)),
            Entity::with_uid(uid(r#"Doc::"a""#)).with_attr("owner", uid(r#"User::"alice""#)),
            Entity::with_uid(uid(r#"Doc::"old""#))
                .with_attr("owner", uid(r#"User::"alice""#))
                .with_attr("archived", true),
            Entity::with_uid(uid(r#"Doc::"orphan""#)),
        ])
        .unwrap()
    }

    fn request(principal: &str, action: &str, resource: &str) -> Request {
        Request::new(
            uid(&format!(r#"User::"{principal}""#)),
            uid(&format!(r#"Action::"{action}""#)),
            uid(&format!(r#"Doc::"{resource}""#)),
        )
    }

    fn authorizer() -> Authorizer {
        Authorizer::new(POLICIES.parse().unwrap()).unwrap()
    }

    #[parameterized(
        owner_edits = { "alice", "edit", "a", Decision::Allow, &["owner-edit"], &[] },
        non_owner_denied = { "bob", "edit", "a", Decision::Deny, &[], &[] },
        staff_views = { "alice", "view", "a", Decision::Allow, &["staff-view"], &[] },
        outsider_view_denied = { "bob", "view", "a", Decision::Deny, &[], &[] },
        forbid_overrides = { "alice", "edit", "old", Decision::Deny, &["no-archived"], &[] },
        error_is_isolated = { "alice", "edit", "orphan", Decision::Deny, &[], &["owner-edit"] },
        orphan_view_skips_owner_check = { "alice", "view", "orphan", Decision::Allow, &["staff-view"], &[] },
    )]
    fn test_decisions(
        principal: &str,
        action: &str,
        resource: &str,
        decision: Decision,
        reasons: &[&str],
        errors: &[&str],
    ) {
        let response = authorizer()
            .is_authorized(&request(principal, action, resource), &entities())
            .unwrap();
        assert_eq!(response.decision, decision);
        let reason_ids: Vec<&str> = response.diagnostics.reasons.iter().map(PolicyId::as_str).collect();
        let error_ids: Vec<&str> = response.diagnostics.errors.iter().map(PolicyId::as_str).collect();
        assert_eq!(reason_ids, reasons);
        assert_eq!(error_ids, errors);
    }

    #[test]
    fn test_error_details_are_typed() {
        let response = authorizer()
            .is_authorized(&request("alice", "edit", "orphan"), &entities())
            .unwrap();
        assert!(matches!(
            response.diagnostics.error_details().get(&PolicyId::new("owner-edit")),
            Some(EvaluationError::AttributeNotFound { .. })
        ));
    }

    #[test]
    fn test_empty_policy_set_denies() {
        let authorizer = Authorizer::new(PolicySet::new()).unwrap();
        let response = authorizer
            .is_authorized(&request("alice", "view", "a"), &Entities::empty())
            .unwrap();
        assert_eq!(response.decision, Decision::Deny);
        assert!(response.diagnostics.reasons.is_empty());
    }

    #[test]
    fn test_correlation_id_is_passed_through() {
        let req = request("alice", "view", "a").with_correlation_id("req-42");
        let response = authorizer().is_authorized(&req, &entities()).unwrap();
        assert_eq!(response.correlation_id.as_deref(), Some("req-42"));
    }

    #[test]
    fn test_unless_and_clause_order() {
        let policies: PolicySet = r#"
            permit(principal, action, resource)
            when { context.ok }
            unless { context.blocked };
        "#
        .parse()
        .unwrap();
        let authorizer = Authorizer::new(policies).unwrap();
        let decide = |context: Context| {
            authorizer
                .is_authorized(&request("bob", "view", "a").with_context(context), &Entities::empty())
                .unwrap()
        };

        assert!(decide(Context::new().with_attr("ok", true).with_attr("blocked", false)).is_allowed());
        assert!(!decide(Context::new().with_attr("ok", true).with_attr("blocked", true)).is_allowed());
        // The `unless` clause is never reached, so its missing attribute is not an error.
        let skipped = decide(Context::new().with_attr("ok", false));
        assert!(!skipped.is_allowed());
        assert!(skipped.diagnostics.errors.is_empty());
    }

    #[test]
    fn test_linked_templates_take_part() {
        let mut policies: PolicySet = r#"
            @id("t")
            permit(principal == ?principal, action, resource in ?resource);
        "#
        .parse()
        .unwrap();
        policies
            .link(
                &"t".into(),
                "bob-docs".into(),
                [
                    (crate::ast::SlotId::Principal, uid(r#"User::"bob""#)),
                    (crate::ast::SlotId::Resource, uid(r#"Doc::"a""#)),
                ]
                .into(),
            )
            .unwrap();
        let authorizer = Authorizer::new(policies).unwrap();
        let response = authorizer
            .is_authorized(&request("bob", "view", "a"), &entities())
            .unwrap();
        assert!(response.is_allowed());
        assert_eq!(response.to_string(), "allow(bob-docs)");
    }

    const SCHEMA: &str = r#"
        entity User;
        entity Doc { owner: User };
        action view appliesTo { principal: User, resource: Doc, context: { mfa: Bool } };
    "#;

    #[test]
    fn test_with_schema_rejects_invalid_policies() {
        let schema: Schema = SCHEMA.parse().unwrap();
        let policies: PolicySet = r#"permit(principal, action == Action::"view", resource) when { resource.title == "x" };"#
            .parse()
            .unwrap();
        assert!(matches!(
            Authorizer::with_schema(policies, schema),
            Err(PolicyError::PolicyValidation(msg)) if msg.contains("title")
        ));
    }

    #[test]
    fn test_validation_modes() {
        let schema: Schema = SCHEMA.parse().unwrap();
        let policies: PolicySet = r#"permit(principal, action == Action::"view", resource);"#
            .parse()
            .unwrap();
        let strict = Authorizer::with_schema(policies, schema).unwrap();
        let req = Request::new(
            uid(r#"User::"alice""#),
            uid(r#"Action::"view""#),
            uid(r#"Doc::"a""#),
        );

        assert_eq!(
            strict.is_authorized(&req, &Entities::empty()),
            Err(PolicyError::RequestValidation(
                RequestValidationError::MissingContextAttribute {
                    action: uid(r#"Action::"view""#),
                    attribute: "mfa".into(),
                }
            ))
        );

        let permissive = strict.clone().with_config(AuthorizerConfig {
            validation_mode: ValidationMode::Permissive,
            ..AuthorizerConfig::default()
        });
        assert!(permissive.is_authorized(&req, &Entities::empty()).unwrap().is_allowed());
    }

    #[test]
    fn test_batch_validates_everything_first() {
        let schema: Schema = SCHEMA.parse().unwrap();
        let policies: PolicySet = r#"permit(principal, action == Action::"view", resource);"#
            .parse()
            .unwrap();
        let entities = Entities::empty();
        let good = Request::new(
            uid(r#"User::"alice""#),
            uid(r#"Action::"view""#),
            uid(r#"Doc::"a""#),
        )
        .with_context(Context::new().with_attr("mfa", true));
        let bad = Request::new(
            uid(r#"User::"alice""#),
            uid(r#"Action::"delete""#),
            uid(r#"Doc::"a""#),
        );

        let responses =
            is_authorized_batch(&[good.clone(), good.clone()], &policies, &entities, Some(&schema))
                .unwrap();
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(Response::is_allowed));

        assert!(matches!(
            is_authorized_batch(&[good, bad], &policies, &entities, Some(&schema)),
            Err(PolicyError::RequestValidation(RequestValidationError::UnknownAction(_)))
        ));
    }

    #[test]
    fn test_batch_rejects_invalid_entities() {
        let schema: Schema = SCHEMA.parse().unwrap();
        let authorizer = Authorizer::build(PolicySet::new(), Some(Arc::new(schema))).unwrap();
        let entities = Entities::from_entities([Entity::with_uid(uid(r#"Doc::"a""#))]).unwrap();
        assert!(matches!(
            BatchAuthorizer::new(&authorizer, &entities),
            Err(PolicyError::EntityValidation(_))
        ));
    }

    fn long_or_chain(terms: usize) -> String {
        let mut body = vec!["context.x == 0"; terms - 1];
        body.push("true");
        format!(
            "permit(principal, action, resource) when {{ {} }};",
            body.join(" || ")
        )
    }

    #[test]
    fn test_accepted_chains_stay_within_evaluation_depth() {
        let limit = crate::config::DEFAULT_MAX_EXPRESSION_DEPTH;
        let policies: PolicySet = long_or_chain(limit - 1).parse().unwrap();
        let req = request("bob", "view", "a").with_context(Context::new().with_attr("x", 1));

        let response = is_authorized(&req, &policies, &Entities::empty(), None).unwrap();
        assert_eq!(response.decision, Decision::Allow);
        assert!(response.diagnostics.errors.is_empty());

        assert!(matches!(
            long_or_chain(limit).parse::<PolicySet>(),
            Err(PolicyError::SyntaxError { .. })
        ));
        assert!(matches!(
            long_or_chain(300).parse::<PolicySet>(),
            Err(PolicyError::SyntaxError { .. })
        ));
    }

    #[test]
    fn test_free_function_without_schema() {
        let policies: PolicySet = POLICIES.parse().unwrap();
        let response =
            is_authorized(&request("alice", "view", "a"), &policies, &entities(), None).unwrap();
        assert!(response.is_allowed());
    }
}
