//! Best-effort policy validation.
//!
//! Each policy is checked once per request environment it can apply to: an
//! (action, principal type, resource type) triple admitted both by the
//! policy scope and by the action's `appliesTo`. Condition bodies are typed
//! in every environment. A policy with no environment at all is reported as
//! a warning, since it can never affect a decision.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::Serialize;
use tracing::debug;

use crate::ast::{BinaryOp, EntityReference, Expr, Literal, Policy, ScopeConstraint, UnaryOp, Var};
use crate::policy_set::PolicySet;
use crate::types::{EntityUid, PolicyId};

use super::{Attribute, Schema, SchemaType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub policy_id: PolicyId,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum ValidationWarningKind {
    /// The policy scope admits no request the schema allows.
    ImpossiblePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationWarning {
    pub policy_id: PolicyId,
    pub kind: ValidationWarningKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    /// No errors; warnings may still be present.
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn passed_without_warnings(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}

impl Display for ValidationResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        for error in &self.errors {
            writeln!(f, "error in {}: {}", error.policy_id, error.message)?;
        }
        for warning in &self.warnings {
            writeln!(
                f,
                "warning in {} ({}): {}",
                warning.policy_id, warning.kind, warning.message
            )?;
        }
        Ok(())
    }
}

pub(crate) fn validate_policy_set(schema: &Schema, set: &PolicySet) -> ValidationResult {
    let mut result = ValidationResult::default();
    for policy in set.policies().iter().chain(set.templates()) {
        validate_policy(schema, policy, &mut result);
    }
    for link in set.links() {
        for (slot, uid) in link.values() {
            if schema.entity_type(uid.entity_type()).is_none() {
                result.errors.push(ValidationError {
                    policy_id: link.new_id().clone(),
                    message: format!(
                        "unrecognized entity type `{}` bound to {slot}",
                        uid.entity_type()
                    ),
                });
            }
        }
    }
    debug!(
        event = "Schema",
        phase = "ValidatePolicies",
        errors = result.errors.len(),
        warnings = result.warnings.len()
    );
    result
}

/// One (action, principal type, resource type) combination.
struct RequestEnv<'a> {
    action: &'a EntityUid,
    principal: &'a str,
    resource: &'a str,
    context: &'a BTreeMap<String, Attribute>,
}

fn validate_policy(schema: &Schema, policy: &Policy, result: &mut ValidationResult) {
    let mut errors = BTreeSet::new();
    check_scope_types(schema, policy.principal(), &mut errors);
    check_scope_types(schema, policy.resource(), &mut errors);
    let actions = candidate_actions(schema, policy.action(), &mut errors);

    let mut envs = Vec::new();
    for action in actions {
        let Some(decl) = schema.action(action) else {
            continue;
        };
        for principal in &decl.principal_types {
            if !scope_admits_type(schema, policy.principal(), principal) {
                continue;
            }
            for resource in &decl.resource_types {
                if scope_admits_type(schema, policy.resource(), resource) {
                    envs.push(RequestEnv {
                        action,
                        principal,
                        resource,
                        context: &decl.context,
                    });
                }
            }
        }
    }

    if errors.is_empty() && envs.is_empty() {
        result.warnings.push(ValidationWarning {
            policy_id: policy.id().clone(),
            kind: ValidationWarningKind::ImpossiblePolicy,
            message: "policy scope matches no principal, action and resource combination allowed by the schema".to_string(),
        });
    }

    for env in &envs {
        let checker = Checker { schema, env };
        for clause in policy.conditions() {
            let checked = checker
                .infer(&clause.body)
                .and_then(|ty| expect(ty, "bool", |t| *t == Ty::Bool));
            if let Err(message) = checked {
                errors.insert(message);
            }
        }
    }

    result
        .errors
        .extend(errors.into_iter().map(|message| ValidationError {
            policy_id: policy.id().clone(),
            message,
        }));
}

fn check_scope_types(schema: &Schema, constraint: &ScopeConstraint, errors: &mut BTreeSet<String>) {
    let mut require = |entity_type: &str| {
        if schema.entity_type(entity_type).is_none() {
            errors.insert(format!("unrecognized entity type `{entity_type}`"));
        }
    };
    match constraint {
        ScopeConstraint::Eq(EntityReference::Uid(uid))
        | ScopeConstraint::In(EntityReference::Uid(uid)) => require(uid.entity_type()),
        ScopeConstraint::Is(entity_type) => require(entity_type),
        ScopeConstraint::IsIn(entity_type, target) => {
            require(entity_type);
            if let EntityReference::Uid(uid) = target {
                require(uid.entity_type());
            }
        }
        _ => {}
    }
}

fn candidate_actions<'a>(
    schema: &'a Schema,
    constraint: &ScopeConstraint,
    errors: &mut BTreeSet<String>,
) -> Vec<&'a EntityUid> {
    let mut known = |uid: &EntityUid| {
        let declared = schema.action(uid).is_some();
        if !declared {
            errors.insert(format!("unrecognized action {uid}"));
        }
        declared
    };
    let groups: Vec<&EntityUid> = match constraint {
        ScopeConstraint::Eq(EntityReference::Uid(uid)) => {
            return if known(uid) {
                schema.actions().keys().filter(|a| *a == uid).collect()
            } else {
                Vec::new()
            };
        }
        ScopeConstraint::In(EntityReference::Uid(uid)) => vec![uid],
        ScopeConstraint::InList(uids) => uids.iter().collect(),
        _ => return schema.actions().keys().collect(),
    };
    let groups: Vec<&EntityUid> = groups.into_iter().filter(|g| known(g)).collect();
    schema
        .actions()
        .keys()
        .filter(|action| groups.iter().any(|group| schema.action_in_group(action, group)))
        .collect()
}

fn scope_admits_type(schema: &Schema, constraint: &ScopeConstraint, entity_type: &str) -> bool {
    let can_be_in = |target: &EntityReference| match target {
        EntityReference::Uid(uid) => schema.type_can_be_in(entity_type, uid.entity_type()),
        EntityReference::Slot(_) => true,
    };
    match constraint {
        ScopeConstraint::All | ScopeConstraint::InList(_) => true,
        ScopeConstraint::Eq(EntityReference::Uid(uid)) => uid.entity_type() == entity_type,
        ScopeConstraint::Eq(EntityReference::Slot(_)) => true,
        ScopeConstraint::In(target) => can_be_in(target),
        ScopeConstraint::Is(is_type) => is_type == entity_type,
        ScopeConstraint::IsIn(is_type, target) => is_type == entity_type && can_be_in(target),
    }
}

/// Static types. `Entity(None)` is an entity of unknown type (a slot);
/// `Record(None)` a record of unknown shape.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Ty {
    Bool,
    Long,
    String,
    Entity(Option<String>),
    Set(Box<Ty>),
    Record(Option<BTreeMap<String, Ty>>),
    Any,
}

impl Ty {
    fn name(&self) -> &'static str {
        match self {
            Ty::Bool => "bool",
            Ty::Long => "long",
            Ty::String => "string",
            Ty::Entity(_) => "entity",
            Ty::Set(_) => "set",
            Ty::Record(_) => "record",
            Ty::Any => "any",
        }
    }

    fn from_attributes(attributes: &BTreeMap<String, Attribute>) -> Ty {
        Ty::Record(Some(
            attributes
                .iter()
                .map(|(name, attr)| (name.clone(), Ty::from(&attr.ty)))
                .collect(),
        ))
    }
}

impl From<&SchemaType> for Ty {
    fn from(ty: &SchemaType) -> Self {
        match ty {
            SchemaType::Bool => Ty::Bool,
            SchemaType::Long => Ty::Long,
            SchemaType::String => Ty::String,
            SchemaType::Entity(name) => Ty::Entity(Some(name.clone())),
            SchemaType::Set(element) => Ty::Set(Box::new(Ty::from(element.as_ref()))),
            SchemaType::Record(attributes) => Ty::from_attributes(attributes),
        }
    }
}

fn expect(ty: Ty, expected: &str, accepts: impl Fn(&Ty) -> bool) -> Result<Ty, String> {
    if ty == Ty::Any || accepts(&ty) {
        Ok(ty)
    } else {
        Err(format!(
            "type mismatch: expected {expected}, found {}",
            ty.name()
        ))
    }
}

fn is_entity(ty: &Ty) -> bool {
    matches!(ty, Ty::Entity(_))
}

fn is_set(ty: &Ty) -> bool {
    matches!(ty, Ty::Set(_))
}

struct Checker<'a> {
    schema: &'a Schema,
    env: &'a RequestEnv<'a>,
}

impl Checker<'_> {
    fn infer(&self, expr: &Expr) -> Result<Ty, String> {
        match expr {
            Expr::Lit(Literal::Bool(_)) => Ok(Ty::Bool),
            Expr::Lit(Literal::Long(_)) => Ok(Ty::Long),
            Expr::Lit(Literal::String(_)) => Ok(Ty::String),
            Expr::Lit(Literal::EntityUid(uid)) => self.entity_literal(uid),
            Expr::Var(Var::Principal) => Ok(Ty::Entity(Some(self.env.principal.to_string()))),
            Expr::Var(Var::Action) => Ok(Ty::Entity(Some(
                self.env.action.entity_type().to_string(),
            ))),
            Expr::Var(Var::Resource) => Ok(Ty::Entity(Some(self.env.resource.to_string()))),
            Expr::Var(Var::Context) => Ok(Ty::from_attributes(self.env.context)),
            Expr::Slot(_) => Ok(Ty::Entity(None)),
            Expr::Unary { op, arg } => {
                let arg = self.infer(arg)?;
                match op {
                    UnaryOp::Not => expect(arg, "bool", |t| *t == Ty::Bool).map(|_| Ty::Bool),
                    UnaryOp::Neg => expect(arg, "long", |t| *t == Ty::Long).map(|_| Ty::Long),
                    UnaryOp::IsEmpty => expect(arg, "set", is_set).map(|_| Ty::Bool),
                }
            }
            Expr::And(left, right) | Expr::Or(left, right) => {
                expect(self.infer(left)?, "bool", |t| *t == Ty::Bool)?;
                expect(self.infer(right)?, "bool", |t| *t == Ty::Bool)?;
                Ok(Ty::Bool)
            }
            Expr::If {
                cond,
                then_expr,
                else_expr,
            } => {
                expect(self.infer(cond)?, "bool", |t| *t == Ty::Bool)?;
                let then_ty = self.infer(then_expr)?;
                let else_ty = self.infer(else_expr)?;
                Ok(if then_ty == else_ty { then_ty } else { Ty::Any })
            }
            Expr::Binary { op, left, right } => {
                let left = self.infer(left)?;
                let right = self.infer(right)?;
                self.binary(*op, left, right)
            }
            Expr::GetAttr { expr, attr } => self.get_attr(expr, attr),
            Expr::HasAttr { expr, .. } => {
                let ty = self.infer(expr)?;
                expect(ty, "entity or record", |t| {
                    matches!(t, Ty::Entity(_) | Ty::Record(_))
                })?;
                Ok(Ty::Bool)
            }
            Expr::Like { expr, .. } => {
                expect(self.infer(expr)?, "string", |t| *t == Ty::String)?;
                Ok(Ty::Bool)
            }
            Expr::Is {
                expr,
                entity_type,
                in_expr,
            } => {
                expect(self.infer(expr)?, "entity", is_entity)?;
                if self.schema.entity_type(entity_type).is_none() {
                    return Err(format!("unrecognized entity type `{entity_type}`"));
                }
                if let Some(in_expr) = in_expr {
                    expect(self.infer(in_expr)?, "entity or set of entities", |t| {
                        is_entity(t) || is_set(t)
                    })?;
                }
                Ok(Ty::Bool)
            }
            Expr::Set(items) => {
                let types = items
                    .iter()
                    .map(|item| self.infer(item))
                    .collect::<Result<Vec<_>, _>>()?;
                let element = match types.split_first() {
                    Some((first, rest)) if rest.iter().all(|t| t == first) => first.clone(),
                    _ => Ty::Any,
                };
                Ok(Ty::Set(Box::new(element)))
            }
            Expr::Record(fields) => fields
                .iter()
                .map(|(name, value)| Ok((name.clone(), self.infer(value)?)))
                .collect::<Result<BTreeMap<_, _>, String>>()
                .map(|fields| Ty::Record(Some(fields))),
        }
    }

    fn entity_literal(&self, uid: &EntityUid) -> Result<Ty, String> {
        let entity_type = uid.entity_type();
        if self.schema.entity_type(entity_type).is_some() || self.schema.action(uid).is_some() {
            return Ok(Ty::Entity(Some(entity_type.to_string())));
        }
        let is_action_type = entity_type == "Action" || entity_type.ends_with("::Action");
        if is_action_type {
            Err(format!("unrecognized action {uid}"))
        } else {
            Err(format!("unrecognized entity type `{entity_type}`"))
        }
    }

    fn binary(&self, op: BinaryOp, left: Ty, right: Ty) -> Result<Ty, String> {
        let long = |t: &Ty| *t == Ty::Long;
        match op {
            BinaryOp::Eq | BinaryOp::NotEq => Ok(Ty::Bool),
            BinaryOp::Less | BinaryOp::LessEq | BinaryOp::Greater | BinaryOp::GreaterEq => {
                expect(left, "long", long)?;
                expect(right, "long", long)?;
                Ok(Ty::Bool)
            }
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => {
                expect(left, "long", long)?;
                expect(right, "long", long)?;
                Ok(Ty::Long)
            }
            BinaryOp::In => {
                expect(left, "entity", is_entity)?;
                expect(right, "entity or set of entities", |t| is_entity(t) || is_set(t))?;
                Ok(Ty::Bool)
            }
            BinaryOp::Contains => {
                expect(left, "set", is_set)?;
                Ok(Ty::Bool)
            }
            BinaryOp::ContainsAll | BinaryOp::ContainsAny => {
                expect(left, "set", is_set)?;
                expect(right, "set", is_set)?;
                Ok(Ty::Bool)
            }
        }
    }

    fn get_attr(&self, expr: &Expr, attr: &str) -> Result<Ty, String> {
        let target = self.infer(expr)?;
        match target {
            Ty::Entity(Some(name)) => {
                let declared = self
                    .schema
                    .entity_type(&name)
                    .and_then(|decl| decl.attributes.get(attr));
                match declared {
                    Some(attribute) => Ok(Ty::from(&attribute.ty)),
                    None => Err(format!(
                        "attribute `{attr}` is not declared on entity type `{name}`"
                    )),
                }
            }
            Ty::Record(Some(fields)) => fields.get(attr).cloned().ok_or_else(|| {
                let owner = match expr {
                    Expr::Var(Var::Context) => "context",
                    _ => "record",
                };
                format!("attribute `{attr}` is not declared on {owner}")
            }),
            Ty::Entity(None) | Ty::Record(None) | Ty::Any => Ok(Ty::Any),
            other => Err(format!(
                "type mismatch: expected entity or record, found {}",
                other.name()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::SlotId;
    use crate::schema::tests::PHOTO_SCHEMA;
    use yare::parameterized;

    fn validate(policies: &str) -> ValidationResult {
        let schema: Schema = PHOTO_SCHEMA.parse().unwrap();
        let set: PolicySet = policies.parse().unwrap();
        schema.validate_policies(&set)
    }

    #[parameterized(
        owner = { r#"permit(principal, action == Action::"view", resource) when { resource.owner == principal };"# },
        context = { r#"permit(principal, action == Action::"view", resource) when { context.mfa && context has note };"# },
        arithmetic = { r#"permit(principal is User, action in [Action::"view", Action::"edit"], resource) when { principal.age + 1 > 18 };"# },
        group = { r#"permit(principal in Group::"staff", action in Action::"manage", resource);"# },
        sets = { r#"permit(principal, action == Action::"view", resource) when { resource.tags.contains("x") };"# },
        template = { r#"permit(principal == ?principal, action == Action::"view", resource);"# },
    )]
    fn test_valid_policies(policies: &str) {
        let result = validate(policies);
        assert!(result.passed_without_warnings(), "{result}");
    }

    #[parameterized(
        unknown_type = { r#"permit(principal == Robot::"r", action, resource);"#, "unrecognized entity type `Robot`" },
        unknown_action = { r#"permit(principal, action == Action::"fly", resource);"#, r#"unrecognized action Action::"fly""# },
        undeclared_attribute = { r#"permit(principal, action == Action::"view", resource) when { principal.height > 1 };"#, "attribute `height` is not declared on entity type `User`" },
        undeclared_context = { r#"permit(principal, action == Action::"view", resource) when { context.ip == "x" };"#, "attribute `ip` is not declared on context" },
        operand_mismatch = { r#"permit(principal, action == Action::"view", resource) when { principal.age + "1" == 2 };"#, "type mismatch: expected long, found string" },
        non_bool_condition = { r#"permit(principal, action == Action::"view", resource) when { principal.age };"#, "type mismatch: expected bool, found long" },
        unknown_is = { r#"permit(principal, action == Action::"view", resource) when { resource is Video };"#, "unrecognized entity type `Video`" },
    )]
    fn test_policy_errors(policies: &str, message: &str) {
        let result = validate(policies);
        assert!(!result.passed());
        assert_eq!(result.errors[0].policy_id.as_str(), "policy0");
        assert_eq!(result.errors[0].message, message);
    }

    #[test]
    fn test_impossible_policy_is_a_warning() {
        let result = validate(r#"permit(principal is Group, action == Action::"view", resource);"#);
        assert!(result.passed());
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(
            result.warnings[0].kind,
            ValidationWarningKind::ImpossiblePolicy
        );
    }

    #[test]
    fn test_errors_are_reported_per_policy() {
        let result = validate(
            r#"
            permit(principal, action == Action::"view", resource);
            @id("bad")
            forbid(principal, action == Action::"view", resource) when { principal.nope };
            "#,
        );
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].policy_id.as_str(), "bad");
        insta::assert_snapshot!(result.to_string().trim_end(), @"error in bad: attribute `nope` is not declared on entity type `User`");
    }

    #[test]
    fn test_links_bound_to_undeclared_types() {
        let schema: Schema = PHOTO_SCHEMA.parse().unwrap();
        let mut set: PolicySet = r#"permit(principal == ?principal, action == Action::"view", resource);"#
            .parse()
            .unwrap();
        set.link(
            &"policy0".into(),
            "robot".into(),
            BTreeMap::from([(SlotId::Principal, r#"Robot::"r2""#.parse().unwrap())]),
        )
        .unwrap();
        let result = schema.validate_policies(&set);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].policy_id.as_str(), "robot");
    }
}
