use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};
use strum_macros::{Display as StrumDisplay, EnumString};

use crate::config::FormatConfig;
use crate::error::PolicyError;
use crate::types::{EntityUid, PolicyId};

use super::Expr;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    StrumDisplay,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Effect {
    Permit,
    Forbid,
}

/// Placeholder in a template scope, filled in by a link.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, StrumDisplay, EnumString,
)]
pub enum SlotId {
    #[strum(serialize = "?principal")]
    Principal,
    #[strum(serialize = "?resource")]
    Resource,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityReference {
    Uid(EntityUid),
    Slot(SlotId),
}

impl Display for EntityReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            EntityReference::Uid(uid) => write!(f, "{uid}"),
            EntityReference::Slot(slot) => write!(f, "{slot}"),
        }
    }
}

/// A principal, action or resource scope constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeConstraint {
    All,
    Eq(EntityReference),
    In(EntityReference),
    /// Action scope only: `action in [A, B]`.
    InList(Vec<EntityUid>),
    Is(String),
    IsIn(String, EntityReference),
}

impl ScopeConstraint {
    fn slot(&self) -> Option<SlotId> {
        match self {
            ScopeConstraint::Eq(EntityReference::Slot(s))
            | ScopeConstraint::In(EntityReference::Slot(s))
            | ScopeConstraint::IsIn(_, EntityReference::Slot(s)) => Some(*s),
            _ => None,
        }
    }

    fn link(&self, bindings: &BTreeMap<SlotId, EntityUid>) -> ScopeConstraint {
        let bind = |r: &EntityReference| match r {
            EntityReference::Slot(s) => bindings
                .get(s)
                .map(|uid| EntityReference::Uid(uid.clone()))
                .unwrap_or_else(|| r.clone()),
            other => other.clone(),
        };
        match self {
            ScopeConstraint::Eq(r) => ScopeConstraint::Eq(bind(r)),
            ScopeConstraint::In(r) => ScopeConstraint::In(bind(r)),
            ScopeConstraint::IsIn(t, r) => ScopeConstraint::IsIn(t.clone(), bind(r)),
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ClauseKind {
    When,
    Unless,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Clause {
    pub kind: ClauseKind,
    pub body: Expr,
}

impl Clause {
    pub fn when(body: Expr) -> Self {
        Self {
            kind: ClauseKind::When,
            body,
        }
    }

    pub fn unless(body: Expr) -> Self {
        Self {
            kind: ClauseKind::Unless,
            body,
        }
    }
}

/// A single permit or forbid rule, possibly a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    id: PolicyId,
    effect: Effect,
    principal: ScopeConstraint,
    action: ScopeConstraint,
    resource: ScopeConstraint,
    conditions: Vec<Clause>,
    annotations: BTreeMap<String, String>,
}

impl Policy {
    pub fn new(
        id: PolicyId,
        effect: Effect,
        principal: ScopeConstraint,
        action: ScopeConstraint,
        resource: ScopeConstraint,
        conditions: Vec<Clause>,
    ) -> Self {
        Self {
            id,
            effect,
            principal,
            action,
            resource,
            conditions,
            annotations: BTreeMap::new(),
        }
    }

    /// Parse exactly one policy. `@id` in the text wins over `id`, which in
    /// turn defaults to `policy0`.
    pub fn parse(text: &str, id: Option<PolicyId>) -> Result<Self, PolicyError> {
        crate::parser::parse_policy(text, id)
    }

    /// Adds an annotation. `id` is reserved for the policy id and ignored here.
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        if key != "id" {
            self.annotations.insert(key, value.into());
        }
        self
    }

    pub fn with_id(mut self, id: PolicyId) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> &PolicyId {
        &self.id
    }

    pub fn effect(&self) -> Effect {
        self.effect
    }

    pub fn principal(&self) -> &ScopeConstraint {
        &self.principal
    }

    pub fn action(&self) -> &ScopeConstraint {
        &self.action
    }

    pub fn resource(&self) -> &ScopeConstraint {
        &self.resource
    }

    pub fn conditions(&self) -> &[Clause] {
        &self.conditions
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Slots used in the scope or conditions.
    pub fn slots(&self) -> BTreeSet<SlotId> {
        let mut slots: BTreeSet<SlotId> = [&self.principal, &self.resource]
            .into_iter()
            .filter_map(ScopeConstraint::slot)
            .collect();
        for clause in &self.conditions {
            slots.extend(clause.body.slots());
        }
        slots
    }

    pub fn is_template(&self) -> bool {
        !self.slots().is_empty()
    }

    /// Materialize a template with concrete uids for every slot.
    ///
    /// Fails when a slot is left unbound or a binding names a slot the
    /// template does not use.
    pub fn link(
        &self,
        new_id: PolicyId,
        bindings: &BTreeMap<SlotId, EntityUid>,
    ) -> Result<Policy, PolicyError> {
        let slots = self.slots();
        if let Some(missing) = slots.iter().find(|s| !bindings.contains_key(s)) {
            return Err(PolicyError::TemplateLink(format!(
                "template `{}` requires a value for {missing}",
                self.id
            )));
        }
        if let Some(extra) = bindings.keys().find(|s| !slots.contains(s)) {
            return Err(PolicyError::TemplateLink(format!(
                "template `{}` has no slot {extra}",
                self.id
            )));
        }

        let bind = |slot: SlotId| bindings.get(&slot).cloned();
        Ok(Policy {
            id: new_id,
            effect: self.effect,
            principal: self.principal.link(bindings),
            action: self.action.clone(),
            resource: self.resource.link(bindings),
            conditions: self
                .conditions
                .iter()
                .map(|c| Clause {
                    kind: c.kind,
                    body: c.body.substitute_slots(&bind),
                })
                .collect(),
            annotations: self.annotations.clone(),
        })
    }

    pub fn to_json_value(&self) -> serde_json::Value {
        crate::tree::policy_to_json(self)
    }

    /// Decode the JSON tree form; `annotations.id` takes precedence over `id`.
    pub fn from_json_value(json: &serde_json::Value, id: Option<PolicyId>) -> Result<Self, PolicyError> {
        let default = id.unwrap_or_else(|| PolicyId::default_for_position(0));
        crate::tree::policy_from_json(json, default, "$")
    }

    pub fn to_pretty_string(&self, config: &FormatConfig) -> String {
        crate::format::policy_to_pretty(self, 0, config)
    }
}

impl Display for Policy {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let text = self.to_pretty_string(&FormatConfig::default());
        f.write_str(text.trim_end_matches('\n'))
    }
}
