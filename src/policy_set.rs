//! Ordered collections of policies, templates and template links.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use crate::ast::{Policy, SlotId};
use crate::config::FormatConfig;
use crate::error::PolicyError;
use crate::types::{EntityUid, PolicyId};

/// A template instantiated with concrete uids for its slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateLink {
    template_id: PolicyId,
    new_id: PolicyId,
    values: BTreeMap<SlotId, EntityUid>,
}

impl TemplateLink {
    pub fn template_id(&self) -> &PolicyId {
        &self.template_id
    }

    pub fn new_id(&self) -> &PolicyId {
        &self.new_id
    }

    pub fn values(&self) -> &BTreeMap<SlotId, EntityUid> {
        &self.values
    }
}

/// Static policies, templates and links, each kept in insertion order.
///
/// Ids are unique across all three collections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySet {
    policies: Vec<Policy>,
    templates: Vec<Policy>,
    links: Vec<TemplateLink>,
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_policies(policies: impl IntoIterator<Item = Policy>) -> Result<Self, PolicyError> {
        let mut set = Self::new();
        for policy in policies {
            set.add(policy)?;
        }
        Ok(set)
    }

    /// Add a static policy, or a template if it uses slots.
    pub fn add(&mut self, policy: Policy) -> Result<(), PolicyError> {
        self.ensure_unused(policy.id())?;
        if policy.is_template() {
            self.templates.push(policy);
        } else {
            self.policies.push(policy);
        }
        Ok(())
    }

    /// Link `template_id` under `new_id`. Every slot must be bound.
    pub fn link(
        &mut self,
        template_id: &PolicyId,
        new_id: PolicyId,
        values: BTreeMap<SlotId, EntityUid>,
    ) -> Result<(), PolicyError> {
        let template = self.template(template_id).ok_or_else(|| {
            PolicyError::TemplateLink(format!("no template with id `{template_id}`"))
        })?;
        // Materialize once up front so a bad link fails here rather than at authorization.
        template.link(new_id.clone(), &values)?;
        self.ensure_unused(&new_id)?;
        self.links.push(TemplateLink {
            template_id: template_id.clone(),
            new_id,
            values,
        });
        Ok(())
    }

    fn ensure_unused(&self, id: &PolicyId) -> Result<(), PolicyError> {
        if self.contains_id(id) {
            return Err(PolicyError::DuplicateId(id.to_string()));
        }
        Ok(())
    }

    pub fn contains_id(&self, id: &PolicyId) -> bool {
        self.policy(id).is_some()
            || self.template(id).is_some()
            || self.links.iter().any(|l| &l.new_id == id)
    }

    pub fn policy(&self, id: &PolicyId) -> Option<&Policy> {
        self.policies.iter().find(|p| p.id() == id)
    }

    pub fn template(&self, id: &PolicyId) -> Option<&Policy> {
        self.templates.iter().find(|p| p.id() == id)
    }

    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    pub fn templates(&self) -> &[Policy] {
        &self.templates
    }

    pub fn links(&self) -> &[TemplateLink] {
        &self.links
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty() && self.templates.is_empty() && self.links.is_empty()
    }

    /// Static policies followed by every materialized link.
    pub fn effective_policies(&self) -> Result<Vec<Policy>, PolicyError> {
        let mut out = self.policies.clone();
        for link in &self.links {
            let template = self.template(&link.template_id).ok_or_else(|| {
                PolicyError::TemplateLink(format!(
                    "link `{}` refers to missing template `{}`",
                    link.new_id, link.template_id
                ))
            })?;
            out.push(template.link(link.new_id.clone(), &link.values)?);
        }
        Ok(out)
    }

    pub fn to_pretty_string(&self, config: &FormatConfig) -> String {
        crate::format::policy_set_to_pretty(self, config)
    }

    pub fn to_json_value(&self) -> serde_json::Value {
        crate::tree::policy_set_to_json(self)
    }

    pub fn to_json_string(&self) -> Result<String, PolicyError> {
        Ok(serde_json::to_string(&self.to_json_value())?)
    }

    pub fn from_json_value(json: &serde_json::Value) -> Result<Self, PolicyError> {
        crate::tree::policy_set_from_json(json)
    }

    pub fn from_json_str(text: &str) -> Result<Self, PolicyError> {
        let json: serde_json::Value = serde_json::from_str(text)?;
        Self::from_json_value(&json)
    }
}

impl FromStr for PolicySet {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        crate::parser::parse_policy_set(s)
    }
}

/// Canonical text form. Template links have no text syntax and are omitted.
impl Display for PolicySet {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.to_pretty_string(&FormatConfig::default()))
    }
}
