//! Declared entity and action types, and validation against them.
//!
//! A schema is built from either the JSON layout (`Schema::from_json_str`)
//! or the human-readable text form (`str::parse`). Both front ends produce a
//! [`Fragment`] of per-namespace declarations with names as written; building
//! the [`Schema`] qualifies every name and rejects references to anything
//! that was never declared.

mod json;
mod text;
mod typecheck;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use itertools::Itertools;
use tracing::debug;

use crate::error::{PolicyError, RequestValidationError};
use crate::policy_set::PolicySet;
use crate::types::{Entity, EntityUid, Request, Value};

pub use typecheck::{ValidationError, ValidationResult, ValidationWarning, ValidationWarningKind};

/// The type of an attribute or context value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SchemaType {
    Bool,
    Long,
    String,
    /// An entity of the named (fully qualified) type.
    Entity(String),
    Set(Box<SchemaType>),
    Record(BTreeMap<String, Attribute>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Attribute {
    pub ty: SchemaType,
    pub required: bool,
}

impl Attribute {
    pub fn required(ty: SchemaType) -> Self {
        Self { ty, required: true }
    }

    pub fn optional(ty: SchemaType) -> Self {
        Self {
            ty,
            required: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityTypeDecl {
    /// Types an entity of this type may list as parents.
    pub member_of: BTreeSet<String>,
    pub attributes: BTreeMap<String, Attribute>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionDecl {
    /// Action groups this action belongs to.
    pub member_of: BTreeSet<EntityUid>,
    pub principal_types: BTreeSet<String>,
    pub resource_types: BTreeSet<String>,
    pub context: BTreeMap<String, Attribute>,
}

/// Declarations of one namespace, with references still unqualified.
#[derive(Debug, Clone, Default)]
pub(crate) struct NamespaceDef {
    pub(crate) name: String,
    pub(crate) entity_types: Vec<(String, EntityTypeDecl)>,
    pub(crate) actions: Vec<(String, ActionDecl)>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Fragment {
    pub(crate) namespaces: Vec<NamespaceDef>,
}

/// A validated set of entity type and action declarations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    entity_types: BTreeMap<String, EntityTypeDecl>,
    actions: BTreeMap<EntityUid, ActionDecl>,
    action_ancestors: BTreeMap<EntityUid, BTreeSet<EntityUid>>,
}

impl Schema {
    pub fn from_json_str(text: &str) -> Result<Self, PolicyError> {
        let json: serde_json::Value = serde_json::from_str(text)?;
        Self::from_json_value(&json)
    }

    pub fn from_json_value(json: &serde_json::Value) -> Result<Self, PolicyError> {
        Self::from_fragment(json::fragment_from_json(json)?)
    }

    pub fn to_json_value(&self) -> serde_json::Value {
        json::schema_to_json(self)
    }

    pub fn entity_types(&self) -> &BTreeMap<String, EntityTypeDecl> {
        &self.entity_types
    }

    pub fn entity_type(&self, name: &str) -> Option<&EntityTypeDecl> {
        self.entity_types.get(name)
    }

    pub fn actions(&self) -> &BTreeMap<EntityUid, ActionDecl> {
        &self.actions
    }

    pub fn action(&self, uid: &EntityUid) -> Option<&ActionDecl> {
        self.actions.get(uid)
    }

    /// True when `action` equals `group` or belongs to it transitively.
    pub fn action_in_group(&self, action: &EntityUid, group: &EntityUid) -> bool {
        action == group
            || self
                .action_ancestors
                .get(action)
                .is_some_and(|ancestors| ancestors.contains(group))
    }

    /// True when an entity of type `descendant` can sit below `ancestor` in
    /// the hierarchy, including the case where the two are the same type.
    pub fn type_can_be_in(&self, descendant: &str, ancestor: &str) -> bool {
        if descendant == ancestor {
            return true;
        }
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([descendant]);
        while let Some(current) = queue.pop_front() {
            let Some(decl) = self.entity_types.get(current) else {
                continue;
            };
            for parent in &decl.member_of {
                if parent == ancestor {
                    return true;
                }
                if visited.insert(parent.as_str()) {
                    queue.push_back(parent);
                }
            }
        }
        false
    }

    /// Check a request against the declared shape of its action.
    pub fn validate_request(&self, request: &Request) -> Result<(), RequestValidationError> {
        let action = &request.action;
        let decl = self
            .actions
            .get(action)
            .ok_or_else(|| RequestValidationError::UnknownAction(action.clone()))?;

        let principal_type = request.principal.entity_type();
        self.ensure_declared(principal_type)?;
        if !decl.principal_types.contains(principal_type) {
            return Err(RequestValidationError::PrincipalNotApplicable {
                action: action.clone(),
                principal_type: principal_type.to_string(),
            });
        }

        let resource_type = request.resource.entity_type();
        self.ensure_declared(resource_type)?;
        if !decl.resource_types.contains(resource_type) {
            return Err(RequestValidationError::ResourceNotApplicable {
                action: action.clone(),
                resource_type: resource_type.to_string(),
            });
        }

        for (name, attribute) in &decl.context {
            match request.context.get(name) {
                None if attribute.required => {
                    return Err(RequestValidationError::MissingContextAttribute {
                        action: action.clone(),
                        attribute: name.clone(),
                    });
                }
                None => {}
                Some(value) => {
                    if let Err(mismatch) = conform(&attribute.ty, value, name) {
                        return Err(RequestValidationError::ContextTypeMismatch {
                            action: action.clone(),
                            attribute: mismatch.path,
                            expected: mismatch.expected,
                            found: mismatch.found,
                        });
                    }
                }
            }
        }
        if let Some((name, _)) = request
            .context
            .iter()
            .find(|(name, _)| !decl.context.contains_key(name.as_str()))
        {
            return Err(RequestValidationError::UnexpectedContextAttribute {
                action: action.clone(),
                attribute: name.clone(),
            });
        }
        Ok(())
    }

    fn ensure_declared(&self, entity_type: &str) -> Result<(), RequestValidationError> {
        if self.entity_types.contains_key(entity_type) {
            Ok(())
        } else {
            Err(RequestValidationError::UndeclaredEntityType(
                entity_type.to_string(),
            ))
        }
    }

    /// Check one entity record: declared type, attribute shape and parent types.
    ///
    /// Declared actions may appear in the entity store as plain records.
    pub fn validate_entity(&self, entity: &Entity) -> Result<(), PolicyError> {
        let uid = entity.uid();
        if self.actions.contains_key(uid) {
            return Ok(());
        }
        let decl = self.entity_types.get(uid.entity_type()).ok_or_else(|| {
            PolicyError::EntityValidation(format!(
                "{uid} has undeclared entity type `{}`",
                uid.entity_type()
            ))
        })?;

        for (name, attribute) in &decl.attributes {
            match entity.attr(name) {
                None if attribute.required => {
                    return Err(PolicyError::EntityValidation(format!(
                        "{uid} is missing required attribute `{name}`"
                    )));
                }
                None => {}
                Some(value) => conform(&attribute.ty, value, name).map_err(|m| {
                    PolicyError::EntityValidation(format!(
                        "{uid} attribute `{}`: expected {}, found {}",
                        m.path, m.expected, m.found
                    ))
                })?,
            }
        }
        if let Some(name) = entity
            .attrs()
            .keys()
            .find(|name| !decl.attributes.contains_key(name.as_str()))
        {
            return Err(PolicyError::EntityValidation(format!(
                "{uid} has undeclared attribute `{name}`"
            )));
        }
        if let Some(parent) = entity
            .parents()
            .iter()
            .find(|parent| !decl.member_of.contains(parent.entity_type()))
        {
            return Err(PolicyError::EntityValidation(format!(
                "{uid} cannot have parent {parent}: `{}` is not a member of `{}`",
                uid.entity_type(),
                parent.entity_type()
            )));
        }
        Ok(())
    }

    /// Best-effort type check of every static policy, template and link.
    pub fn validate_policies(&self, policies: &PolicySet) -> ValidationResult {
        typecheck::validate_policy_set(self, policies)
    }

    /// Qualify names, check that every reference resolves and build the
    /// action hierarchy.
    pub(crate) fn from_fragment(fragment: Fragment) -> Result<Self, PolicyError> {
        let mut declared_types = BTreeSet::new();
        let mut declared_actions = BTreeSet::new();
        for ns in &fragment.namespaces {
            for (name, _) in &ns.entity_types {
                let qualified = qualify(&ns.name, name);
                if !declared_types.insert(qualified.clone()) {
                    return Err(PolicyError::mismatch(
                        qualified,
                        "entity type is declared more than once",
                    ));
                }
            }
            for (name, _) in &ns.actions {
                let uid = action_uid(&ns.name, name);
                if !declared_actions.insert(uid.clone()) {
                    return Err(PolicyError::mismatch(
                        uid.to_string(),
                        "action is declared more than once",
                    ));
                }
            }
        }

        let resolver = Resolver {
            types: &declared_types,
            actions: &declared_actions,
        };
        let mut schema = Schema::default();
        for ns in fragment.namespaces {
            for (name, decl) in ns.entity_types {
                let qualified = qualify(&ns.name, &name);
                let decl = resolver.entity_type(&ns.name, &qualified, decl)?;
                schema.entity_types.insert(qualified, decl);
            }
            for (name, decl) in ns.actions {
                let uid = action_uid(&ns.name, &name);
                let decl = resolver.action(&ns.name, &uid, decl)?;
                schema.actions.insert(uid, decl);
            }
        }
        schema.action_ancestors = action_closure(&schema.actions);

        debug!(
            event = "Schema",
            phase = "Build",
            entity_types = schema.entity_types.len(),
            actions = schema.actions.len()
        );
        Ok(schema)
    }

    /// Namespaces in declaration-name order, each with its entity types and
    /// actions, for the printers.
    pub(crate) fn namespaces(&self) -> BTreeMap<String, NamespaceView<'_>> {
        let mut out: BTreeMap<String, NamespaceView<'_>> = BTreeMap::new();
        for (name, decl) in &self.entity_types {
            let (ns, base) = split_name(name);
            out.entry(ns.to_string())
                .or_default()
                .entity_types
                .push((base, decl));
        }
        for (uid, decl) in &self.actions {
            let (ns, _) = split_name(uid.entity_type());
            out.entry(ns.to_string())
                .or_default()
                .actions
                .push((uid.id(), decl));
        }
        out
    }
}

#[derive(Default)]
pub(crate) struct NamespaceView<'a> {
    pub(crate) entity_types: Vec<(&'a str, &'a EntityTypeDecl)>,
    pub(crate) actions: Vec<(&'a str, &'a ActionDecl)>,
}

impl FromStr for Schema {
    type Err = PolicyError;

    /// Parse the human-readable schema text.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_fragment(text::parse_fragment(s)?)
    }
}

/// Human-readable text form.
impl Display for Schema {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&text::schema_to_text(self))
    }
}

impl Display for SchemaType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            SchemaType::Bool => write!(f, "Bool"),
            SchemaType::Long => write!(f, "Long"),
            SchemaType::String => write!(f, "String"),
            SchemaType::Entity(name) => write!(f, "{name}"),
            SchemaType::Set(element) => write!(f, "Set<{element}>"),
            SchemaType::Record(attributes) => write!(
                f,
                "{{{}}}",
                attributes
                    .iter()
                    .map(|(name, attr)| format!(
                        "{name}{}: {}",
                        if attr.required { "" } else { "?" },
                        attr.ty
                    ))
                    .join(", ")
            ),
        }
    }
}

pub(crate) fn qualify(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}::{name}")
    }
}

pub(crate) fn action_uid(namespace: &str, name: &str) -> EntityUid {
    EntityUid::new_unchecked(qualify(namespace, "Action"), name)
}

/// `NS::Sub::User` → (`NS::Sub`, `User`).
pub(crate) fn split_name(name: &str) -> (&str, &str) {
    match name.rfind("::") {
        Some(idx) => (&name[..idx], &name[idx + 2..]),
        None => ("", name),
    }
}

/// Write `name` relative to `namespace` when it lives there.
pub(crate) fn relative_name<'a>(namespace: &str, name: &'a str) -> &'a str {
    let (ns, base) = split_name(name);
    if ns == namespace { base } else { name }
}

struct Resolver<'a> {
    types: &'a BTreeSet<String>,
    actions: &'a BTreeSet<EntityUid>,
}

impl Resolver<'_> {
    /// An unqualified name prefers the enclosing namespace, then the global one.
    fn type_name(&self, namespace: &str, name: &str, path: &str) -> Result<String, PolicyError> {
        let local = qualify(namespace, name);
        if !name.contains("::") && self.types.contains(&local) {
            return Ok(local);
        }
        if self.types.contains(name) {
            return Ok(name.to_string());
        }
        Err(PolicyError::mismatch(
            path,
            format!("undeclared entity type `{name}`"),
        ))
    }

    fn type_names(
        &self,
        namespace: &str,
        names: BTreeSet<String>,
        path: &str,
    ) -> Result<BTreeSet<String>, PolicyError> {
        names
            .iter()
            .map(|name| self.type_name(namespace, name, path))
            .collect()
    }

    fn schema_type(
        &self,
        namespace: &str,
        ty: SchemaType,
        path: &str,
    ) -> Result<SchemaType, PolicyError> {
        Ok(match ty {
            SchemaType::Entity(name) => SchemaType::Entity(self.type_name(namespace, &name, path)?),
            SchemaType::Set(element) => {
                SchemaType::Set(Box::new(self.schema_type(namespace, *element, path)?))
            }
            SchemaType::Record(attributes) => {
                SchemaType::Record(self.attributes(namespace, attributes, path)?)
            }
            other => other,
        })
    }

    fn attributes(
        &self,
        namespace: &str,
        attributes: BTreeMap<String, Attribute>,
        path: &str,
    ) -> Result<BTreeMap<String, Attribute>, PolicyError> {
        attributes
            .into_iter()
            .map(|(name, attr)| {
                let ty = self.schema_type(namespace, attr.ty, &format!("{path}.{name}"))?;
                Ok((
                    name,
                    Attribute {
                        ty,
                        required: attr.required,
                    },
                ))
            })
            .collect()
    }

    fn entity_type(
        &self,
        namespace: &str,
        name: &str,
        decl: EntityTypeDecl,
    ) -> Result<EntityTypeDecl, PolicyError> {
        Ok(EntityTypeDecl {
            member_of: self.type_names(namespace, decl.member_of, &format!("{name}.memberOfTypes"))?,
            attributes: self.attributes(namespace, decl.attributes, &format!("{name}.shape"))?,
        })
    }

    fn action(
        &self,
        namespace: &str,
        uid: &EntityUid,
        decl: ActionDecl,
    ) -> Result<ActionDecl, PolicyError> {
        let member_of = decl
            .member_of
            .into_iter()
            .map(|group| {
                let resolved = match group.entity_type() {
                    "Action" => action_uid(namespace, group.id()),
                    _ => group,
                };
                if self.actions.contains(&resolved) {
                    Ok(resolved)
                } else {
                    Err(PolicyError::mismatch(
                        format!("{uid}.memberOf"),
                        format!("undeclared action group {resolved}"),
                    ))
                }
            })
            .collect::<Result<_, _>>()?;

        Ok(ActionDecl {
            member_of,
            principal_types: self.type_names(
                namespace,
                decl.principal_types,
                &format!("{uid}.appliesTo.principalTypes"),
            )?,
            resource_types: self.type_names(
                namespace,
                decl.resource_types,
                &format!("{uid}.appliesTo.resourceTypes"),
            )?,
            context: self.attributes(namespace, decl.context, &format!("{uid}.appliesTo.context"))?,
        })
    }
}

fn action_closure(
    actions: &BTreeMap<EntityUid, ActionDecl>,
) -> BTreeMap<EntityUid, BTreeSet<EntityUid>> {
    actions
        .iter()
        .map(|(uid, decl)| {
            let mut visited = BTreeSet::new();
            let mut queue: VecDeque<&EntityUid> = decl.member_of.iter().collect();
            while let Some(group) = queue.pop_front() {
                if !visited.insert(group.clone()) {
                    continue;
                }
                if let Some(parent) = actions.get(group) {
                    queue.extend(parent.member_of.iter());
                }
            }
            (uid.clone(), visited)
        })
        .collect()
}

struct Mismatch {
    path: String,
    expected: String,
    found: String,
}

/// Check that `value` has the shape of `ty`. `path` names the value in errors.
fn conform(ty: &SchemaType, value: &Value, path: &str) -> Result<(), Mismatch> {
    let mismatch = || Mismatch {
        path: path.to_string(),
        expected: ty.to_string(),
        found: value.type_name().to_string(),
    };
    match (ty, value) {
        (SchemaType::Bool, Value::Bool(_))
        | (SchemaType::Long, Value::Long(_))
        | (SchemaType::String, Value::String(_)) => Ok(()),
        (SchemaType::Entity(name), Value::Entity(uid)) => {
            if uid.entity_type() == name {
                Ok(())
            } else {
                Err(Mismatch {
                    path: path.to_string(),
                    expected: name.clone(),
                    found: uid.entity_type().to_string(),
                })
            }
        }
        (SchemaType::Set(element), Value::Set(items)) => items
            .iter()
            .try_for_each(|item| conform(element, item, &format!("{path}[]"))),
        (SchemaType::Record(attributes), Value::Record(fields)) => {
            for (name, attr) in attributes {
                match fields.get(name) {
                    Some(field) => conform(&attr.ty, field, &format!("{path}.{name}"))?,
                    None if attr.required => return Err(mismatch()),
                    None => {}
                }
            }
            if fields.keys().any(|name| !attributes.contains_key(name)) {
                return Err(mismatch());
            }
            Ok(())
        }
        _ => Err(mismatch()),
    }
}
