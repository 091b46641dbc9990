//! The JSON schema layout.
//!
//! ```json
//! {"App": {
//!     "entityTypes": {"User": {"memberOfTypes": ["Group"], "shape": {...}}},
//!     "actions": {"view": {"memberOf": [{"id": "read"}],
//!                          "appliesTo": {"principalTypes": [...], "resourceTypes": [...],
//!                                        "context": {...}}}}
//! }}
//! ```
//!
//! The empty key is the global namespace. Shapes use `{"type": "Record",
//! "attributes": {...}}` with `"required"` defaulting to true.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::error::PolicyError;
use crate::types::EntityUid;

use super::{
    ActionDecl, Attribute, EntityTypeDecl, Fragment, NamespaceDef, Schema, SchemaType,
    relative_name,
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct JsonNamespace {
    #[serde(default)]
    entity_types: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    actions: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct JsonEntityType {
    #[serde(default)]
    member_of_types: Vec<String>,
    #[serde(default)]
    shape: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct JsonAction {
    #[serde(default)]
    member_of: Vec<JsonActionRef>,
    #[serde(default)]
    applies_to: Option<JsonAppliesTo>,
}

#[derive(Debug, Deserialize)]
struct JsonActionRef {
    id: String,
    #[serde(rename = "type", default)]
    entity_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct JsonAppliesTo {
    #[serde(default)]
    principal_types: Vec<String>,
    #[serde(default)]
    resource_types: Vec<String>,
    #[serde(default)]
    context: Option<serde_json::Value>,
}

/// Decode a section with serde, reporting failures against `path`.
fn decode<T: DeserializeOwned>(
    json: &serde_json::Value,
    path: &str,
) -> Result<T, PolicyError> {
    T::deserialize(json).map_err(|e| PolicyError::mismatch(path, e.to_string()))
}

pub(crate) fn fragment_from_json(json: &serde_json::Value) -> Result<Fragment, PolicyError> {
    let root = json
        .as_object()
        .ok_or_else(|| PolicyError::mismatch("$", "expected an object of namespaces"))?;

    let mut fragment = Fragment::default();
    for (ns_name, ns_json) in root {
        let ns_path = format!("$.{ns_name}");
        let raw: JsonNamespace = decode(ns_json, &ns_path)?;
        let mut ns = NamespaceDef {
            name: ns_name.clone(),
            ..NamespaceDef::default()
        };

        for (name, entity_json) in &raw.entity_types {
            let path = format!("{ns_path}.entityTypes.{name}");
            let entity: JsonEntityType = decode(entity_json, &path)?;
            let attributes = match &entity.shape {
                Some(shape) => record_attributes(shape, &format!("{path}.shape"))?,
                None => BTreeMap::new(),
            };
            ns.entity_types.push((
                name.clone(),
                EntityTypeDecl {
                    member_of: entity.member_of_types.into_iter().collect(),
                    attributes,
                },
            ));
        }

        for (name, action_json) in &raw.actions {
            let path = format!("{ns_path}.actions.{name}");
            let action: JsonAction = decode(action_json, &path)?;
            let member_of = action
                .member_of
                .into_iter()
                .map(|group| {
                    let entity_type = group.entity_type.unwrap_or_else(|| "Action".to_string());
                    EntityUid::from_type_name_and_id(&entity_type, &group.id)
                        .map_err(|e| PolicyError::mismatch(format!("{path}.memberOf"), e.to_string()))
                })
                .collect::<Result<BTreeSet<_>, _>>()?;
            let applies_to = action.applies_to.unwrap_or_default();
            let context = match &applies_to.context {
                Some(context) => {
                    record_attributes(context, &format!("{path}.appliesTo.context"))?
                }
                None => BTreeMap::new(),
            };
            ns.actions.push((
                name.clone(),
                ActionDecl {
                    member_of,
                    principal_types: applies_to.principal_types.into_iter().collect(),
                    resource_types: applies_to.resource_types.into_iter().collect(),
                    context,
                },
            ));
        }
        fragment.namespaces.push(ns);
    }
    Ok(fragment)
}

fn record_attributes(
    json: &serde_json::Value,
    path: &str,
) -> Result<BTreeMap<String, Attribute>, PolicyError> {
    match schema_type(json, path)? {
        SchemaType::Record(attributes) => Ok(attributes),
        other => Err(PolicyError::mismatch(
            path,
            format!("expected a Record type, found {other}"),
        )),
    }
}

fn schema_type(json: &serde_json::Value, path: &str) -> Result<SchemaType, PolicyError> {
    let obj = json
        .as_object()
        .ok_or_else(|| PolicyError::mismatch(path, "expected a type object"))?;
    let kind = obj
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| PolicyError::mismatch(path, "missing `type`"))?;

    let name = || {
        obj.get("name")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PolicyError::mismatch(path, format!("`{kind}` type needs a `name`")))
    };

    Ok(match kind {
        "Boolean" | "Bool" => SchemaType::Bool,
        "Long" => SchemaType::Long,
        "String" => SchemaType::String,
        "Entity" | "EntityOrCommon" => SchemaType::Entity(name()?),
        "Set" => {
            let element = obj
                .get("element")
                .ok_or_else(|| PolicyError::mismatch(path, "`Set` type needs an `element`"))?;
            SchemaType::Set(Box::new(schema_type(element, &format!("{path}.element"))?))
        }
        "Record" => {
            let attributes = match obj.get("attributes") {
                None => BTreeMap::new(),
                Some(serde_json::Value::Object(map)) => map
                    .iter()
                    .map(|(attr, attr_json)| {
                        let attr_path = format!("{path}.attributes.{attr}");
                        let ty = schema_type(attr_json, &attr_path)?;
                        let required = match attr_json.get("required") {
                            None => true,
                            Some(serde_json::Value::Bool(b)) => *b,
                            Some(_) => {
                                return Err(PolicyError::mismatch(
                                    format!("{attr_path}.required"),
                                    "expected a boolean",
                                ));
                            }
                        };
                        Ok((attr.clone(), Attribute { ty, required }))
                    })
                    .collect::<Result<_, PolicyError>>()?,
                Some(_) => {
                    return Err(PolicyError::mismatch(
                        format!("{path}.attributes"),
                        "expected an object",
                    ));
                }
            };
            SchemaType::Record(attributes)
        }
        // Bare entity type names are accepted in place of `{"type": "Entity", ...}`.
        other => SchemaType::Entity(other.to_string()),
    })
}

pub(crate) fn schema_to_json(schema: &Schema) -> serde_json::Value {
    let mut root = serde_json::Map::new();
    for (ns, view) in schema.namespaces() {
        let entity_types = view
            .entity_types
            .iter()
            .map(|(name, decl)| {
                let mut entry = serde_json::Map::new();
                entry.insert(
                    "memberOfTypes".into(),
                    json!(
                        decl.member_of
                            .iter()
                            .map(|t| relative_name(&ns, t))
                            .collect::<Vec<_>>()
                    ),
                );
                if !decl.attributes.is_empty() {
                    entry.insert("shape".into(), record_to_json(&ns, &decl.attributes));
                }
                (name.to_string(), serde_json::Value::Object(entry))
            })
            .collect();
        let actions = view
            .actions
            .iter()
            .map(|(name, decl)| {
                let member_of: Vec<serde_json::Value> = decl
                    .member_of
                    .iter()
                    .map(|group| {
                        json!({"id": group.id(), "type": relative_name(&ns, group.entity_type())})
                    })
                    .collect();
                let names = |types: &BTreeSet<String>| -> Vec<String> {
                    types
                        .iter()
                        .map(|t| relative_name(&ns, t).to_string())
                        .collect()
                };
                let action = json!({
                    "memberOf": member_of,
                    "appliesTo": {
                        "principalTypes": names(&decl.principal_types),
                        "resourceTypes": names(&decl.resource_types),
                        "context": record_to_json(&ns, &decl.context),
                    },
                });
                (name.to_string(), action)
            })
            .collect();
        root.insert(
            ns,
            json!({"entityTypes": serde_json::Value::Object(entity_types),
                   "actions": serde_json::Value::Object(actions)}),
        );
    }
    serde_json::Value::Object(root)
}

fn record_to_json(ns: &str, attributes: &BTreeMap<String, Attribute>) -> serde_json::Value {
    let attributes: serde_json::Map<String, serde_json::Value> = attributes
        .iter()
        .map(|(name, attr)| {
            let mut ty = type_to_json(ns, &attr.ty);
            if let serde_json::Value::Object(obj) = &mut ty {
                obj.insert("required".into(), json!(attr.required));
            }
            (name.clone(), ty)
        })
        .collect();
    json!({"type": "Record", "attributes": attributes})
}

fn type_to_json(ns: &str, ty: &SchemaType) -> serde_json::Value {
    match ty {
        SchemaType::Bool => json!({"type": "Boolean"}),
        SchemaType::Long => json!({"type": "Long"}),
        SchemaType::String => json!({"type": "String"}),
        SchemaType::Entity(name) => json!({"type": "Entity", "name": relative_name(ns, name)}),
        SchemaType::Set(element) => json!({"type": "Set", "element": type_to_json(ns, element)}),
        SchemaType::Record(attributes) => record_to_json(ns, attributes),
    }
}
