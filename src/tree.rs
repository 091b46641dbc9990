//! The structured JSON tree form of policies.
//!
//! Every decode error is a `SchemaMismatch` carrying a JSON path such as
//! `$.staticPolicies.policy0.conditions[0].body.==.left`.

use std::collections::BTreeMap;

use serde_json::{Map, Value as Json, json};

use crate::ast::{
    BinaryOp, Clause, ClauseKind, Effect, EntityReference, Expr, Literal, Pattern, PatternElem,
    Policy, ScopeConstraint, SlotId, UnaryOp, Var,
};
use crate::config::DEFAULT_MAX_EXPRESSION_DEPTH;
use crate::error::PolicyError;
use crate::parser::lexer::is_ident;
use crate::policy_set::PolicySet;
use crate::types::{ENTITY_ESCAPE, EntityUid, PolicyId, is_type_name};

// ---------------------------------------------------------------- encoding

pub(crate) fn policy_set_to_json(set: &PolicySet) -> Json {
    let encode_all = |policies: &[Policy]| -> Json {
        Json::Object(
            policies
                .iter()
                .map(|p| (p.id().to_string(), policy_to_json(p)))
                .collect(),
        )
    };
    let links: Vec<Json> = set
        .links()
        .iter()
        .map(|link| {
            let values: Map<String, Json> = link
                .values()
                .iter()
                .map(|(slot, uid)| (slot.to_string(), uid.to_json_value()))
                .collect();
            json!({
                "templateId": link.template_id().as_str(),
                "newId": link.new_id().as_str(),
                "values": values,
            })
        })
        .collect();

    json!({
        "templates": encode_all(set.templates()),
        "staticPolicies": encode_all(set.policies()),
        "templateLinks": links,
    })
}

pub(crate) fn policy_to_json(policy: &Policy) -> Json {
    let mut obj = Map::new();
    obj.insert("effect".into(), Json::from(policy.effect().to_string()));
    obj.insert("principal".into(), scope_to_json(policy.principal()));
    obj.insert("action".into(), scope_to_json(policy.action()));
    obj.insert("resource".into(), scope_to_json(policy.resource()));
    obj.insert(
        "conditions".into(),
        Json::Array(
            policy
                .conditions()
                .iter()
                .map(|c| json!({"kind": c.kind.to_string(), "body": expr_to_json(&c.body)}))
                .collect(),
        ),
    );
    if !policy.annotations().is_empty() {
        obj.insert("annotations".into(), json!(policy.annotations()));
    }
    Json::Object(obj)
}

fn reference_to_json(reference: &EntityReference) -> (&'static str, Json) {
    match reference {
        EntityReference::Uid(uid) => ("entity", uid.to_json_value()),
        EntityReference::Slot(slot) => ("slot", Json::from(slot.to_string())),
    }
}

fn scope_to_json(scope: &ScopeConstraint) -> Json {
    match scope {
        ScopeConstraint::All => json!({"op": "All"}),
        ScopeConstraint::Eq(r) => {
            let (key, value) = reference_to_json(r);
            json!({"op": "==", key: value})
        }
        ScopeConstraint::In(r) => {
            let (key, value) = reference_to_json(r);
            json!({"op": "in", key: value})
        }
        ScopeConstraint::InList(uids) => json!({
            "op": "in",
            "entities": uids.iter().map(EntityUid::to_json_value).collect::<Vec<_>>(),
        }),
        ScopeConstraint::Is(entity_type) => json!({"op": "is", "entity_type": entity_type}),
        ScopeConstraint::IsIn(entity_type, r) => {
            let (key, value) = reference_to_json(r);
            json!({"op": "is", "entity_type": entity_type, "in": {key: value}})
        }
    }
}

fn literal_to_json(lit: &Literal) -> Json {
    match lit {
        Literal::Bool(b) => Json::Bool(*b),
        Literal::Long(n) => Json::from(*n),
        Literal::String(s) => Json::from(s.as_str()),
        Literal::EntityUid(uid) => json!({ ENTITY_ESCAPE: uid.to_json_value() }),
    }
}

pub(crate) fn expr_to_json(expr: &Expr) -> Json {
    let node = |key: &str, body: Json| {
        let mut obj = Map::new();
        obj.insert(key.to_string(), body);
        Json::Object(obj)
    };
    let pair = |l: &Expr, r: &Expr| json!({"left": expr_to_json(l), "right": expr_to_json(r)});

    match expr {
        Expr::Lit(lit) => node("Value", literal_to_json(lit)),
        Expr::Var(var) => node("Var", Json::from(var.to_string())),
        Expr::Slot(slot) => node("Slot", Json::from(slot.to_string())),
        Expr::Unary { op, arg } => {
            let key = match op {
                UnaryOp::Not => "!",
                UnaryOp::Neg => "neg",
                UnaryOp::IsEmpty => "isEmpty",
            };
            node(key, json!({"arg": expr_to_json(arg)}))
        }
        Expr::Binary { op, left, right } => node(op.symbol(), pair(left, right)),
        Expr::And(l, r) => node("&&", pair(l, r)),
        Expr::Or(l, r) => node("||", pair(l, r)),
        Expr::If {
            cond,
            then_expr,
            else_expr,
        } => node(
            "if-then-else",
            json!({
                "if": expr_to_json(cond),
                "then": expr_to_json(then_expr),
                "else": expr_to_json(else_expr),
            }),
        ),
        Expr::GetAttr { expr, attr } => node(".", json!({"left": expr_to_json(expr), "attr": attr})),
        Expr::HasAttr { expr, attr } => {
            node("has", json!({"left": expr_to_json(expr), "attr": attr}))
        }
        Expr::Like { expr, pattern } => {
            let elems: Vec<Json> = pattern
                .elems()
                .iter()
                .map(|e| match e {
                    PatternElem::Wildcard => Json::from("Wildcard"),
                    PatternElem::Char(c) => json!({"Literal": c.to_string()}),
                })
                .collect();
            node("like", json!({"left": expr_to_json(expr), "pattern": elems}))
        }
        Expr::Is {
            expr,
            entity_type,
            in_expr,
        } => {
            let mut body = Map::new();
            body.insert("left".into(), expr_to_json(expr));
            body.insert("entity_type".into(), Json::from(entity_type.as_str()));
            if let Some(in_expr) = in_expr {
                body.insert("in".into(), expr_to_json(in_expr));
            }
            node("is", Json::Object(body))
        }
        Expr::Set(items) => node("Set", Json::Array(items.iter().map(expr_to_json).collect())),
        Expr::Record(fields) => node(
            "Record",
            Json::Object(
                fields
                    .iter()
                    .map(|(k, e)| (k.clone(), expr_to_json(e)))
                    .collect(),
            ),
        ),
    }
}

// ---------------------------------------------------------------- decoding

fn object<'a>(json: &'a Json, path: &str) -> Result<&'a Map<String, Json>, PolicyError> {
    json.as_object()
        .ok_or_else(|| PolicyError::mismatch(path, "expected an object"))
}

fn field<'a>(obj: &'a Map<String, Json>, key: &str, path: &str) -> Result<&'a Json, PolicyError> {
    obj.get(key)
        .ok_or_else(|| PolicyError::mismatch(path, format!("missing `{key}`")))
}

fn string<'a>(json: &'a Json, path: &str) -> Result<&'a str, PolicyError> {
    json.as_str()
        .ok_or_else(|| PolicyError::mismatch(path, "expected a string"))
}

fn uid(json: &Json, path: &str) -> Result<EntityUid, PolicyError> {
    let obj = object(json, path)?;
    // Accept the escaped form too.
    let obj = match obj.get(ENTITY_ESCAPE) {
        Some(inner) => object(inner, &format!("{path}.{ENTITY_ESCAPE}"))?,
        None => obj,
    };
    let entity_type = string(field(obj, "type", path)?, &format!("{path}.type"))?;
    let id = string(field(obj, "id", path)?, &format!("{path}.id"))?;
    EntityUid::from_type_name_and_id(entity_type, id)
        .map_err(|e| PolicyError::mismatch(format!("{path}.type"), e.to_string()))
}

pub(crate) fn policy_set_from_json(json: &Json) -> Result<PolicySet, PolicyError> {
    let root = object(json, "$")?;
    let mut set = PolicySet::new();

    for key in ["staticPolicies", "templates"] {
        let Some(section) = root.get(key) else {
            continue;
        };
        let path = format!("$.{key}");
        for (id, body) in object(section, &path)? {
            let policy = policy_from_json(body, PolicyId::new(id.as_str()), &format!("{path}.{id}"))?;
            let is_template = policy.is_template();
            if key == "staticPolicies" && is_template {
                return Err(PolicyError::mismatch(
                    format!("{path}.{id}"),
                    "static policy contains template slots",
                ));
            }
            if key == "templates" && !is_template {
                return Err(PolicyError::mismatch(
                    format!("{path}.{id}"),
                    "template has no slots",
                ));
            }
            set.add(policy)?;
        }
    }

    if let Some(links) = root.get("templateLinks") {
        let items = links
            .as_array()
            .ok_or_else(|| PolicyError::mismatch("$.templateLinks", "expected an array"))?;
        for (idx, link) in items.iter().enumerate() {
            let path = format!("$.templateLinks[{idx}]");
            let obj = object(link, &path)?;
            let template_id = string(field(obj, "templateId", &path)?, &path)?;
            let new_id = string(field(obj, "newId", &path)?, &path)?;
            let values_path = format!("{path}.values");
            let mut values = BTreeMap::new();
            for (slot, value) in object(field(obj, "values", &path)?, &values_path)? {
                let slot_id: SlotId = slot.parse().map_err(|_| {
                    PolicyError::mismatch(&values_path, format!("unknown slot `{slot}`"))
                })?;
                values.insert(slot_id, uid(value, &format!("{values_path}.{slot}"))?);
            }
            set.link(&PolicyId::new(template_id), PolicyId::new(new_id), values)?;
        }
    }

    Ok(set)
}

pub(crate) fn policy_from_json(
    json: &Json,
    default_id: PolicyId,
    path: &str,
) -> Result<Policy, PolicyError> {
    let obj = object(json, path)?;

    let effect_path = format!("{path}.effect");
    let effect: Effect = string(field(obj, "effect", path)?, &effect_path)?
        .parse()
        .map_err(|_| PolicyError::mismatch(&effect_path, "expected `permit` or `forbid`"))?;

    let principal = scope_from_json(
        field(obj, "principal", path)?,
        Some(SlotId::Principal),
        &format!("{path}.principal"),
    )?;
    let action = scope_from_json(field(obj, "action", path)?, None, &format!("{path}.action"))?;
    let resource = scope_from_json(
        field(obj, "resource", path)?,
        Some(SlotId::Resource),
        &format!("{path}.resource"),
    )?;

    let conditions_path = format!("{path}.conditions");
    let conditions = match obj.get("conditions") {
        None => Vec::new(),
        Some(Json::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(idx, c)| clause_from_json(c, &format!("{conditions_path}[{idx}]")))
            .collect::<Result<_, _>>()?,
        Some(_) => return Err(PolicyError::mismatch(conditions_path, "expected an array")),
    };

    let mut annotations = BTreeMap::new();
    if let Some(raw) = obj.get("annotations") {
        let annotations_path = format!("{path}.annotations");
        for (key, value) in object(raw, &annotations_path)? {
            let key_path = format!("{annotations_path}.{key}");
            if !is_ident(key) {
                return Err(PolicyError::mismatch(
                    key_path,
                    "annotation key must be an identifier",
                ));
            }
            let value = string(value, &key_path)?;
            annotations.insert(key.clone(), value.to_string());
        }
    }

    let id = annotations
        .remove("id")
        .map(PolicyId::new)
        .unwrap_or(default_id);
    let mut policy = Policy::new(id, effect, principal, action, resource, conditions);
    for (key, value) in annotations {
        policy = policy.with_annotation(key, value);
    }
    Ok(policy)
}

fn clause_from_json(json: &Json, path: &str) -> Result<Clause, PolicyError> {
    let obj = object(json, path)?;
    let kind_path = format!("{path}.kind");
    let kind: ClauseKind = string(field(obj, "kind", path)?, &kind_path)?
        .parse()
        .map_err(|_| PolicyError::mismatch(&kind_path, "expected `when` or `unless`"))?;
    let body_path = format!("{path}.body");
    let body = expr_from_json(field(obj, "body", path)?, &body_path)?;
    if body.depth() > DEFAULT_MAX_EXPRESSION_DEPTH {
        return Err(PolicyError::mismatch(
            body_path,
            format!("expression nesting exceeds the limit of {DEFAULT_MAX_EXPRESSION_DEPTH}"),
        ));
    }
    Ok(Clause { kind, body })
}

fn reference_from_json(
    obj: &Map<String, Json>,
    slot: Option<SlotId>,
    path: &str,
) -> Result<EntityReference, PolicyError> {
    if let Some(entity) = obj.get("entity") {
        return Ok(EntityReference::Uid(uid(entity, &format!("{path}.entity"))?));
    }
    if let Some(raw) = obj.get("slot") {
        let slot_path = format!("{path}.slot");
        let found: SlotId = string(raw, &slot_path)?
            .parse()
            .map_err(|_| PolicyError::mismatch(&slot_path, "unknown slot"))?;
        return match slot {
            Some(expected) if expected == found => Ok(EntityReference::Slot(found)),
            _ => Err(PolicyError::mismatch(
                slot_path,
                format!("slot {found} is not allowed here"),
            )),
        };
    }
    Err(PolicyError::mismatch(path, "missing `entity` or `slot`"))
}

fn scope_from_json(
    json: &Json,
    slot: Option<SlotId>,
    path: &str,
) -> Result<ScopeConstraint, PolicyError> {
    let obj = object(json, path)?;
    let op_path = format!("{path}.op");
    match string(field(obj, "op", path)?, &op_path)? {
        "All" => Ok(ScopeConstraint::All),
        "==" => Ok(ScopeConstraint::Eq(reference_from_json(obj, slot, path)?)),
        "in" => match obj.get("entities") {
            Some(Json::Array(items)) if slot.is_none() => items
                .iter()
                .enumerate()
                .map(|(idx, e)| uid(e, &format!("{path}.entities[{idx}]")))
                .collect::<Result<Vec<_>, _>>()
                .map(ScopeConstraint::InList),
            Some(_) => Err(PolicyError::mismatch(
                format!("{path}.entities"),
                "entity lists are only allowed in the action scope",
            )),
            None => Ok(ScopeConstraint::In(reference_from_json(obj, slot, path)?)),
        },
        "is" if slot.is_some() => {
            let type_path = format!("{path}.entity_type");
            let entity_type = string(field(obj, "entity_type", path)?, &type_path)?;
            if !is_type_name(entity_type) {
                return Err(PolicyError::mismatch(type_path, "invalid entity type name"));
            }
            match obj.get("in") {
                None => Ok(ScopeConstraint::Is(entity_type.to_string())),
                Some(inner) => {
                    let in_path = format!("{path}.in");
                    let reference = reference_from_json(object(inner, &in_path)?, slot, &in_path)?;
                    Ok(ScopeConstraint::IsIn(entity_type.to_string(), reference))
                }
            }
        }
        other => Err(PolicyError::mismatch(
            op_path,
            format!("unknown scope operator `{other}`"),
        )),
    }
}

/// Literal payload of a `Value` node. Sets and records become literal nodes.
fn value_from_json(json: &Json, path: &str) -> Result<Expr, PolicyError> {
    match json {
        Json::Bool(b) => Ok(Expr::Lit(Literal::Bool(*b))),
        Json::Number(n) => n
            .as_i64()
            .map(|n| Expr::Lit(Literal::Long(n)))
            .ok_or_else(|| PolicyError::mismatch(path, "expected a 64-bit integer")),
        Json::String(s) => Ok(Expr::Lit(Literal::String(s.clone()))),
        Json::Array(items) => items
            .iter()
            .enumerate()
            .map(|(idx, item)| value_from_json(item, &format!("{path}[{idx}]")))
            .collect::<Result<Vec<_>, _>>()
            .map(Expr::Set),
        Json::Object(map) if map.contains_key(ENTITY_ESCAPE) => {
            Ok(Expr::Lit(Literal::EntityUid(uid(json, path)?)))
        }
        Json::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), value_from_json(v, &format!("{path}.{k}"))?)))
            .collect::<Result<Vec<_>, PolicyError>>()
            .map(Expr::Record),
        Json::Null => Err(PolicyError::mismatch(path, "null is not a valid value")),
    }
}

pub(crate) fn expr_from_json(json: &Json, path: &str) -> Result<Expr, PolicyError> {
    let obj = object(json, path)?;
    let mut entries = obj.iter();
    let (key, body) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        _ => {
            return Err(PolicyError::mismatch(
                path,
                "expression node must have exactly one key",
            ));
        }
    };
    let at = format!("{path}.{key}");
    let sub = |name: &str| -> Result<Box<Expr>, PolicyError> {
        let inner = object(body, &at)?;
        Ok(Box::new(expr_from_json(
            field(inner, name, &at)?,
            &format!("{at}.{name}"),
        )?))
    };
    let attr = || -> Result<String, PolicyError> {
        let inner = object(body, &at)?;
        Ok(string(field(inner, "attr", &at)?, &format!("{at}.attr"))?.to_string())
    };

    Ok(match key.as_str() {
        "Value" => value_from_json(body, &at)?,
        "Var" => {
            let name = string(body, &at)?;
            Expr::Var(
                name.parse::<Var>()
                    .map_err(|_| PolicyError::mismatch(&at, format!("unknown variable `{name}`")))?,
            )
        }
        "Slot" => {
            let name = string(body, &at)?;
            Expr::Slot(
                name.parse::<SlotId>()
                    .map_err(|_| PolicyError::mismatch(&at, format!("unknown slot `{name}`")))?,
            )
        }
        "!" => Expr::Unary {
            op: UnaryOp::Not,
            arg: sub("arg")?,
        },
        "neg" => Expr::Unary {
            op: UnaryOp::Neg,
            arg: sub("arg")?,
        },
        "isEmpty" => Expr::Unary {
            op: UnaryOp::IsEmpty,
            arg: sub("arg")?,
        },
        "&&" => Expr::And(sub("left")?, sub("right")?),
        "||" => Expr::Or(sub("left")?, sub("right")?),
        "." => Expr::GetAttr {
            expr: sub("left")?,
            attr: attr()?,
        },
        "has" => Expr::HasAttr {
            expr: sub("left")?,
            attr: attr()?,
        },
        "like" => {
            let inner = object(body, &at)?;
            let pattern_path = format!("{at}.pattern");
            let items = field(inner, "pattern", &at)?
                .as_array()
                .ok_or_else(|| PolicyError::mismatch(&pattern_path, "expected an array"))?;
            let elems = items
                .iter()
                .enumerate()
                .map(|(idx, item)| pattern_elem(item, &format!("{pattern_path}[{idx}]")))
                .collect::<Result<Vec<_>, _>>()?;
            Expr::Like {
                expr: sub("left")?,
                pattern: Pattern::new(elems),
            }
        }
        "is" => {
            let inner = object(body, &at)?;
            let type_path = format!("{at}.entity_type");
            let entity_type = string(field(inner, "entity_type", &at)?, &type_path)?;
            if !is_type_name(entity_type) {
                return Err(PolicyError::mismatch(type_path, "invalid entity type name"));
            }
            Expr::Is {
                expr: sub("left")?,
                entity_type: entity_type.to_string(),
                in_expr: if inner.contains_key("in") {
                    Some(sub("in")?)
                } else {
                    None
                },
            }
        }
        "if-then-else" => Expr::If {
            cond: sub("if")?,
            then_expr: sub("then")?,
            else_expr: sub("else")?,
        },
        "Set" => {
            let items = body
                .as_array()
                .ok_or_else(|| PolicyError::mismatch(&at, "expected an array"))?;
            Expr::Set(
                items
                    .iter()
                    .enumerate()
                    .map(|(idx, item)| expr_from_json(item, &format!("{at}[{idx}]")))
                    .collect::<Result<_, _>>()?,
            )
        }
        "Record" => Expr::Record(
            object(body, &at)?
                .iter()
                .map(|(k, v)| Ok((k.clone(), expr_from_json(v, &format!("{at}.{k}"))?)))
                .collect::<Result<_, PolicyError>>()?,
        ),
        other => match BinaryOp::from_symbol(other) {
            Some(op) => Expr::Binary {
                op,
                left: sub("left")?,
                right: sub("right")?,
            },
            None => {
                return Err(PolicyError::mismatch(
                    path,
                    format!("unknown operator `{other}`"),
                ));
            }
        },
    })
}

fn pattern_elem(json: &Json, path: &str) -> Result<PatternElem, PolicyError> {
    match json {
        Json::String(s) if s == "Wildcard" => Ok(PatternElem::Wildcard),
        Json::Object(obj) => {
            let literal = string(field(obj, "Literal", path)?, &format!("{path}.Literal"))?;
            let mut chars = literal.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(PatternElem::Char(c)),
                _ => Err(PolicyError::mismatch(
                    path,
                    "pattern literal must be a single character",
                )),
            }
        }
        _ => Err(PolicyError::mismatch(
            path,
            "expected `Wildcard` or {\"Literal\": ...}",
        )),
    }
}
