//! Runtime values: attribute data, context entries and expression results.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter, Result as FmtResult};

use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{EvaluationError, PolicyError};
use crate::parser::lexer::escape;

use super::EntityUid;

/// Key marking an entity reference in the JSON attribute format.
pub const ENTITY_ESCAPE: &str = "__entity";

/// Closed set of value kinds. The derived order makes sets canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    Bool(bool),
    Long(i64),
    String(String),
    Entity(EntityUid),
    Set(BTreeSet<Value>),
    Record(BTreeMap<String, Value>),
}

impl Value {
    /// Name of the value kind, used in type-mismatch messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Long(_) => "long",
            Value::String(_) => "string",
            Value::Entity(_) => "entity",
            Value::Set(_) => "set",
            Value::Record(_) => "record",
        }
    }

    pub fn as_bool(&self) -> Result<bool, EvaluationError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(EvaluationError::type_mismatch("bool", other.type_name())),
        }
    }

    pub fn as_long(&self) -> Result<i64, EvaluationError> {
        match self {
            Value::Long(n) => Ok(*n),
            other => Err(EvaluationError::type_mismatch("long", other.type_name())),
        }
    }

    pub fn as_str(&self) -> Result<&str, EvaluationError> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(EvaluationError::type_mismatch("string", other.type_name())),
        }
    }

    pub fn as_entity(&self) -> Result<&EntityUid, EvaluationError> {
        match self {
            Value::Entity(uid) => Ok(uid),
            other => Err(EvaluationError::type_mismatch("entity", other.type_name())),
        }
    }

    pub fn as_set(&self) -> Result<&BTreeSet<Value>, EvaluationError> {
        match self {
            Value::Set(items) => Ok(items),
            other => Err(EvaluationError::type_mismatch("set", other.type_name())),
        }
    }

    /// Decode the entity-attribute JSON format.
    pub fn from_json_value(json: &serde_json::Value) -> Result<Self, PolicyError> {
        Self::from_json_at(json, "$")
    }

    pub(crate) fn from_json_at(json: &serde_json::Value, path: &str) -> Result<Self, PolicyError> {
        use serde_json::Value as J;
        match json {
            J::Bool(b) => Ok(Value::Bool(*b)),
            J::Number(n) => n.as_i64().map(Value::Long).ok_or_else(|| {
                PolicyError::InvalidFormat(format!("{path}: `{n}` is not a 64-bit integer"))
            }),
            J::String(s) => Ok(Value::String(s.clone())),
            J::Array(items) => items
                .iter()
                .enumerate()
                .map(|(idx, item)| Self::from_json_at(item, &format!("{path}[{idx}]")))
                .collect::<Result<BTreeSet<_>, _>>()
                .map(Value::Set),
            J::Object(map) => {
                if let Some(uid) = map.get(ENTITY_ESCAPE) {
                    if map.len() != 1 {
                        return Err(PolicyError::InvalidFormat(format!(
                            "{path}: `{ENTITY_ESCAPE}` must be the only key"
                        )));
                    }
                    return EntityUid::from_json_value(uid)
                        .map(Value::Entity)
                        .map_err(|e| PolicyError::InvalidFormat(format!("{path}: {e}")));
                }
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), Self::from_json_at(v, &format!("{path}.{k}"))?)))
                    .collect::<Result<BTreeMap<_, _>, PolicyError>>()
                    .map(Value::Record)
            }
            J::Null => Err(PolicyError::InvalidFormat(format!(
                "{path}: null is not a valid value"
            ))),
        }
    }

    pub fn to_json_value(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Bool(b) => J::Bool(*b),
            Value::Long(n) => J::from(*n),
            Value::String(s) => J::String(s.clone()),
            Value::Entity(uid) => serde_json::json!({ ENTITY_ESCAPE: uid.to_json_value() }),
            Value::Set(items) => J::Array(items.iter().map(Value::to_json_value).collect()),
            Value::Record(fields) => J::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json_value()))
                    .collect(),
            ),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Long(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "\"{}\"", escape(s)),
            Value::Entity(uid) => write!(f, "{uid}"),
            Value::Set(items) => write!(f, "[{}]", items.iter().join(", ")),
            Value::Record(fields) => write!(
                f,
                "{{{}}}",
                fields
                    .iter()
                    .map(|(k, v)| format!("\"{}\": {v}", escape(k)))
                    .join(", ")
            ),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Value::from_json_value(&json).map_err(serde::de::Error::custom)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Long(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Long(n.into())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<EntityUid> for Value {
    fn from(uid: EntityUid) -> Self {
        Value::Entity(uid)
    }
}

impl FromIterator<Value> for Value {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Value::Set(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use yare::parameterized;

    fn uid(t: &str, id: &str) -> EntityUid {
        EntityUid::from_type_name_and_id(t, id).unwrap()
    }

    #[test]
    fn test_from_json_all_kinds() {
        let value = Value::from_json_value(&json!({
            "flag": true,
            "n": -3,
            "s": "x",
            "owner": {"__entity": {"type": "User", "id": "alice"}},
            "tags": ["b", "a", "b"],
        }))
        .unwrap();

        let Value::Record(fields) = value else {
            panic!("expected record");
        };
        assert_eq!(fields["flag"], Value::Bool(true));
        assert_eq!(fields["n"], Value::Long(-3));
        assert_eq!(fields["owner"], Value::Entity(uid("User", "alice")));
        assert_eq!(
            fields["tags"],
            Value::from_iter([Value::from("a"), Value::from("b")])
        );
    }

    #[parameterized(
        float = { json!(1.5) },
        null = { json!(null) },
        nested_null = { json!({"a": [null]}) },
        entity_with_extra_key = { json!({"__entity": {"type": "U", "id": "a"}, "x": 1}) },
        bad_entity_type = { json!({"__entity": {"type": "", "id": "a"}}) },
    )]
    fn test_from_json_rejects(input: serde_json::Value) {
        assert!(matches!(
            Value::from_json_value(&input),
            Err(PolicyError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_to_json_escapes_entities() {
        let value = Value::Entity(uid("User", "alice"));
        assert_eq!(
            value.to_json_value(),
            json!({"__entity": {"type": "User", "id": "alice"}})
        );
    }

    #[test]
    fn test_sets_are_canonical() {
        let a = Value::from_iter([Value::from(2), Value::from(1)]);
        let b = Value::from_iter([Value::from(1), Value::from(2), Value::from(1)]);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "[1, 2]");
    }

    #[test]
    fn test_accessors_report_kind() {
        let err = Value::from("x").as_long().unwrap_err();
        assert_eq!(err, EvaluationError::type_mismatch("long", "string"));
        assert!(Value::Bool(false).as_bool().is_ok());
    }

    #[test]
    fn test_serde_uses_attribute_format() {
        let value: Value = serde_json::from_value(json!([1, {"__entity": "User::\"a\""}])).unwrap();
        insta::assert_json_snapshot!(value, @r#"
        [
          1,
          {
            "__entity": {
              "type": "User",
              "id": "a"
            }
          }
        ]
        "#);
    }
}
