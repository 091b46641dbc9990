//! Entity records: uid, attributes and direct parents.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::PolicyError;

use super::{EntityUid, Value};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entity {
    uid: EntityUid,
    attrs: BTreeMap<String, Value>,
    parents: BTreeSet<EntityUid>,
}

impl Entity {
    pub fn new(
        uid: EntityUid,
        attrs: BTreeMap<String, Value>,
        parents: BTreeSet<EntityUid>,
    ) -> Self {
        Self {
            uid,
            attrs,
            parents,
        }
    }

    /// An entity with no attributes and no parents.
    pub fn with_uid(uid: EntityUid) -> Self {
        Self::new(uid, BTreeMap::new(), BTreeSet::new())
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn with_parent(mut self, parent: EntityUid) -> Self {
        self.parents.insert(parent);
        self
    }

    pub fn uid(&self) -> &EntityUid {
        &self.uid
    }

    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attrs.get(name)
    }

    pub fn attrs(&self) -> &BTreeMap<String, Value> {
        &self.attrs
    }

    pub fn parents(&self) -> &BTreeSet<EntityUid> {
        &self.parents
    }

    /// Parse `{"uid": ..., "attrs": {...}, "parents": [...]}`.
    ///
    /// `attrs` and `parents` may be omitted. Uids accept either JSON form.
    pub fn from_json_value(json: &serde_json::Value) -> Result<Self, PolicyError> {
        let obj = json
            .as_object()
            .ok_or_else(|| PolicyError::InvalidFormat("entity must be a JSON object".into()))?;
        let uid = obj
            .get("uid")
            .ok_or_else(|| PolicyError::InvalidFormat("entity is missing `uid`".into()))
            .and_then(EntityUid::from_json_value)?;
        let at = uid.to_string();

        let attrs = match obj.get("attrs") {
            None => BTreeMap::new(),
            Some(serde_json::Value::Object(map)) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), Value::from_json_at(v, &format!("{at}.{k}"))?)))
                .collect::<Result<_, PolicyError>>()?,
            Some(_) => {
                return Err(PolicyError::InvalidFormat(format!(
                    "{at}: `attrs` must be an object"
                )));
            }
        };

        let parents = match obj.get("parents") {
            None => BTreeSet::new(),
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .map(EntityUid::from_json_value)
                .collect::<Result<_, _>>()?,
            Some(_) => {
                return Err(PolicyError::InvalidFormat(format!(
                    "{at}: `parents` must be an array"
                )));
            }
        };

        Ok(Self::new(uid, attrs, parents))
    }

    pub fn to_json_value(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("uid".into(), self.uid.to_json_value());
        obj.insert(
            "attrs".into(),
            serde_json::Value::Object(
                self.attrs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json_value()))
                    .collect(),
            ),
        );
        obj.insert(
            "parents".into(),
            serde_json::Value::Array(self.parents.iter().map(EntityUid::to_json_value).collect()),
        );
        serde_json::Value::Object(obj)
    }
}

impl Serialize for Entity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Entity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Entity::from_json_value(&json).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_json_round_trip_keeps_layout() {
        let input = json!({
            "uid": {"type": "User", "id": "alice"},
            "attrs": {"active": true},
            "parents": [{"type": "Group", "id": "admins"}],
        });
        let entity = Entity::from_json_value(&input).unwrap();
        assert_eq!(
            serde_json::to_string(&entity.to_json_value()).unwrap(),
            r#"{"uid":{"type":"User","id":"alice"},"attrs":{"active":true},"parents":[{"type":"Group","id":"admins"}]}"#
        );
    }

    #[test]
    fn test_entity_defaults_for_missing_fields() {
        let entity = Entity::from_json_value(&json!({"uid": "User::\"bob\""})).unwrap();
        assert!(entity.attrs().is_empty());
        assert!(entity.parents().is_empty());
        assert_eq!(entity.uid().id(), "bob");
    }

    #[test]
    fn test_entity_shape_errors() {
        assert!(Entity::from_json_value(&json!([])).is_err());
        assert!(Entity::from_json_value(&json!({"attrs": {}})).is_err());
        assert!(Entity::from_json_value(&json!({"uid": "User::\"a\"", "parents": {}})).is_err());
        let err = Entity::from_json_value(&json!({"uid": "User::\"a\"", "attrs": {"x": 1.5}}))
            .unwrap_err();
        assert!(err.to_string().contains("User::\"a\".x"));
    }

    #[test]
    fn test_entity_builder() {
        let group = EntityUid::from_type_name_and_id("Group", "g").unwrap();
        let entity = Entity::with_uid(EntityUid::from_type_name_and_id("User", "u").unwrap())
            .with_attr("age", 30)
            .with_parent(group.clone());
        assert_eq!(entity.attr("age"), Some(&Value::Long(30)));
        assert!(entity.parents().contains(&group));
    }
}
