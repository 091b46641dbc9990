//! Entity identifiers: a `::`-separated type path plus an opaque id.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use utoipa::ToSchema;

use crate::error::PolicyError;
use crate::parser::lexer::{escape, is_ident};

/// Unique identity of an entity, e.g. `MyApp::User::"alice"`.
///
/// Ordering is by type first, then id. Serializes as `{"type": ..., "id": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, ToSchema)]
pub struct EntityUid {
    #[serde(rename = "type")]
    entity_type: String,
    id: String,
}

impl EntityUid {
    /// Build a uid, checking that `entity_type` is a valid type path.
    pub fn from_type_name_and_id(entity_type: &str, id: &str) -> Result<Self, PolicyError> {
        if !is_type_name(entity_type) {
            return Err(PolicyError::InvalidFormat(format!(
                "invalid entity type name `{entity_type}`"
            )));
        }
        Ok(Self::new_unchecked(entity_type, id))
    }

    /// The parser has already validated the path.
    pub(crate) fn new_unchecked(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Namespace segments of the type path (everything before the basename).
    pub fn namespace(&self) -> Vec<&str> {
        let mut parts: Vec<&str> = self.entity_type.split("::").collect();
        parts.pop();
        parts
    }

    /// Parse from either the literal form or a `{"type", "id"}` object.
    pub fn from_json_value(value: &serde_json::Value) -> Result<Self, PolicyError> {
        match value {
            serde_json::Value::String(literal) => literal.parse(),
            other => Ok(serde_json::from_value(other.clone())?),
        }
    }

    pub fn to_json_value(&self) -> serde_json::Value {
        serde_json::json!({"type": self.entity_type, "id": self.id})
    }
}

/// True for `Ident ( "::" Ident )*`.
pub(crate) fn is_type_name(name: &str) -> bool {
    !name.is_empty() && name.split("::").all(is_ident)
}

impl Display for EntityUid {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}::\"{}\"", self.entity_type, escape(&self.id))
    }
}

impl FromStr for EntityUid {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        crate::parser::parse_entity_uid(s)
    }
}

impl<'de> Deserialize<'de> for EntityUid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Repr {
            #[serde(rename = "type")]
            entity_type: String,
            id: String,
        }

        let repr = Repr::deserialize(deserializer)?;
        EntityUid::from_type_name_and_id(&repr.entity_type, &repr.id)
            .map_err(serde::de::Error::custom)
    }
}
