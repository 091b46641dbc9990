//! Authorization request type.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::PolicyError;

use super::{Context, EntityUid};

/// One authorization question: may `principal` perform `action` on `resource`?
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Request {
    #[serde(deserialize_with = "uid_either_form")]
    pub principal: EntityUid,
    #[serde(deserialize_with = "uid_either_form")]
    pub action: EntityUid,
    #[serde(deserialize_with = "uid_either_form")]
    pub resource: EntityUid,
    #[serde(default)]
    pub context: Context,
    /// Opaque caller token, echoed back in the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Request {
    pub fn new(principal: EntityUid, action: EntityUid, resource: EntityUid) -> Self {
        Self {
            principal,
            action,
            resource,
            context: Context::default(),
            correlation_id: None,
        }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn from_json_str(text: &str) -> Result<Self, PolicyError> {
        Ok(serde_json::from_str(text)?)
    }
}

fn uid_either_form<'de, D: Deserializer<'de>>(deserializer: D) -> Result<EntityUid, D::Error> {
    let json = serde_json::Value::deserialize(deserializer)?;
    EntityUid::from_json_value(&json).map_err(serde::de::Error::custom)
}
