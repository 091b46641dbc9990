//! Request context values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

use super::Value;

/// Typed wrapper for request context attributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Context(BTreeMap<String, Value>);

impl Context {
    /// Create an empty request context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one context attribute and return the updated context.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert one context attribute.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.0
    }

    /// Parse a JSON object in the entity-attribute format.
    pub fn from_json_value(json: &serde_json::Value) -> Result<Self, PolicyError> {
        match Value::from_json_at(json, "context")? {
            Value::Record(fields) => Ok(Self(fields)),
            other => Err(PolicyError::InvalidFormat(format!(
                "context must be a record, found {}",
                other.type_name()
            ))),
        }
    }
}

impl From<BTreeMap<String, Value>> for Context {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Self(value)
    }
}

impl From<Context> for Value {
    fn from(context: Context) -> Self {
        Value::Record(context.0)
    }
}

impl<'a> IntoIterator for &'a Context {
    type Item = (&'a String, &'a Value);
    type IntoIter = std::collections::btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
