//! The entity store and group-hierarchy resolution.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::debug;

use crate::error::{EvaluationError, PolicyError};
use crate::schema::Schema;
use crate::traits::EntityLookup;
use crate::types::{Entity, EntityUid, Value};

/// Immutable map of entities with precomputed transitive ancestry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entities {
    entities: BTreeMap<EntityUid, Entity>,
    ancestors: BTreeMap<EntityUid, BTreeSet<EntityUid>>,
}

impl Entities {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a store, failing with `DuplicateEntity` if two records share a uid.
    pub fn from_entities(entities: impl IntoIterator<Item = Entity>) -> Result<Self, PolicyError> {
        let mut map = BTreeMap::new();
        for entity in entities {
            let uid = entity.uid().clone();
            if map.insert(uid.clone(), entity).is_some() {
                return Err(PolicyError::DuplicateEntity(uid.to_string()));
            }
        }
        let ancestors = compute_ancestors(&map);
        debug!(
            event = "Entities",
            phase = "Build",
            entities = map.len(),
            "Computed entity ancestry"
        );
        Ok(Self {
            entities: map,
            ancestors,
        })
    }

    /// Like `from_entities`, but every record must conform to `schema`.
    pub fn from_entities_with_schema(
        entities: impl IntoIterator<Item = Entity>,
        schema: &Schema,
    ) -> Result<Self, PolicyError> {
        let store = Self::from_entities(entities)?;
        store.validate(schema)?;
        Ok(store)
    }

    pub fn from_json_value(json: &serde_json::Value) -> Result<Self, PolicyError> {
        let items = json.as_array().ok_or_else(|| {
            PolicyError::InvalidFormat("entity list must be a JSON array".into())
        })?;
        let entities = items
            .iter()
            .map(Entity::from_json_value)
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_entities(entities)
    }

    pub fn from_json_str(text: &str) -> Result<Self, PolicyError> {
        let json: serde_json::Value = serde_json::from_str(text)?;
        Self::from_json_value(&json)
    }

    /// Entity list format, in uid order.
    pub fn to_json_value(&self) -> serde_json::Value {
        serde_json::Value::Array(self.entities.values().map(Entity::to_json_value).collect())
    }

    pub fn get(&self, uid: &EntityUid) -> Option<&Entity> {
        self.entities.get(uid)
    }

    /// All transitive ancestors of `uid`; empty when `uid` is unknown.
    pub fn ancestors(&self, uid: &EntityUid) -> impl Iterator<Item = &EntityUid> {
        self.ancestors.get(uid).into_iter().flatten()
    }

    /// `uid in ancestor`: equal uids, or `ancestor` in the transitive closure
    /// of `uid`'s parents.
    pub fn is_descendant(&self, uid: &EntityUid, ancestor: &EntityUid) -> bool {
        uid == ancestor
            || self
                .ancestors
                .get(uid)
                .is_some_and(|set| set.contains(ancestor))
    }

    pub fn attribute(&self, uid: &EntityUid, name: &str) -> Result<&Value, EvaluationError> {
        self.get(uid)
            .and_then(|entity| entity.attr(name))
            .ok_or_else(|| EvaluationError::AttributeNotFound {
                target: uid.to_string(),
                attribute: name.to_string(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub(crate) fn validate(&self, schema: &Schema) -> Result<(), PolicyError> {
        for entity in self.entities.values() {
            schema.validate_entity(entity)?;
        }
        Ok(())
    }
}

impl EntityLookup for Entities {
    fn entity(&self, uid: &EntityUid) -> Option<&Entity> {
        self.get(uid)
    }

    fn is_descendant(&self, uid: &EntityUid, ancestor: &EntityUid) -> bool {
        Entities::is_descendant(self, uid, ancestor)
    }
}

/// Breadth-first closure over parent edges. The visited set makes cycles
/// terminate; dangling parents are recorded but not expanded.
fn compute_ancestors(
    entities: &BTreeMap<EntityUid, Entity>,
) -> BTreeMap<EntityUid, BTreeSet<EntityUid>> {
    entities
        .iter()
        .map(|(uid, entity)| {
            let mut visited: BTreeSet<EntityUid> = BTreeSet::new();
            let mut queue: VecDeque<&EntityUid> = entity.parents().iter().collect();
            while let Some(next) = queue.pop_front() {
                if !visited.insert(next.clone()) {
                    continue;
                }
                if let Some(parent) = entities.get(next) {
                    queue.extend(parent.parents().iter());
                }
            }
            (uid.clone(), visited)
        })
        .collect()
}
