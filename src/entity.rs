//! Entity identity and the normalized entity dictionary.
//!
//! Entities are schemaless JSON objects. What makes them addressable is the
//! pair `(CollectionName, EntityId)`: the collection names a homogeneous set
//! and the id is unique within it.

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Entity content: field name to JSON value.
pub type Entity = Map<String, Value>;

/// Name of a homogeneous set of entities.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionName(String);

impl CollectionName {
    /// Creates a collection name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CollectionName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CollectionName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for CollectionName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Opaque entity identifier, unique within its collection.
///
/// Remote sources may hand out string or integer identities. Both are keyed
/// by their string form, so `7` and `"7"` address the same entity.
///
/// # Examples
///
/// ```
/// use recache::EntityId;
/// use serde_json::json;
///
/// assert_eq!(EntityId::from_value(&json!(7)), Some(EntityId::from("7")));
/// assert_eq!(EntityId::from_value(&json!("u1")), Some(EntityId::from("u1")));
/// assert_eq!(EntityId::from_value(&json!(null)), None);
/// ```
#[derive(Debug, Clone)]
pub struct EntityId {
    key: String,
    /// The identity arrived as a JSON integer and is written back as one.
    numeric: bool,
}

impl EntityId {
    const fn string(key: String) -> Self {
        Self {
            key,
            numeric: false,
        }
    }

    const fn integer(key: String) -> Self {
        Self { key, numeric: true }
    }

    /// Creates a fresh random id for an entity that has no server identity yet.
    #[must_use]
    pub fn transient() -> Self {
        Self::string(Uuid::new_v4().to_string())
    }

    /// Reads an id out of a JSON identity value.
    ///
    /// Accepts non-empty strings and integers; anything else has no identity.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self::string(s.clone())),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(Self::integer(n.to_string())),
            _ => None,
        }
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Returns true if the id came from a JSON integer.
    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        self.numeric
    }

    /// JSON identity value, in the form the id was received in.
    #[must_use]
    pub fn to_value(&self) -> Value {
        if self.numeric {
            if let Ok(n) = self.key.parse::<i64>() {
                return Value::from(n);
            }
            if let Ok(n) = self.key.parse::<u64>() {
                return Value::from(n);
            }
        }
        Value::String(self.key.clone())
    }
}

// Identity is the string form alone; `7` and `"7"` are the same key.
impl PartialEq for EntityId {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for EntityId {}

impl Hash for EntityId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for EntityId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntityId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(EntityIdVisitor)
    }
}

struct EntityIdVisitor;

impl Visitor<'_> for EntityIdVisitor {
    type Value = EntityId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a non-empty string or an integer id")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<EntityId, E> {
        if v.is_empty() {
            return Err(E::invalid_value(de::Unexpected::Str(v), &self));
        }
        Ok(EntityId::string(v.to_string()))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<EntityId, E> {
        Ok(EntityId::from(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<EntityId, E> {
        Ok(EntityId::from(v))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.key
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::string(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self::string(id)
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        Self::integer(id.to_string())
    }
}

impl From<u64> for EntityId {
    fn from(id: u64) -> Self {
        Self::integer(id.to_string())
    }
}

/// Recursively merges `source` into `target`.
///
/// Nested objects merge key by key. Any other value (including arrays)
/// replaces the previous one.
pub fn deep_merge(target: &mut Entity, source: &Entity) {
    for (key, incoming) in source {
        match (target.get_mut(key), incoming) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), incoming.clone());
            }
        }
    }
}

/// Flat, relation-free entity storage: collection → id → entity.
///
/// Association fields inside stored entities hold identity values, never
/// nested entity objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityDictionary {
    collections: BTreeMap<CollectionName, BTreeMap<EntityId, Entity>>,
}

impl EntityDictionary {
    /// Create an empty dictionary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up one entity.
    #[must_use]
    pub fn get(&self, collection: &str, id: &str) -> Option<&Entity> {
        self.collections.get(collection)?.get(id)
    }

    /// Returns true if the entity is present.
    #[must_use]
    pub fn contains(&self, collection: &str, id: &str) -> bool {
        self.get(collection, id).is_some()
    }

    /// All entities of one collection.
    #[must_use]
    pub fn collection(&self, collection: &str) -> Option<&BTreeMap<EntityId, Entity>> {
        self.collections.get(collection)
    }

    /// Deep-merges `entity` into whatever is stored at `(collection, id)`.
    pub fn merge_entity(&mut self, collection: &CollectionName, id: &EntityId, entity: &Entity) {
        let slot = self
            .collections
            .entry(collection.clone())
            .or_default()
            .entry(id.clone())
            .or_default();
        deep_merge(slot, entity);
    }

    /// Deep-merges every entity of `other` into this dictionary.
    pub fn merge(&mut self, other: &Self) {
        for (collection, id, entity) in other.iter() {
            self.merge_entity(collection, id, entity);
        }
    }

    /// Removes one entity, dropping the collection when it becomes empty.
    pub fn remove(&mut self, collection: &str, id: &str) -> Option<Entity> {
        let entities = self.collections.get_mut(collection)?;
        let removed = entities.remove(id);
        if entities.is_empty() {
            self.collections.remove(collection);
        }
        removed
    }

    /// Iterates `(collection, id, entity)` in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&CollectionName, &EntityId, &Entity)> {
        self.collections.iter().flat_map(|(collection, entities)| {
            entities
                .iter()
                .map(move |(id, entity)| (collection, id, entity))
        })
    }

    /// Collection names present in this dictionary.
    pub fn collection_names(&self) -> impl Iterator<Item = &CollectionName> {
        self.collections.keys()
    }

    /// Total number of entities across collections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.collections.values().map(BTreeMap::len).sum()
    }

    /// Returns true if no entity is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collections.values().all(BTreeMap::is_empty)
    }
}
