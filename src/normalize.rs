//! Normalization and denormalization of entity graphs.
//!
//! [`normalize`] flattens a nested graph into an [`EntityDictionary`] in which
//! every association field holds identity values instead of nested objects.
//! [`denormalize`] walks the other way, substituting ids with the stored
//! entities up to a bounded number of relation hops.
//!
//! Denormalization tolerates a partial cache: ids that are not in the
//! dictionary are dropped from lists and leave single lookups absent.

use serde_json::Value;

use crate::entity::{CollectionName, Entity, EntityDictionary, EntityId};
use crate::error::NormalizeError;
use crate::schema::{EntitySchema, SchemaRegistry};

/// Identity of the normalized input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedResult {
    /// The input was a single entity.
    One(EntityId),
    /// The input was a list; ids keep the input order.
    Many(Vec<EntityId>),
}

impl NormalizedResult {
    /// Ids as an ordered list (a single id becomes a one-element list).
    #[must_use]
    pub fn into_ids(self) -> Vec<EntityId> {
        match self {
            Self::One(id) => vec![id],
            Self::Many(ids) => ids,
        }
    }

    /// The single id, when the input was one entity.
    #[must_use]
    pub const fn as_one(&self) -> Option<&EntityId> {
        match self {
            Self::One(id) => Some(id),
            Self::Many(_) => None,
        }
    }
}

/// Output of [`normalize`].
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    /// Flattened entities of every collection reached from the input.
    pub entities: EntityDictionary,
    /// Identity of the top-level input.
    pub result: NormalizedResult,
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn schema_for<'a>(
    schemas: &'a SchemaRegistry,
    collection: &str,
) -> Result<&'a EntitySchema, NormalizeError> {
    schemas
        .get(collection)
        .ok_or_else(|| NormalizeError::UnknownCollection {
            collection: CollectionName::from(collection),
        })
}

/// Flattens `data` (one entity or a list of entities of `collection`).
///
/// # Errors
/// Returns [`NormalizeError`] when `collection` is not registered, or when an
/// entity in the graph is not an object or lacks a usable identity.
pub fn normalize(
    data: &Value,
    collection: &str,
    schemas: &SchemaRegistry,
) -> Result<Normalized, NormalizeError> {
    let schema = schema_for(schemas, collection)?;
    let mut entities = EntityDictionary::new();

    let result = match data {
        Value::Array(items) => {
            let mut ids = Vec::with_capacity(items.len());
            for item in items {
                let (id, _) = flatten(item, schema, schemas, &mut entities)?;
                ids.push(id);
            }
            NormalizedResult::Many(ids)
        }
        other => NormalizedResult::One(flatten(other, schema, schemas, &mut entities)?.0),
    };

    Ok(Normalized { entities, result })
}

/// Inserts the flattened copy of `value` and everything it reaches.
///
/// Returns the dictionary id and the original JSON identity value, which is
/// what the parent's association field ends up holding.
fn flatten(
    value: &Value,
    schema: &EntitySchema,
    schemas: &SchemaRegistry,
    out: &mut EntityDictionary,
) -> Result<(EntityId, Value), NormalizeError> {
    let Value::Object(object) = value else {
        return Err(NormalizeError::NotAnEntity {
            collection: schema.name.clone(),
            found: json_type(value),
        });
    };

    let id_value = object
        .get(&schema.id_field_name)
        .cloned()
        .unwrap_or(Value::Null);
    let id = EntityId::from_value(&id_value).ok_or_else(|| NormalizeError::MissingId {
        collection: schema.name.clone(),
        id_field: schema.id_field_name.clone(),
    })?;

    let mut flat: Entity = object.clone();
    for (field, assoc) in schema.associations() {
        let Some(related) = object.get(field) else {
            continue;
        };
        let target = schema_for(schemas, assoc.collection.as_str())?;

        let reference = if assoc.multiple {
            match related {
                Value::Null => Value::Null,
                Value::Array(items) => {
                    let mut refs = Vec::with_capacity(items.len());
                    for item in items {
                        refs.push(flatten_reference(item, target, schemas, out)?);
                    }
                    Value::Array(refs)
                }
                _ => {
                    return Err(NormalizeError::ExpectedList {
                        collection: schema.name.clone(),
                        field: field.to_string(),
                    })
                }
            }
        } else {
            match related {
                Value::Null => Value::Null,
                other => flatten_reference(other, target, schemas, out)?,
            }
        };
        flat.insert(field.to_string(), reference);
    }

    out.merge_entity(&schema.name, &id, &flat);
    Ok((id, id_value))
}

/// Turns one association value into an identity reference.
///
/// Nested objects are flattened; values that are already ids pass through.
fn flatten_reference(
    value: &Value,
    target: &EntitySchema,
    schemas: &SchemaRegistry,
    out: &mut EntityDictionary,
) -> Result<Value, NormalizeError> {
    match value {
        Value::Object(_) => Ok(flatten(value, target, schemas, out)?.1),
        Value::String(_) | Value::Number(_) if EntityId::from_value(value).is_some() => {
            Ok(value.clone())
        }
        other => Err(NormalizeError::NotAnEntity {
            collection: target.name.clone(),
            found: json_type(other),
        }),
    }
}

/// Reconstructs nested entities from `dictionary`.
///
/// `ids` may be an id, an entity object (its identity field is read), or a
/// list of either. Lists come back as lists with cache misses removed; a
/// single lookup that misses returns `Ok(None)`.
///
/// `max_level` bounds the relation hops: `0` leaves associations as ids,
/// `1` expands the direct associations of the top-level entities, and so on.
///
/// # Errors
/// Returns [`NormalizeError::UnknownCollection`] if `collection` is not
/// registered.
pub fn denormalize(
    ids: &Value,
    collection: &str,
    dictionary: &EntityDictionary,
    schemas: &SchemaRegistry,
    max_level: usize,
) -> Result<Option<Value>, NormalizeError> {
    let schema = schema_for(schemas, collection)?;
    let out = match ids {
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter_map(|item| expand_reference(item, schema, dictionary, schemas, max_level))
                .collect(),
        )),
        other => expand_reference(other, schema, dictionary, schemas, max_level),
    };
    Ok(out)
}

/// Typed single-entity form of [`denormalize`].
///
/// # Errors
/// Returns [`NormalizeError::UnknownCollection`] if `collection` is not
/// registered.
pub fn denormalize_one(
    id: &EntityId,
    collection: &str,
    dictionary: &EntityDictionary,
    schemas: &SchemaRegistry,
    max_level: usize,
) -> Result<Option<Value>, NormalizeError> {
    let schema = schema_for(schemas, collection)?;
    Ok(expand(id, schema, dictionary, schemas, max_level).map(Value::Object))
}

/// Typed list form of [`denormalize`]. Cache misses are skipped.
///
/// # Errors
/// Returns [`NormalizeError::UnknownCollection`] if `collection` is not
/// registered.
pub fn denormalize_many(
    ids: &[EntityId],
    collection: &str,
    dictionary: &EntityDictionary,
    schemas: &SchemaRegistry,
    max_level: usize,
) -> Result<Vec<Value>, NormalizeError> {
    let schema = schema_for(schemas, collection)?;
    Ok(ids
        .iter()
        .filter_map(|id| expand(id, schema, dictionary, schemas, max_level))
        .map(Value::Object)
        .collect())
}

fn expand_reference(
    reference: &Value,
    schema: &EntitySchema,
    dictionary: &EntityDictionary,
    schemas: &SchemaRegistry,
    level: usize,
) -> Option<Value> {
    let id = match reference {
        Value::Object(object) => EntityId::from_value(object.get(&schema.id_field_name)?)?,
        other => EntityId::from_value(other)?,
    };
    expand(&id, schema, dictionary, schemas, level).map(Value::Object)
}

fn expand(
    id: &EntityId,
    schema: &EntitySchema,
    dictionary: &EntityDictionary,
    schemas: &SchemaRegistry,
    level: usize,
) -> Option<Entity> {
    let mut entity = dictionary.get(schema.name.as_str(), id.as_str())?.clone();
    if level == 0 {
        return Some(entity);
    }

    for (field, assoc) in schema.associations() {
        let Some(reference) = entity.get(field) else {
            continue;
        };
        // Targets are checked when the registry is built.
        let Some(target) = schemas.get(assoc.collection.as_str()) else {
            continue;
        };

        let expanded = match reference {
            Value::Null => Some(Value::Null),
            Value::Array(items) if assoc.multiple => Some(Value::Array(
                items
                    .iter()
                    .filter_map(|item| expand_reference(item, target, dictionary, schemas, level - 1))
                    .collect(),
            )),
            other => expand_reference(other, target, dictionary, schemas, level - 1),
        };

        match expanded {
            Some(value) => {
                entity.insert(field.to_string(), value);
            }
            None => {
                entity.remove(field);
            }
        }
    }

    Some(entity)
}
