//! Schema registry.
//!
//! Each collection declares its identity field and its fields. Association
//! fields point at another collection, holding either one related entity or
//! an ordered list of them. The registry is checked once at construction so
//! every association target is known to exist afterwards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entity::CollectionName;
use crate::error::SchemaError;

/// Relation from a field to another collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    /// Target collection.
    pub collection: CollectionName,
    /// Whether the field holds an ordered list of related entities.
    pub multiple: bool,
}

/// Definition of a single field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawField", into = "RawField")]
pub struct FieldSchema {
    /// Present when the field relates to another collection.
    pub association: Option<Association>,
}

impl FieldSchema {
    /// A plain scalar field.
    #[must_use]
    pub const fn scalar() -> Self {
        Self { association: None }
    }

    /// A field relating to one or many entities of `collection`.
    #[must_use]
    pub fn association(collection: impl Into<CollectionName>, multiple: bool) -> Self {
        Self {
            association: Some(Association {
                collection: collection.into(),
                multiple,
            }),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawField {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    is_association: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    collection_name: Option<CollectionName>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    is_multiple: bool,
}

impl TryFrom<RawField> for FieldSchema {
    type Error = String;

    fn try_from(raw: RawField) -> Result<Self, Self::Error> {
        match (raw.is_association, raw.collection_name) {
            (false, _) => Ok(Self::scalar()),
            (true, Some(collection)) => Ok(Self::association(collection, raw.is_multiple)),
            (true, None) => Err("association field requires 'collectionName'".to_string()),
        }
    }
}

impl From<FieldSchema> for RawField {
    fn from(field: FieldSchema) -> Self {
        match field.association {
            None => Self::default(),
            Some(assoc) => Self {
                is_association: true,
                collection_name: Some(assoc.collection),
                is_multiple: assoc.multiple,
            },
        }
    }
}

/// Schema of one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySchema {
    /// Collection this schema describes.
    pub name: CollectionName,
    /// Name of the identity field.
    pub id_field_name: String,
    /// Field definitions by name.
    pub fields: BTreeMap<String, FieldSchema>,
    /// Named field lists for presentation (e.g. `grid`, `form`).
    pub fieldsets: BTreeMap<String, Vec<String>>,
}

impl EntitySchema {
    /// Starts building a schema for `name` with identity field `id`.
    #[must_use]
    pub fn builder(name: impl Into<CollectionName>) -> EntitySchemaBuilder {
        EntitySchemaBuilder {
            schema: Self {
                name: name.into(),
                id_field_name: "id".to_string(),
                fields: BTreeMap::new(),
                fieldsets: BTreeMap::new(),
            },
        }
    }

    /// Association fields with their targets.
    pub fn associations(&self) -> impl Iterator<Item = (&str, &Association)> {
        self.fields
            .iter()
            .filter_map(|(name, field)| field.association.as_ref().map(|a| (name.as_str(), a)))
    }

    /// Returns the named fieldset, or every field name when it is not defined.
    #[must_use]
    pub fn fieldset(&self, name: &str) -> Vec<&str> {
        match self.fieldsets.get(name) {
            Some(fields) => fields.iter().map(String::as_str).collect(),
            None => self.fields.keys().map(String::as_str).collect(),
        }
    }
}

/// Fluent builder for [`EntitySchema`].
#[derive(Debug, Clone)]
pub struct EntitySchemaBuilder {
    schema: EntitySchema,
}

impl EntitySchemaBuilder {
    /// Overrides the identity field name (default `id`).
    #[must_use]
    pub fn id_field(mut self, name: impl Into<String>) -> Self {
        self.schema.id_field_name = name.into();
        self
    }

    /// Adds a scalar field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.schema.fields.insert(name.into(), FieldSchema::scalar());
        self
    }

    /// Adds a single-valued association.
    #[must_use]
    pub fn belongs_to(mut self, name: impl Into<String>, target: impl Into<CollectionName>) -> Self {
        self.schema
            .fields
            .insert(name.into(), FieldSchema::association(target, false));
        self
    }

    /// Adds a multi-valued association.
    #[must_use]
    pub fn has_many(mut self, name: impl Into<String>, target: impl Into<CollectionName>) -> Self {
        self.schema
            .fields
            .insert(name.into(), FieldSchema::association(target, true));
        self
    }

    /// Adds a named fieldset.
    #[must_use]
    pub fn fieldset<I, S>(mut self, name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schema
            .fieldsets
            .insert(name.into(), fields.into_iter().map(Into::into).collect());
        self
    }

    /// Finishes the schema.
    #[must_use]
    pub fn build(self) -> EntitySchema {
        self.schema
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntitySchema {
    #[serde(default = "default_id_field")]
    id_field_name: String,
    #[serde(default)]
    fields: BTreeMap<String, FieldSchema>,
    #[serde(default)]
    fieldsets: BTreeMap<String, Vec<String>>,
}

fn default_id_field() -> String {
    "id".to_string()
}

/// Validated set of collection schemas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaRegistry {
    schemas: BTreeMap<CollectionName, EntitySchema>,
}

impl SchemaRegistry {
    /// Builds a registry, checking that every association target is registered.
    pub fn new(schemas: impl IntoIterator<Item = EntitySchema>) -> Result<Self, SchemaError> {
        let mut by_name = BTreeMap::new();
        for schema in schemas {
            if schema.id_field_name.trim().is_empty() {
                return Err(SchemaError::EmptyIdField {
                    collection: schema.name,
                });
            }
            if by_name.contains_key(&schema.name) {
                return Err(SchemaError::DuplicateCollection {
                    collection: schema.name,
                });
            }
            by_name.insert(schema.name.clone(), schema);
        }

        for schema in by_name.values() {
            for (field, assoc) in schema.associations() {
                if !by_name.contains_key(&assoc.collection) {
                    return Err(SchemaError::UnknownAssociationTarget {
                        collection: schema.name.clone(),
                        field: field.to_string(),
                        target: assoc.collection.clone(),
                    });
                }
            }
        }

        Ok(Self { schemas: by_name })
    }

    /// Parses a registry from a JSON object keyed by collection name.
    ///
    /// ```
    /// use recache::SchemaRegistry;
    ///
    /// let registry = SchemaRegistry::from_json(r#"{
    ///     "posts": {"idFieldName": "id", "fields": {
    ///         "title": {},
    ///         "author": {"isAssociation": true, "collectionName": "users"}
    ///     }},
    ///     "users": {"fields": {"name": {}}}
    /// }"#).unwrap();
    /// assert!(registry.get("posts").is_some());
    /// ```
    pub fn from_json(json: &str) -> Result<Self, SchemaError> {
        let raw: BTreeMap<String, RawEntitySchema> =
            serde_json::from_str(json).map_err(|e| SchemaError::InvalidJson {
                message: e.to_string(),
            })?;
        Self::new(raw.into_iter().map(|(name, raw)| EntitySchema {
            name: CollectionName::from(name),
            id_field_name: raw.id_field_name,
            fields: raw.fields,
            fieldsets: raw.fieldsets,
        }))
    }

    /// Schema of `collection`, if registered.
    #[must_use]
    pub fn get(&self, collection: &str) -> Option<&EntitySchema> {
        self.schemas.get(collection)
    }

    /// Iterates all schemas in name order.
    pub fn iter(&self) -> impl Iterator<Item = &EntitySchema> {
        self.schemas.values()
    }

    /// Number of registered collections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Returns true if no collection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
