//! Typed store transitions.
//!
//! Payloads that carry a precondition are only constructible through a
//! checking constructor, so [`super::StoreState::reduce`] never has to inspect
//! their shape.

use chrono::{DateTime, Utc};

use crate::entity::{CollectionName, Entity, EntityDictionary, EntityId};
use crate::error::{NormalizeError, TransportError};
use crate::schema::EntitySchema;

/// A fetched entity together with everything normalized alongside it.
///
/// Always contains the requested `(collection, id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEntity {
    collection: CollectionName,
    id: EntityId,
    entities: EntityDictionary,
    valid_at: DateTime<Utc>,
}

impl ReceivedEntity {
    /// Checks that `entities` contains the requested entity.
    ///
    /// # Errors
    /// Returns [`NormalizeError::RequestedEntityAbsent`] otherwise.
    pub fn new(
        collection: CollectionName,
        id: EntityId,
        entities: EntityDictionary,
        valid_at: DateTime<Utc>,
    ) -> Result<Self, NormalizeError> {
        if !entities.contains(collection.as_str(), id.as_str()) {
            return Err(NormalizeError::RequestedEntityAbsent {
                collection,
                id: id.to_string(),
            });
        }
        Ok(Self {
            collection,
            id,
            entities,
            valid_at,
        })
    }

    /// Requested collection.
    #[must_use]
    pub const fn collection(&self) -> &CollectionName {
        &self.collection
    }

    /// Requested id.
    #[must_use]
    pub const fn id(&self) -> &EntityId {
        &self.id
    }

    pub(crate) fn into_parts(self) -> (EntityDictionary, DateTime<Utc>) {
        (self.entities, self.valid_at)
    }
}

/// Optimistic local write of one entity.
///
/// The identity field of `data` is always overwritten with `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistIntent {
    collection: CollectionName,
    id: EntityId,
    data: Entity,
}

impl PersistIntent {
    /// Builds the intent against the collection's schema.
    #[must_use]
    pub fn new(schema: &EntitySchema, id: EntityId, mut data: Entity) -> Self {
        data.insert(schema.id_field_name.clone(), id.to_value());
        Self {
            collection: schema.name.clone(),
            id,
            data,
        }
    }

    /// Target collection.
    #[must_use]
    pub const fn collection(&self) -> &CollectionName {
        &self.collection
    }

    /// Target id.
    #[must_use]
    pub const fn id(&self) -> &EntityId {
        &self.id
    }

    /// Entity content, identity field included.
    #[must_use]
    pub const fn data(&self) -> &Entity {
        &self.data
    }
}

/// Event driving the entity store state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Caller wants the entity; marks it transient if unknown.
    Ensure {
        collection: CollectionName,
        id: EntityId,
    },
    /// A fetch for the entity was dispatched.
    BeginFetch {
        collection: CollectionName,
        id: EntityId,
    },
    /// A single-entity fetch completed.
    ReceiveOne(ReceivedEntity),
    /// A batch of normalized entities arrived (index pages, pushes).
    ReceiveMany {
        entities: EntityDictionary,
        valid_at: DateTime<Utc>,
    },
    /// A single-entity fetch failed.
    FetchFailed {
        collection: CollectionName,
        id: EntityId,
        error: TransportError,
    },
    /// Optimistic local write.
    Persist(PersistIntent),
    /// The server accepted a write and returned the saved graph.
    PersistSucceeded {
        collection: CollectionName,
        id: EntityId,
        entities: EntityDictionary,
        valid_at: DateTime<Utc>,
        /// Local id the entity was created under, if it differed.
        transient_id: Option<EntityId>,
    },
    /// The server rejected or failed a write.
    PersistFailed {
        collection: CollectionName,
        id: EntityId,
        error: TransportError,
    },
    /// A delete was dispatched. The entity must exist.
    Delete {
        collection: CollectionName,
        id: EntityId,
    },
    /// The server confirmed the delete.
    DeleteSucceeded {
        collection: CollectionName,
        id: EntityId,
    },
    /// The server failed the delete.
    DeleteFailed {
        collection: CollectionName,
        id: EntityId,
        error: TransportError,
    },
}

impl Transition {
    /// Short name used in logs and change notifications.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ensure { .. } => "ensure",
            Self::BeginFetch { .. } => "begin_fetch",
            Self::ReceiveOne(_) => "receive_one",
            Self::ReceiveMany { .. } => "receive_many",
            Self::FetchFailed { .. } => "fetch_failed",
            Self::Persist(_) => "persist",
            Self::PersistSucceeded { .. } => "persist_succeeded",
            Self::PersistFailed { .. } => "persist_failed",
            Self::Delete { .. } => "delete",
            Self::DeleteSucceeded { .. } => "delete_succeeded",
            Self::DeleteFailed { .. } => "delete_failed",
        }
    }

    /// The entity this transition is about, if it targets exactly one.
    #[must_use]
    pub fn target(&self) -> Option<(&CollectionName, &EntityId)> {
        match self {
            Self::Ensure { collection, id }
            | Self::BeginFetch { collection, id }
            | Self::FetchFailed { collection, id, .. }
            | Self::PersistSucceeded { collection, id, .. }
            | Self::PersistFailed { collection, id, .. }
            | Self::Delete { collection, id }
            | Self::DeleteSucceeded { collection, id }
            | Self::DeleteFailed { collection, id, .. } => Some((collection, id)),
            Self::ReceiveOne(received) => Some((received.collection(), received.id())),
            Self::Persist(intent) => Some((intent.collection(), intent.id())),
            Self::ReceiveMany { .. } => None,
        }
    }
}
