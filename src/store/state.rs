//! Store state and the reducer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::entity::{CollectionName, Entity, EntityDictionary, EntityId};
use crate::error::{TransportError, ValidationErrors};

use super::status::EntityStatus;
use super::transition::Transition;

type PerEntity<T> = BTreeMap<CollectionName, BTreeMap<EntityId, T>>;

fn remove_nested<T>(map: &mut PerEntity<T>, collection: &str, id: &str) -> Option<T> {
    let entries = map.get_mut(collection)?;
    let removed = entries.remove(id);
    if entries.is_empty() {
        map.remove(collection);
    }
    removed
}

fn insert_nested<T>(map: &mut PerEntity<T>, collection: &CollectionName, id: &EntityId, value: T) {
    map.entry(collection.clone())
        .or_default()
        .insert(id.clone(), value);
}

/// Snapshot of the entity store.
///
/// Cloning yields an independent snapshot; nothing is shared between copies.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreState {
    collections: EntityDictionary,
    statuses: PerEntity<EntityStatus>,
    errors: PerEntity<TransportError>,
    validation_errors: PerEntity<ValidationErrors>,
}

impl StoreState {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `transition` and returns the resulting state.
    ///
    /// # Panics
    /// Panics on [`Transition::Delete`] of an entity that is not stored.
    #[must_use]
    pub fn reduce(mut self, transition: Transition) -> Self {
        self.apply(transition);
        self
    }

    /// In-place form of [`StoreState::reduce`].
    ///
    /// # Panics
    /// Panics on [`Transition::Delete`] of an entity that is not stored.
    pub fn apply(&mut self, transition: Transition) {
        match transition {
            Transition::Ensure { collection, id } => {
                self.statuses
                    .entry(collection)
                    .or_default()
                    .entry(id)
                    .or_insert(EntityStatus {
                        transient: true,
                        ..EntityStatus::default()
                    });
            }
            Transition::BeginFetch { collection, id } => {
                let known = self.has_status(collection.as_str(), id.as_str());
                let status = self.status_mut(&collection, &id);
                if !known {
                    status.transient = true;
                }
                status.fetching = true;
            }
            Transition::ReceiveOne(received) => {
                let (entities, valid_at) = received.into_parts();
                self.receive(&entities, valid_at, |status| status.fetching = false);
            }
            Transition::ReceiveMany { entities, valid_at } => {
                self.receive(&entities, valid_at, |status| status.fetching = false);
            }
            Transition::FetchFailed {
                collection,
                id,
                error,
            } => {
                let status = self.status_mut(&collection, &id);
                status.fetching = false;
                status.transient = true;
                insert_nested(&mut self.errors, &collection, &id, error);
            }
            Transition::Persist(intent) => {
                let known = self.has_status(intent.collection().as_str(), intent.id().as_str());
                self.collections
                    .merge_entity(intent.collection(), intent.id(), intent.data());
                let status = self.status_mut(intent.collection(), intent.id());
                if !known {
                    status.transient = true;
                }
                status.persisting = true;
                remove_nested(&mut self.errors, intent.collection().as_str(), intent.id().as_str());
                remove_nested(
                    &mut self.validation_errors,
                    intent.collection().as_str(),
                    intent.id().as_str(),
                );
            }
            Transition::PersistSucceeded {
                collection,
                id,
                entities,
                valid_at,
                transient_id,
            } => {
                self.receive(&entities, valid_at, |status| status.persisting = false);
                // The saved entity is settled even if its content was stale.
                let status = self.status_mut(&collection, &id);
                status.persisting = false;
                status.transient = false;

                if let Some(transient_id) = transient_id.filter(|t| *t != id) {
                    debug!(%collection, %transient_id, %id, "reconciled transient entity");
                    self.forget(collection.as_str(), transient_id.as_str());
                }
            }
            Transition::PersistFailed {
                collection,
                id,
                error,
            } => {
                self.status_mut(&collection, &id).persisting = false;
                if let Some(validation) = error.validation_errors() {
                    insert_nested(&mut self.validation_errors, &collection, &id, validation.clone());
                }
                insert_nested(&mut self.errors, &collection, &id, error);
            }
            Transition::Delete { collection, id } => {
                assert!(
                    self.collections.contains(collection.as_str(), id.as_str()),
                    "unknown entity to delete: {collection}/{id}"
                );
                let status = self.status_mut(&collection, &id);
                status.transient = true;
                status.deleting = true;
            }
            Transition::DeleteSucceeded { collection, id } => {
                self.forget(collection.as_str(), id.as_str());
            }
            Transition::DeleteFailed {
                collection,
                id,
                error,
            } => {
                let status = self.status_mut(&collection, &id);
                status.transient = false;
                status.deleting = false;
                insert_nested(&mut self.errors, &collection, &id, error);
            }
        }
    }

    /// Merges server data, skipping entities that already hold newer data.
    ///
    /// `settle` runs for every touched entity, stale or not.
    fn receive(
        &mut self,
        entities: &EntityDictionary,
        valid_at: DateTime<Utc>,
        settle: impl Fn(&mut EntityStatus),
    ) {
        for (collection, id, entity) in entities.iter() {
            let status = self.status_mut(collection, id);
            settle(status);
            if status.is_newer_than(valid_at) {
                warn!(%collection, %id, %valid_at, "dropping stale entity data");
                continue;
            }
            status.transient = false;
            status.valid_at = Some(valid_at);
            self.collections.merge_entity(collection, id, entity);
        }
    }

    fn forget(&mut self, collection: &str, id: &str) {
        self.collections.remove(collection, id);
        remove_nested(&mut self.statuses, collection, id);
        remove_nested(&mut self.errors, collection, id);
        remove_nested(&mut self.validation_errors, collection, id);
    }

    fn has_status(&self, collection: &str, id: &str) -> bool {
        self.statuses
            .get(collection)
            .is_some_and(|statuses| statuses.contains_key(id))
    }

    fn status_mut(&mut self, collection: &CollectionName, id: &EntityId) -> &mut EntityStatus {
        self.statuses
            .entry(collection.clone())
            .or_default()
            .entry(id.clone())
            .or_default()
    }

    /// All stored entities.
    #[must_use]
    pub const fn collections(&self) -> &EntityDictionary {
        &self.collections
    }

    /// One stored entity.
    #[must_use]
    pub fn entity(&self, collection: &str, id: &str) -> Option<&Entity> {
        self.collections.get(collection, id)
    }

    /// Status of an entity, defaulted when none is recorded.
    #[must_use]
    pub fn status(&self, collection: &str, id: &str) -> EntityStatus {
        self.statuses
            .get(collection)
            .and_then(|statuses| statuses.get(id))
            .copied()
            .unwrap_or_default()
    }

    /// Returns true if a status record exists for the entity.
    #[must_use]
    pub fn is_tracked(&self, collection: &str, id: &str) -> bool {
        self.has_status(collection, id)
    }

    /// Last recorded transport error for the entity.
    #[must_use]
    pub fn error(&self, collection: &str, id: &str) -> Option<&TransportError> {
        self.errors.get(collection)?.get(id)
    }

    /// Field-level validation errors from the last rejected persist.
    #[must_use]
    pub fn validation_errors(&self, collection: &str, id: &str) -> Option<&ValidationErrors> {
        self.validation_errors.get(collection)?.get(id)
    }
}
