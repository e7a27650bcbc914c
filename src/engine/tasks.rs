//! Remote halves of the cache intents.
//!
//! Each task awaits exactly one transport call, then applies the outcome and
//! releases its flight key inside one critical section. A task that ends
//! without reaching that point (a panicking transport, an aborted task)
//! still releases its key through [`Unsettled`].

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::entity::{CollectionName, Entity, EntityId};
use crate::error::{NormalizeError, TransportError};
use crate::index::{Filter, Fingerprint, IndexTransition};
use crate::normalize::normalize;
use crate::store::{ReceivedEntity, Transition};
use crate::transport::{ApiContext, AuthContext, IndexPage};

use super::{FlightKey, Inner, Shared};

fn contract(collection: &CollectionName, err: &NormalizeError) -> TransportError {
    error!(%collection, error = %err, "transport returned a malformed entity graph");
    TransportError::Contract {
        message: err.to_string(),
    }
}

/// Flight key held by a task that has not applied its result yet.
///
/// Dropping it armed records a failure for the key and releases it, so the
/// entity or query never stays busy.
struct Unsettled<'a> {
    inner: &'a Inner,
    key: Option<FlightKey>,
}

impl<'a> Unsettled<'a> {
    fn new(inner: &'a Inner, key: FlightKey) -> Self {
        Self {
            inner,
            key: Some(key),
        }
    }

    /// The outcome arrived; the completion step owns the key from here.
    fn disarm(mut self) {
        self.key = None;
    }
}

impl Drop for Unsettled<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.inner.abandon(key);
        }
    }
}

impl Inner {
    fn abandon(&self, key: FlightKey) {
        let Some(mut shared) = self.settle("abandon") else {
            return;
        };
        error!(?key, "sync task ended without a result");
        let error = TransportError::Contract {
            message: "transport call ended without a result".to_owned(),
        };
        match &key {
            FlightKey::Index(fingerprint) => {
                shared.apply_index(IndexTransition::Failed {
                    fingerprint: *fingerprint,
                    error,
                });
            }
            FlightKey::Fetch(collection, id) => {
                shared.apply(Transition::FetchFailed {
                    collection: collection.clone(),
                    id: id.clone(),
                    error,
                });
            }
            // A discarded draft has nothing left to mark.
            FlightKey::Persist(collection, id)
                if shared.store.entity(collection.as_str(), id.as_str()).is_some() =>
            {
                shared.apply(Transition::PersistFailed {
                    collection: collection.clone(),
                    id: id.clone(),
                    error,
                });
            }
            FlightKey::Persist(..) => {}
            FlightKey::Delete(collection, id) => {
                shared.apply(Transition::DeleteFailed {
                    collection: collection.clone(),
                    id: id.clone(),
                    error,
                });
            }
        }
        shared.in_flight.release(&key);
    }

    fn settle(&self, context: &'static str) -> Option<std::sync::MutexGuard<'_, Shared>> {
        match self.lock(context) {
            Ok(guard) => Some(guard),
            Err(err) => {
                error!(error = %err, "dropping sync result");
                None
            }
        }
    }

    pub(super) async fn fetch_index(
        &self,
        collection: CollectionName,
        filter: Filter,
        fingerprint: Fingerprint,
        api: ApiContext,
        auth: AuthContext,
        issued_at: DateTime<Utc>,
    ) {
        let pending = Unsettled::new(self, FlightKey::Index(fingerprint));
        let outcome = self
            .transport
            .fetch_entity_index(&collection, &filter, &api, &auth)
            .await;
        pending.disarm();
        self.complete_index(&collection, fingerprint, outcome, issued_at);
    }

    fn complete_index(
        &self,
        collection: &CollectionName,
        fingerprint: Fingerprint,
        outcome: Result<IndexPage, TransportError>,
        valid_at: DateTime<Utc>,
    ) {
        let outcome = outcome.and_then(|page| {
            normalize(&Value::Array(page.data), collection.as_str(), &self.schemas)
                .map(|normalized| (normalized, page.existing_count))
                .map_err(|err| contract(collection, &err))
        });

        let Some(mut shared) = self.settle("complete_index") else {
            return;
        };
        match outcome {
            Ok((normalized, existing_count)) => {
                let ordered_ids = normalized.result.into_ids();
                debug!(%collection, %fingerprint, count = ordered_ids.len(), "index page received");
                shared.apply(Transition::ReceiveMany {
                    entities: normalized.entities,
                    valid_at,
                });
                shared.apply_index(IndexTransition::Receive {
                    fingerprint,
                    ordered_ids,
                    existing_count,
                    valid_at,
                });
            }
            Err(error) => {
                warn!(%collection, %fingerprint, %error, "index fetch failed");
                shared.apply_index(IndexTransition::Failed { fingerprint, error });
            }
        }
        shared.in_flight.release(&FlightKey::Index(fingerprint));
    }

    pub(super) async fn fetch_entity(
        &self,
        collection: CollectionName,
        id: EntityId,
        api: ApiContext,
        auth: AuthContext,
        issued_at: DateTime<Utc>,
    ) {
        let pending = Unsettled::new(self, FlightKey::Fetch(collection.clone(), id.clone()));
        let outcome = self
            .transport
            .fetch_entity(&collection, &id, &api, &auth)
            .await;
        pending.disarm();
        self.complete_fetch(collection, id, outcome, issued_at);
    }

    fn complete_fetch(
        &self,
        collection: CollectionName,
        id: EntityId,
        outcome: Result<Value, TransportError>,
        valid_at: DateTime<Utc>,
    ) {
        let outcome = outcome.and_then(|value| {
            normalize(&value, collection.as_str(), &self.schemas)
                .and_then(|normalized| {
                    ReceivedEntity::new(collection.clone(), id.clone(), normalized.entities, valid_at)
                })
                .map_err(|err| contract(&collection, &err))
        });

        let Some(mut shared) = self.settle("complete_fetch") else {
            return;
        };
        let key = FlightKey::Fetch(collection.clone(), id.clone());
        match outcome {
            Ok(received) => {
                debug!(%collection, %id, "entity received");
                shared.apply(Transition::ReceiveOne(received));
            }
            Err(error) => {
                warn!(%collection, %id, %error, "entity fetch failed");
                shared.apply(Transition::FetchFailed {
                    collection,
                    id,
                    error,
                });
            }
        }
        shared.in_flight.release(&key);
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) async fn persist_entity(
        &self,
        collection: CollectionName,
        id: EntityId,
        entity: Entity,
        draft: bool,
        api: ApiContext,
        auth: AuthContext,
        issued_at: DateTime<Utc>,
    ) {
        let pending = Unsettled::new(self, FlightKey::Persist(collection.clone(), id.clone()));
        let remote_id = (!draft).then_some(&id);
        let outcome = self
            .transport
            .persist_entity(&collection, remote_id, &entity, &api, &auth)
            .await;
        pending.disarm();
        self.complete_persist(collection, id, draft, outcome, issued_at);
    }

    fn complete_persist(
        &self,
        collection: CollectionName,
        id: EntityId,
        draft: bool,
        outcome: Result<Value, TransportError>,
        valid_at: DateTime<Utc>,
    ) {
        let outcome = outcome.and_then(|value| {
            let normalized = normalize(&value, collection.as_str(), &self.schemas)
                .map_err(|err| contract(&collection, &err))?;
            match normalized.result.as_one() {
                Some(saved) => Ok((saved.clone(), normalized.entities)),
                None => Err(TransportError::Contract {
                    message: format!("persist of {collection}/{id} returned a list"),
                }),
            }
        });

        let Some(mut shared) = self.settle("complete_persist") else {
            return;
        };
        let key = FlightKey::Persist(collection.clone(), id.clone());
        let draft_key = (collection.clone(), id.clone());
        let discarded = draft && !shared.drafts.contains(&draft_key);
        match outcome {
            Ok((saved, entities)) => {
                debug!(%collection, %id, %saved, "entity persisted");
                shared.drafts.remove(&draft_key);
                shared.apply(Transition::PersistSucceeded {
                    collection,
                    id: saved,
                    entities,
                    valid_at,
                    transient_id: Some(id),
                });
            }
            Err(error) if discarded => {
                debug!(%collection, %id, %error, "persist of discarded draft failed");
            }
            Err(error) => {
                warn!(%collection, %id, %error, "persist failed");
                shared.apply(Transition::PersistFailed {
                    collection,
                    id,
                    error,
                });
            }
        }
        shared.in_flight.release(&key);
    }

    pub(super) async fn delete_entity(
        &self,
        collection: CollectionName,
        id: EntityId,
        api: ApiContext,
        auth: AuthContext,
    ) {
        let pending = Unsettled::new(self, FlightKey::Delete(collection.clone(), id.clone()));
        let outcome = self
            .transport
            .delete_entity(&collection, &id, &api, &auth)
            .await;
        pending.disarm();
        self.complete_delete(collection, id, outcome);
    }

    fn complete_delete(
        &self,
        collection: CollectionName,
        id: EntityId,
        outcome: Result<(), TransportError>,
    ) {
        let Some(mut shared) = self.settle("complete_delete") else {
            return;
        };
        let key = FlightKey::Delete(collection.clone(), id.clone());
        match outcome {
            Ok(()) => {
                debug!(%collection, %id, "entity deleted");
                shared.apply(Transition::DeleteSucceeded { collection, id });
            }
            Err(error) => {
                warn!(%collection, %id, %error, "delete failed");
                shared.apply(Transition::DeleteFailed {
                    collection,
                    id,
                    error,
                });
            }
        }
        shared.in_flight.release(&key);
    }
}
