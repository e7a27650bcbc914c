//! The entity cache orchestrator.
//!
//! [`EntityCache`] is the single owner of the store, the query index and the
//! single-flight registry. Intents update status synchronously, then hand the
//! remote call to a Tokio task. When the call completes the task applies its
//! result as one state transition under the same lock.
//!
//! The lock is never held across an `.await`.

mod flight;
mod tasks;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::debug;

use crate::changes::{Change, ChangeFeed, ChangeStream};
use crate::config::CacheConfig;
use crate::entity::{CollectionName, Entity, EntityId};
use crate::error::{CacheError, CacheResult, NormalizeError, TransportError, ValidationErrors};
use crate::index::{Filter, Fingerprint, IndexEntry, IndexState, IndexTransition};
use crate::normalize::{denormalize_many, denormalize_one, normalize, NormalizedResult};
use crate::schema::{EntitySchema, SchemaRegistry};
use crate::store::{EntityStatus, PersistIntent, StoreState, Transition};
use crate::transport::{ApiContext, ApiHost, AuthContext, Transport};

pub use flight::{Dispatch, FlightKey};

use flight::InFlight;

/// Everything guarded by the cache lock.
#[derive(Debug)]
struct Shared {
    store: StoreState,
    indexes: IndexState,
    in_flight: InFlight,
    /// Entities created locally that the server has not assigned identity to.
    drafts: HashSet<(CollectionName, EntityId)>,
    api: ApiContext,
    auth: AuthContext,
    changes: ChangeFeed,
}

impl Shared {
    fn apply(&mut self, transition: Transition) {
        let change = Change::from(&transition);
        self.store.apply(transition);
        self.changes.publish(&change);
    }

    fn apply_index(&mut self, transition: IndexTransition) {
        let change = Change::from(&transition);
        self.indexes.apply(transition);
        self.changes.publish(&change);
    }
}

struct Inner {
    config: CacheConfig,
    schemas: SchemaRegistry,
    transport: Arc<dyn Transport>,
    shared: Mutex<Shared>,
}

impl Inner {
    fn lock(&self, context: &'static str) -> CacheResult<MutexGuard<'_, Shared>> {
        self.shared
            .lock()
            .map_err(|_| CacheError::internal(format!("poisoned lock: {context}")))
    }

    fn schema(&self, collection: &str) -> CacheResult<&EntitySchema> {
        self.schemas.get(collection).ok_or_else(|| {
            NormalizeError::UnknownCollection {
                collection: CollectionName::from(collection),
            }
            .into()
        })
    }
}

/// Read-side view of one list query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexView {
    /// Fingerprint of the canonical query.
    pub fingerprint: Fingerprint,
    /// Denormalized entities of the page; cache misses are skipped.
    pub entities: Vec<Value>,
    /// Total matching entities reported by the server.
    pub existing_count: Option<u64>,
    /// A fetch is in flight.
    pub fetching: bool,
    /// At least one fetch has completed successfully.
    pub ready: bool,
    /// Error of the most recent failed fetch.
    pub error: Option<TransportError>,
    /// The query as a 1-based page filter.
    pub filter: Option<Filter>,
    /// 1-based page number.
    pub page: Option<u64>,
}

/// Client-side normalized entity cache.
///
/// Cloning is cheap and yields another handle to the same cache.
///
/// Operations that reach the remote source must be called from within a
/// Tokio runtime.
#[derive(Clone)]
pub struct EntityCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EntityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache")
            .field("config", &self.inner.config)
            .field("collections", &self.inner.schemas.len())
            .finish_non_exhaustive()
    }
}

impl EntityCache {
    /// Create a cache with the default configuration.
    pub fn new(schemas: SchemaRegistry, transport: Arc<dyn Transport>) -> CacheResult<Self> {
        Self::with_config(schemas, transport, CacheConfig::default())
    }

    /// Create a cache with a custom configuration.
    pub fn with_config(
        schemas: SchemaRegistry,
        transport: Arc<dyn Transport>,
        config: CacheConfig,
    ) -> CacheResult<Self> {
        config.validate()?;
        let shared = Shared {
            store: StoreState::new(),
            indexes: IndexState::new(),
            in_flight: InFlight::default(),
            drafts: HashSet::new(),
            api: ApiContext::default(),
            auth: AuthContext::default(),
            changes: ChangeFeed::new(config.change_capacity),
        };
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                schemas,
                transport,
                shared: Mutex::new(shared),
            }),
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Schema registry the cache was built with.
    #[must_use]
    pub fn schemas(&self) -> &SchemaRegistry {
        &self.inner.schemas
    }

    fn runtime() -> CacheResult<Handle> {
        Handle::try_current()
            .map_err(|_| CacheError::internal("no Tokio runtime available to run sync tasks"))
    }

    /// Makes sure the list query `(collection, filter)` is loaded.
    ///
    /// The filter is canonicalized first, so `{page: 2}` and the equivalent
    /// `offset`/`limit` window share one cache entry. A fetch is started unless
    /// one for the same query is already running.
    ///
    /// # Errors
    /// Fails for an unregistered collection or an invalid paging filter.
    pub fn ensure_index(&self, collection: &str, filter: &Filter) -> CacheResult<Dispatch> {
        self.inner.schema(collection)?;
        let filter = filter.canonicalize(self.inner.config.page_size)?;
        let fingerprint = Fingerprint::of(collection, &filter);
        let runtime = Self::runtime()?;
        let collection = CollectionName::from(collection);

        let (api, auth) = {
            let mut shared = self.inner.lock("ensure_index")?;
            if !shared.in_flight.try_acquire(FlightKey::Index(fingerprint)) {
                debug!(%collection, %fingerprint, "index fetch already in flight");
                return Ok(Dispatch::InFlight);
            }
            shared.apply_index(IndexTransition::Attempt {
                fingerprint,
                collection: collection.clone(),
                filter: filter.clone(),
            });
            (shared.api.clone(), shared.auth.clone())
        };

        debug!(%collection, %fingerprint, "dispatching index fetch");
        let inner = Arc::clone(&self.inner);
        let issued_at = Utc::now();
        Ok(Dispatch::Started(runtime.spawn(async move {
            inner
                .fetch_index(collection, filter, fingerprint, api, auth, issued_at)
                .await;
        })))
    }

    /// Makes sure one entity is loaded.
    ///
    /// Unknown entities become transient and are fetched. Loaded entities,
    /// and entities with a persist or delete in progress, are left alone.
    ///
    /// # Errors
    /// Fails for an unregistered collection.
    pub fn ensure_entity(&self, collection: &str, id: &EntityId) -> CacheResult<Dispatch> {
        self.inner.schema(collection)?;
        let runtime = Self::runtime()?;
        let collection = CollectionName::from(collection);

        let (api, auth) = {
            let mut shared = self.inner.lock("ensure_entity")?;
            shared.apply(Transition::Ensure {
                collection: collection.clone(),
                id: id.clone(),
            });
            let status = shared.store.status(collection.as_str(), id.as_str());
            if !status.transient || status.persisting || status.deleting {
                return Ok(Dispatch::Skipped);
            }
            if !shared
                .in_flight
                .try_acquire(FlightKey::Fetch(collection.clone(), id.clone()))
            {
                debug!(%collection, %id, "entity fetch already in flight");
                return Ok(Dispatch::InFlight);
            }
            shared.apply(Transition::BeginFetch {
                collection: collection.clone(),
                id: id.clone(),
            });
            (shared.api.clone(), shared.auth.clone())
        };

        debug!(%collection, %id, "dispatching entity fetch");
        let inner = Arc::clone(&self.inner);
        let id = id.clone();
        let issued_at = Utc::now();
        Ok(Dispatch::Started(runtime.spawn(async move {
            inner.fetch_entity(collection, id, api, auth, issued_at).await;
        })))
    }

    /// Optimistically writes `data` into the entity and saves it remotely.
    ///
    /// Fields merge into the cached copy right away; the identity field is
    /// forced to `id`. A second write to the same entity while one is running
    /// is rejected with [`Dispatch::InFlight`] and not applied.
    ///
    /// # Errors
    /// Fails for an unregistered collection.
    pub fn persist_entity(
        &self,
        collection: &str,
        id: &EntityId,
        data: Entity,
    ) -> CacheResult<Dispatch> {
        self.persist(collection, id.clone(), data, false)
    }

    /// Creates an entity locally under a transient id and saves it remotely.
    ///
    /// Once the server answers, the entity moves to its server-assigned id
    /// and the transient entry is removed.
    ///
    /// # Errors
    /// Fails for an unregistered collection.
    pub fn create_entity(&self, collection: &str, data: Entity) -> CacheResult<(EntityId, Dispatch)> {
        let id = EntityId::transient();
        let dispatch = self.persist(collection, id.clone(), data, true)?;
        Ok((id, dispatch))
    }

    fn persist(
        &self,
        collection: &str,
        id: EntityId,
        data: Entity,
        create: bool,
    ) -> CacheResult<Dispatch> {
        let schema = self.inner.schema(collection)?;
        let runtime = Self::runtime()?;
        let collection = schema.name.clone();

        let (entity, draft, api, auth) = {
            let mut shared = self.inner.lock("persist_entity")?;
            // Write the identity back in the form it was stored in.
            let id = shared
                .store
                .entity(collection.as_str(), id.as_str())
                .and_then(|stored| stored.get(&schema.id_field_name))
                .and_then(EntityId::from_value)
                .filter(|stored| *stored == id)
                .unwrap_or_else(|| id.clone());
            let intent = PersistIntent::new(schema, id.clone(), data);
            if !shared
                .in_flight
                .try_acquire(FlightKey::Persist(collection.clone(), id.clone()))
            {
                debug!(%collection, %id, "persist already in flight");
                return Ok(Dispatch::InFlight);
            }
            let draft_key = (collection.clone(), id.clone());
            if create {
                shared.drafts.insert(draft_key.clone());
            }
            let draft = shared.drafts.contains(&draft_key);
            shared.apply(Transition::Persist(intent));
            let entity = shared
                .store
                .entity(collection.as_str(), id.as_str())
                .cloned()
                .unwrap_or_default();
            (entity, draft, shared.api.clone(), shared.auth.clone())
        };

        debug!(%collection, %id, draft, "dispatching persist");
        let inner = Arc::clone(&self.inner);
        let issued_at = Utc::now();
        Ok(Dispatch::Started(runtime.spawn(async move {
            inner
                .persist_entity(collection, id, entity, draft, api, auth, issued_at)
                .await;
        })))
    }

    /// Deletes an entity remotely, then drops it from the cache.
    ///
    /// A local draft that never reached the server is removed without a
    /// remote call.
    ///
    /// # Errors
    /// Fails for an unregistered collection.
    ///
    /// # Panics
    /// Panics if the entity is not in the cache; deleting an unknown entity
    /// is a programming error.
    pub fn delete_entity(&self, collection: &str, id: &EntityId) -> CacheResult<Dispatch> {
        self.inner.schema(collection)?;
        let runtime = Self::runtime()?;
        let collection = CollectionName::from(collection);

        let (api, auth) = {
            let mut shared = self.inner.lock("delete_entity")?;
            let known = shared.store.entity(collection.as_str(), id.as_str()).is_some();
            if !known {
                drop(shared);
                panic!("unknown entity to delete: {collection}/{id}");
            }
            if !shared
                .in_flight
                .try_acquire(FlightKey::Delete(collection.clone(), id.clone()))
            {
                debug!(%collection, %id, "delete already in flight");
                return Ok(Dispatch::InFlight);
            }
            shared.apply(Transition::Delete {
                collection: collection.clone(),
                id: id.clone(),
            });

            // Drafts only exist locally; a create still in flight settles on
            // its own under the server id.
            if shared.drafts.remove(&(collection.clone(), id.clone())) {
                shared.apply(Transition::DeleteSucceeded {
                    collection: collection.clone(),
                    id: id.clone(),
                });
                shared
                    .in_flight
                    .release(&FlightKey::Delete(collection.clone(), id.clone()));
                debug!(%collection, %id, "discarded local draft");
                return Ok(Dispatch::Skipped);
            }
            (shared.api.clone(), shared.auth.clone())
        };

        debug!(%collection, %id, "dispatching delete");
        let inner = Arc::clone(&self.inner);
        let id = id.clone();
        Ok(Dispatch::Started(runtime.spawn(async move {
            inner.delete_entity(collection, id, api, auth).await;
        })))
    }

    /// Normalizes a pushed entity graph and merges it into the store.
    ///
    /// # Errors
    /// Fails for an unregistered collection or a malformed graph.
    pub fn receive_entities(&self, collection: &str, data: &Value) -> CacheResult<NormalizedResult> {
        let normalized = normalize(data, collection, &self.inner.schemas)?;
        let mut shared = self.inner.lock("receive_entities")?;
        shared.apply(Transition::ReceiveMany {
            entities: normalized.entities,
            valid_at: Utc::now(),
        });
        Ok(normalized.result)
    }

    /// Copy of the current store state.
    pub fn snapshot(&self) -> CacheResult<StoreState> {
        Ok(self.inner.lock("snapshot")?.store.clone())
    }

    /// Copy of the current query index.
    pub fn index_snapshot(&self) -> CacheResult<IndexState> {
        Ok(self.inner.lock("index_snapshot")?.indexes.clone())
    }

    /// Status of one entity (defaulted when unknown).
    pub fn status(&self, collection: &str, id: &EntityId) -> CacheResult<EntityStatus> {
        Ok(self
            .inner
            .lock("status")?
            .store
            .status(collection, id.as_str()))
    }

    /// Last recorded transport error of one entity.
    pub fn error(&self, collection: &str, id: &EntityId) -> CacheResult<Option<TransportError>> {
        Ok(self
            .inner
            .lock("error")?
            .store
            .error(collection, id.as_str())
            .cloned())
    }

    /// Field-level validation errors from the last rejected persist.
    pub fn validation_errors(
        &self,
        collection: &str,
        id: &EntityId,
    ) -> CacheResult<Option<ValidationErrors>> {
        Ok(self
            .inner
            .lock("validation_errors")?
            .store
            .validation_errors(collection, id.as_str())
            .cloned())
    }

    /// One entity with its associations expanded to the configured depth.
    ///
    /// # Errors
    /// Fails for an unregistered collection.
    pub fn denormalized_entity(&self, collection: &str, id: &EntityId) -> CacheResult<Option<Value>> {
        self.denormalized_entity_with_depth(collection, id, self.inner.config.denormalize_depth)
    }

    /// One entity with its associations expanded `depth` hops.
    ///
    /// # Errors
    /// Fails for an unregistered collection.
    pub fn denormalized_entity_with_depth(
        &self,
        collection: &str,
        id: &EntityId,
        depth: usize,
    ) -> CacheResult<Option<Value>> {
        let shared = self.inner.lock("denormalized_entity")?;
        Ok(denormalize_one(
            id,
            collection,
            shared.store.collections(),
            &self.inner.schemas,
            depth,
        )?)
    }

    /// Cached entry for a list query, if it was ever ensured.
    ///
    /// # Errors
    /// Fails for an invalid paging filter.
    pub fn index_entry(&self, collection: &str, filter: &Filter) -> CacheResult<Option<IndexEntry>> {
        let fingerprint = self.fingerprint(collection, filter)?;
        Ok(self
            .inner
            .lock("index_entry")?
            .indexes
            .get(&fingerprint)
            .cloned())
    }

    /// Denormalized read-side view of a list query.
    ///
    /// Returns `None` until the query has been ensured once.
    ///
    /// # Errors
    /// Fails for an unregistered collection or an invalid paging filter.
    pub fn index_view(&self, collection: &str, filter: &Filter) -> CacheResult<Option<IndexView>> {
        let fingerprint = self.fingerprint(collection, filter)?;
        let shared = self.inner.lock("index_view")?;
        let Some(entry) = shared.indexes.get(&fingerprint) else {
            return Ok(None);
        };
        let entities = denormalize_many(
            &entry.ordered_ids,
            collection,
            shared.store.collections(),
            &self.inner.schemas,
            self.inner.config.denormalize_depth,
        )?;
        Ok(Some(IndexView {
            fingerprint,
            entities,
            existing_count: entry.existing_count,
            fetching: entry.fetching,
            ready: entry.ready,
            error: entry.error.clone(),
            filter: entry.filter.to_paged(),
            page: entry.page(),
        }))
    }

    /// Fingerprint a list query would be cached under.
    ///
    /// # Errors
    /// Fails for an invalid paging filter.
    pub fn fingerprint(&self, collection: &str, filter: &Filter) -> CacheResult<Fingerprint> {
        let filter = filter.canonicalize(self.inner.config.page_size)?;
        Ok(Fingerprint::of(collection, &filter))
    }

    /// Sets the host passed to subsequent transport calls.
    pub fn set_api_host(&self, host: Option<ApiHost>) -> CacheResult<()> {
        self.inner.lock("set_api_host")?.api.host = host;
        Ok(())
    }

    /// Current API context.
    pub fn api_context(&self) -> CacheResult<ApiContext> {
        Ok(self.inner.lock("api_context")?.api.clone())
    }

    /// Replaces the auth context passed to subsequent transport calls.
    pub fn set_auth(&self, auth: AuthContext) -> CacheResult<()> {
        self.inner.lock("set_auth")?.auth = auth;
        Ok(())
    }

    /// Logs out: clears the auth context.
    pub fn clear_auth(&self) -> CacheResult<()> {
        self.set_auth(AuthContext::default())
    }

    /// Current auth context.
    pub fn auth_context(&self) -> CacheResult<AuthContext> {
        Ok(self.inner.lock("auth_context")?.auth.clone())
    }

    /// Subscribes to change notifications.
    pub fn subscribe(&self) -> CacheResult<ChangeStream> {
        Ok(self.inner.lock("subscribe")?.changes.subscribe())
    }

    /// Notifications lost because a subscriber's buffer was full.
    pub fn dropped_changes(&self) -> CacheResult<u64> {
        Ok(self.inner.lock("dropped_changes")?.changes.dropped())
    }

    /// Number of remote operations currently running.
    pub fn in_flight(&self) -> CacheResult<usize> {
        Ok(self.inner.lock("in_flight")?.in_flight.len())
    }
}
