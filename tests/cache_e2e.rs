use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use recache::{
    ApiContext, ApiHost, AuthContext, CollectionName, Dispatch, Entity, EntityCache, EntityId,
    EntitySchema, Filter, IndexPage, SchemaRegistry, Transport, TransportError, ValidationErrors,
};

/// Scripted remote source. Every call is counted and recorded; a gate can
/// hold calls until the test releases them.
#[derive(Default)]
struct FakeApi {
    index_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    persist_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    gate: Mutex<Option<Arc<Notify>>>,
    script: Mutex<Script>,
}

#[derive(Default)]
struct Script {
    index: Option<Result<IndexPage, TransportError>>,
    entities: HashMap<String, Value>,
    persist: Option<Result<Value, TransportError>>,
    delete: Option<TransportError>,
    filters: Vec<Filter>,
    persisted: Vec<(Option<EntityId>, Entity)>,
    contexts: Vec<(ApiContext, AuthContext)>,
    /// Calls panic after passing the gate.
    panic: bool,
}

impl FakeApi {
    fn gated(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    async fn pass_gate(&self, api: &ApiContext, auth: &AuthContext) {
        self.script().contexts.push((api.clone(), auth.clone()));
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let panic = self.script().panic;
        assert!(!panic, "transport bug");
    }
}

fn offline() -> TransportError {
    TransportError::ConnectionFailed {
        message: "offline".to_string(),
    }
}

#[async_trait]
impl Transport for FakeApi {
    async fn fetch_entity_index(
        &self,
        _collection: &CollectionName,
        filter: &Filter,
        api: &ApiContext,
        auth: &AuthContext,
    ) -> Result<IndexPage, TransportError> {
        self.index_calls.fetch_add(1, Ordering::SeqCst);
        self.script().filters.push(filter.clone());
        self.pass_gate(api, auth).await;
        self.script().index.clone().unwrap_or_else(|| Err(offline()))
    }

    async fn fetch_entity(
        &self,
        _collection: &CollectionName,
        id: &EntityId,
        api: &ApiContext,
        auth: &AuthContext,
    ) -> Result<Value, TransportError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate(api, auth).await;
        self.script()
            .entities
            .get(id.as_str())
            .cloned()
            .ok_or_else(offline)
    }

    async fn persist_entity(
        &self,
        _collection: &CollectionName,
        id: Option<&EntityId>,
        entity: &Entity,
        api: &ApiContext,
        auth: &AuthContext,
    ) -> Result<Value, TransportError> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        self.script().persisted.push((id.cloned(), entity.clone()));
        self.pass_gate(api, auth).await;
        self.script().persist.clone().unwrap_or_else(|| Err(offline()))
    }

    async fn delete_entity(
        &self,
        _collection: &CollectionName,
        _id: &EntityId,
        api: &ApiContext,
        auth: &AuthContext,
    ) -> Result<(), TransportError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate(api, auth).await;
        self.script().delete.clone().map_or(Ok(()), Err)
    }
}

fn schemas() -> SchemaRegistry {
    SchemaRegistry::new([
        EntitySchema::builder("posts")
            .field("title")
            .belongs_to("author", "users")
            .has_many("comments", "comments")
            .build(),
        EntitySchema::builder("users").field("name").build(),
        EntitySchema::builder("comments")
            .field("body")
            .belongs_to("author", "users")
            .build(),
    ])
    .unwrap()
}

fn setup() -> (EntityCache, Arc<FakeApi>) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
    let api = Arc::new(FakeApi::default());
    let cache = EntityCache::new(schemas(), api.clone()).unwrap();
    (cache, api)
}

fn page_two() -> IndexPage {
    IndexPage {
        data: vec![
            json!({"id": "p11", "title": "Eleven", "author": {"id": "u1", "name": "Ann"}}),
            json!({"id": "p12", "title": "Twelve", "author": {"id": "u2", "name": "Bob"}}),
        ],
        existing_count: Some(25),
    }
}

fn obj(value: Value) -> Entity {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn concurrent_index_requests_share_one_fetch() {
    let (cache, api) = setup();
    api.script().index = Some(Ok(page_two()));
    let gate = api.gated();

    let by_page = Filter::new().with("page", 2);
    let by_window = Filter::new().with("offset", 10).with("limit", 10);

    let first = cache.ensure_index("posts", &by_page).unwrap();
    let second = cache.ensure_index("posts", &by_window).unwrap();
    assert!(first.is_started());
    assert!(second.is_in_flight());

    let pending = cache.index_view("posts", &by_page).unwrap().unwrap();
    assert!(pending.fetching);
    assert!(!pending.ready);

    gate.notify_one();
    first.wait().await.unwrap();

    assert_eq!(api.index_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        api.script().filters,
        vec![Filter::new().with("offset", 10).with("limit", 10)]
    );

    let view = cache.index_view("posts", &by_window).unwrap().unwrap();
    assert!(view.ready);
    assert!(!view.fetching);
    assert_eq!(view.existing_count, Some(25));
    assert_eq!(view.page, Some(2));
    assert_eq!(view.filter, Some(Filter::new().with("page", 2)));
    assert_eq!(view.entities.len(), 2);
    assert_eq!(view.entities[0]["title"], json!("Eleven"));
    assert_eq!(view.entities[0]["author"]["name"], json!("Ann"));
    assert_eq!(view.entities[1]["author"]["id"], json!("u2"));

    // Associated entities were normalized into their own collection.
    assert!(cache.status("users", &"u1".into()).unwrap().is_loaded());
    assert_eq!(cache.in_flight().unwrap(), 0);
}

#[tokio::test]
async fn index_failure_is_recorded_and_cleared_by_retry() {
    let (cache, api) = setup();
    let filter = Filter::new();
    cache.ensure_index("posts", &filter).unwrap().wait().await.unwrap();

    let entry = cache.index_entry("posts", &filter).unwrap().unwrap();
    assert!(!entry.ready);
    assert!(!entry.fetching);
    assert_eq!(entry.error, Some(offline()));

    api.script().index = Some(Ok(page_two()));
    cache.ensure_index("posts", &filter).unwrap().wait().await.unwrap();
    let entry = cache.index_entry("posts", &filter).unwrap().unwrap();
    assert!(entry.ready);
    assert!(entry.error.is_none());
    assert_eq!(entry.ordered_ids, vec![EntityId::from("p11"), EntityId::from("p12")]);
    assert_eq!(api.index_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn malformed_index_page_is_a_contract_error() {
    let (cache, api) = setup();
    api.script().index = Some(Ok(IndexPage {
        data: vec![json!({"title": "no id"})],
        existing_count: None,
    }));
    let filter = Filter::new().with("page", 1);
    cache.ensure_index("posts", &filter).unwrap().wait().await.unwrap();

    let entry = cache.index_entry("posts", &filter).unwrap().unwrap();
    assert!(matches!(entry.error, Some(TransportError::Contract { .. })));
    assert!(cache.snapshot().unwrap().collections().is_empty());
}

#[tokio::test]
async fn invalid_filter_is_rejected_before_dispatch() {
    let (cache, api) = setup();
    let err = cache
        .ensure_index("posts", &Filter::new().with("page", 0))
        .unwrap_err();
    assert!(err.is_filter());
    assert_eq!(api.index_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn ensure_entity_fetches_once_and_skips_loaded() {
    let (cache, api) = setup();
    api.script().entities.insert(
        "p1".to_string(),
        json!({"id": "p1", "title": "One", "comments": [
            {"id": "c1", "body": "hi", "author": {"id": "u1", "name": "Ann"}}
        ]}),
    );
    let id = EntityId::from("p1");
    let gate = api.gated();

    let first = cache.ensure_entity("posts", &id).unwrap();
    assert!(cache.ensure_entity("posts", &id).unwrap().is_in_flight());
    let status = cache.status("posts", &id).unwrap();
    assert!(status.transient && status.fetching);

    gate.notify_one();
    first.wait().await.unwrap();

    let status = cache.status("posts", &id).unwrap();
    assert!(status.is_loaded());
    assert!(!status.fetching);
    assert!(status.valid_at.is_some());

    assert!(matches!(
        cache.ensure_entity("posts", &id).unwrap(),
        Dispatch::Skipped
    ));
    assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 1);

    let post = cache
        .denormalized_entity_with_depth("posts", &id, 2)
        .unwrap()
        .unwrap();
    assert_eq!(post["comments"][0]["author"]["name"], json!("Ann"));

    let shallow = cache.denormalized_entity("posts", &id).unwrap().unwrap();
    assert_eq!(shallow["comments"][0]["author"], json!("u1"));
}

#[tokio::test]
async fn fetch_failure_keeps_entity_transient() {
    let (cache, _api) = setup();
    let id = EntityId::from("missing");
    cache.ensure_entity("posts", &id).unwrap().wait().await.unwrap();

    let status = cache.status("posts", &id).unwrap();
    assert!(status.transient);
    assert!(!status.fetching);
    assert_eq!(cache.error("posts", &id).unwrap(), Some(offline()));
    assert!(cache.denormalized_entity("posts", &id).unwrap().is_none());
}

#[tokio::test]
async fn create_reconciles_transient_id() {
    let (cache, api) = setup();
    api.script().persist = Some(Ok(json!({
        "id": "p9",
        "title": "Draft",
        "author": {"id": "u1", "name": "Ann"}
    })));
    let gate = api.gated();

    let (transient, dispatch) = cache
        .create_entity("posts", obj(json!({"title": "Draft", "author": "u1"})))
        .unwrap();

    let status = cache.status("posts", &transient).unwrap();
    assert!(status.transient && status.persisting);
    let local = cache.snapshot().unwrap();
    assert_eq!(
        local.entity("posts", transient.as_str()).unwrap()["id"],
        json!(transient.as_str())
    );

    gate.notify_one();
    dispatch.wait().await.unwrap();

    {
        let script = api.script();
        assert_eq!(script.persisted.len(), 1);
        assert_eq!(script.persisted[0].0, None);
        assert_eq!(script.persisted[0].1["title"], json!("Draft"));
    }

    let state = cache.snapshot().unwrap();
    assert!(state.entity("posts", transient.as_str()).is_none());
    assert!(!state.is_tracked("posts", transient.as_str()));
    let saved = state.status("posts", "p9");
    assert!(saved.is_loaded());
    assert!(!saved.persisting);
    assert!(state.status("users", "u1").is_loaded());
}

#[tokio::test]
async fn persist_merges_optimistically_and_sends_the_id() {
    let (cache, api) = setup();
    cache
        .receive_entities("posts", &json!({"id": "p1", "title": "Old", "body": "kept"}))
        .unwrap();
    api.script().persist = Some(Ok(json!({"id": "p1", "title": "New", "body": "kept"})));
    let gate = api.gated();

    let id = EntityId::from("p1");
    let dispatch = cache
        .persist_entity("posts", &id, obj(json!({"title": "New"})))
        .unwrap();
    assert!(cache
        .persist_entity("posts", &id, obj(json!({"title": "Newer"})))
        .unwrap()
        .is_in_flight());

    let local = cache.denormalized_entity("posts", &id).unwrap().unwrap();
    assert_eq!(local["title"], json!("New"));
    assert_eq!(local["body"], json!("kept"));

    gate.notify_one();
    dispatch.wait().await.unwrap();

    assert_eq!(api.persist_calls.load(Ordering::SeqCst), 1);
    assert_eq!(api.script().persisted[0].0, Some(id.clone()));
    let status = cache.status("posts", &id).unwrap();
    assert!(status.is_loaded() && !status.persisting);
}

#[tokio::test]
async fn rejected_persist_records_validation_errors() {
    let (cache, api) = setup();
    cache
        .receive_entities("posts", &json!({"id": "p1", "title": "Fine"}))
        .unwrap();
    let mut errors = ValidationErrors::new();
    errors.insert("title".to_string(), vec!["is too short".to_string()]);
    api.script().persist = Some(Err(TransportError::Rejected {
        errors: errors.clone(),
    }));

    let id = EntityId::from("p1");
    cache
        .persist_entity("posts", &id, obj(json!({"title": "x"})))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(cache.validation_errors("posts", &id).unwrap(), Some(errors));
    let status = cache.status("posts", &id).unwrap();
    assert!(!status.persisting);
    assert!(!status.transient);

    // The next attempt clears the recorded errors before dispatching.
    api.script().persist = Some(Ok(json!({"id": "p1", "title": "Longer"})));
    cache
        .persist_entity("posts", &id, obj(json!({"title": "Longer"})))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(cache.validation_errors("posts", &id).unwrap(), None);
    assert_eq!(cache.error("posts", &id).unwrap(), None);
}

#[tokio::test]
async fn delete_removes_entity_on_success() {
    let (cache, api) = setup();
    cache
        .receive_entities("posts", &json!([{"id": "p1"}, {"id": "p2"}]))
        .unwrap();
    let gate = api.gated();
    let id = EntityId::from("p1");

    let dispatch = cache.delete_entity("posts", &id).unwrap();
    let status = cache.status("posts", &id).unwrap();
    assert!(status.deleting && status.transient);

    gate.notify_one();
    dispatch.wait().await.unwrap();

    let state = cache.snapshot().unwrap();
    assert!(state.entity("posts", "p1").is_none());
    assert!(state.entity("posts", "p2").is_some());
    assert_eq!(api.delete_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_delete_restores_entity() {
    let (cache, api) = setup();
    cache.receive_entities("posts", &json!({"id": "p1"})).unwrap();
    api.script().delete = Some(TransportError::ServerError {
        code: 503,
        message: "busy".to_string(),
    });
    let id = EntityId::from("p1");
    cache.delete_entity("posts", &id).unwrap().wait().await.unwrap();

    let status = cache.status("posts", &id).unwrap();
    assert!(!status.deleting);
    assert!(!status.transient);
    assert!(cache.error("posts", &id).unwrap().is_some());
    assert!(cache.denormalized_entity("posts", &id).unwrap().is_some());
}

#[tokio::test]
async fn deleting_a_draft_stays_local() {
    let (cache, api) = setup();
    // Keep the create pending so the entity stays a draft.
    let _gate = api.gated();
    let (transient, _create) = cache
        .create_entity("posts", obj(json!({"title": "Draft"})))
        .unwrap();

    let dispatch = cache.delete_entity("posts", &transient).unwrap();
    assert!(matches!(dispatch, Dispatch::Skipped));
    assert_eq!(api.delete_calls.load(Ordering::SeqCst), 0);
    assert!(cache
        .snapshot()
        .unwrap()
        .entity("posts", transient.as_str())
        .is_none());
}

#[tokio::test]
#[should_panic(expected = "unknown entity to delete")]
async fn deleting_an_unknown_entity_panics() {
    let (cache, _api) = setup();
    let _ = cache.delete_entity("posts", &"ghost".into());
}

#[tokio::test]
async fn contexts_are_passed_to_the_transport() {
    let (cache, api) = setup();
    let host = ApiHost {
        name: "api.example.com".to_string(),
        ssl: true,
    };
    cache.set_api_host(Some(host.clone())).unwrap();
    cache
        .set_auth(AuthContext {
            user: Some(json!({"name": "Ann"})),
            token: Some("secret".to_string()),
        })
        .unwrap();
    cache.ensure_index("posts", &Filter::new()).unwrap().wait().await.unwrap();

    cache.clear_auth().unwrap();
    assert!(!cache.auth_context().unwrap().is_authenticated());
    cache
        .ensure_index("posts", &Filter::new().with("page", 2))
        .unwrap()
        .wait()
        .await
        .unwrap();

    let script = api.script();
    assert_eq!(script.contexts.len(), 2);
    assert_eq!(script.contexts[0].0.host, Some(host.clone()));
    assert_eq!(script.contexts[0].1.token.as_deref(), Some("secret"));
    assert!(script.contexts[1].1.token.is_none());
    assert_eq!(cache.api_context().unwrap().host, Some(host));
}

#[tokio::test]
async fn subscribers_see_each_transition() {
    let (cache, api) = setup();
    api.script()
        .entities
        .insert("u1".to_string(), json!({"id": "u1", "name": "Ann"}));
    let stream = cache.subscribe().unwrap();

    cache
        .ensure_entity("users", &"u1".into())
        .unwrap()
        .wait()
        .await
        .unwrap();

    let kinds: Vec<&str> = stream.drain().iter().map(recache::Change::kind).collect();
    assert_eq!(kinds, vec!["ensure", "begin_fetch", "receive_one"]);
    assert!(stream.recv_timeout(Duration::from_millis(10)).is_none());
    assert_eq!(cache.dropped_changes().unwrap(), 0);
}

#[tokio::test]
async fn stale_fetch_keeps_newer_data() {
    let (cache, api) = setup();
    api.script()
        .entities
        .insert("p1".to_string(), json!({"id": "p1", "title": "Old"}));
    let gate = api.gated();
    let id = EntityId::from("p1");

    let fetch = cache.ensure_entity("posts", &id).unwrap();
    assert!(fetch.is_started());

    // Data pushed after the fetch was issued is newer than its response.
    std::thread::sleep(Duration::from_millis(2));
    cache
        .receive_entities("posts", &json!({"id": "p1", "title": "New"}))
        .unwrap();
    let fresh = cache.status("posts", &id).unwrap().valid_at;
    assert!(fresh.is_some());

    gate.notify_one();
    fetch.wait().await.unwrap();

    let status = cache.status("posts", &id).unwrap();
    assert!(!status.fetching);
    assert!(status.is_loaded());
    assert_eq!(status.valid_at, fresh);
    let post = cache.denormalized_entity("posts", &id).unwrap().unwrap();
    assert_eq!(post["title"], json!("New"));
    assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.in_flight().unwrap(), 0);
}

#[tokio::test]
async fn panicking_transport_releases_the_entity() {
    let (cache, api) = setup();
    api.script().panic = true;
    let id = EntityId::from("p1");

    let fetch = cache.ensure_entity("posts", &id).unwrap();
    assert!(fetch.wait().await.is_err());

    let status = cache.status("posts", &id).unwrap();
    assert!(!status.fetching);
    assert!(status.transient);
    assert!(matches!(
        cache.error("posts", &id).unwrap(),
        Some(TransportError::Contract { .. })
    ));
    assert_eq!(cache.in_flight().unwrap(), 0);

    // The key is free again, so a retry reaches the transport.
    api.script().panic = false;
    api.script()
        .entities
        .insert("p1".to_string(), json!({"id": "p1", "title": "Back"}));
    let retry = cache.ensure_entity("posts", &id).unwrap();
    assert!(retry.is_started());
    retry.wait().await.unwrap();
    assert!(cache.status("posts", &id).unwrap().is_loaded());
    assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn panicking_transport_releases_the_query() {
    let (cache, api) = setup();
    api.script().panic = true;
    let filter = Filter::new().with("page", 3);

    assert!(cache
        .ensure_index("posts", &filter)
        .unwrap()
        .wait()
        .await
        .is_err());

    let entry = cache.index_entry("posts", &filter).unwrap().unwrap();
    assert!(!entry.fetching);
    assert!(matches!(entry.error, Some(TransportError::Contract { .. })));
    assert_eq!(cache.in_flight().unwrap(), 0);
    assert!(cache.ensure_index("posts", &filter).unwrap().is_started());
}

#[tokio::test]
async fn persist_keeps_integer_ids() {
    let (cache, api) = setup();
    cache
        .receive_entities("posts", &json!({"id": 7, "title": "Old"}))
        .unwrap();
    api.script().persist = Some(Ok(json!({"id": 7, "title": "New"})));
    let gate = api.gated();

    // A string handle still writes the stored integer identity.
    let id = EntityId::from("7");
    let dispatch = cache
        .persist_entity("posts", &id, obj(json!({"title": "New"})))
        .unwrap();
    let local = cache.denormalized_entity("posts", &id).unwrap().unwrap();
    assert_eq!(local["id"], json!(7));

    gate.notify_one();
    dispatch.wait().await.unwrap();

    {
        let script = api.script();
        assert_eq!(script.persisted[0].1["id"], json!(7));
    }
    let post = cache.denormalized_entity("posts", &id).unwrap().unwrap();
    assert_eq!(post["id"], json!(7));
    assert_eq!(post["title"], json!("New"));
}
