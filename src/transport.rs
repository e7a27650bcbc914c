//! Remote data source contract.
//!
//! The cache never performs network I/O itself. A [`Transport`]
//! implementation is handed the collection, the canonical query or entity
//! identity, and the current API and auth contexts, and answers with a nested
//! entity graph or a [`TransportError`]. Timeouts are the transport's concern
//! and surface as [`TransportError::Timeout`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{CollectionName, Entity, EntityId};
use crate::error::TransportError;
use crate::index::Filter;

/// API host the transport should talk to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiHost {
    /// Host name, optionally with port.
    pub name: String,
    /// Whether to use TLS.
    pub ssl: bool,
}

impl ApiHost {
    /// Base URL for this host.
    #[must_use]
    pub fn base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}", self.name)
    }
}

/// Where requests go.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiContext {
    /// Configured host, if any.
    pub host: Option<ApiHost>,
}

/// Who requests are made for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthContext {
    /// Authenticated user profile, if logged in.
    pub user: Option<Value>,
    /// Bearer token, if any.
    pub token: Option<String>,
}

impl AuthContext {
    /// Returns true if a user is logged in.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}

/// One page of a list query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexPage {
    /// Entities of the page as nested graphs, in order.
    pub data: Vec<Value>,
    /// Total number of entities matching the filter.
    #[serde(default)]
    pub existing_count: Option<u64>,
}

/// Remote data source.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Fetches one page of `collection` matching the canonical `filter`.
    async fn fetch_entity_index(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        api: &ApiContext,
        auth: &AuthContext,
    ) -> Result<IndexPage, TransportError>;

    /// Fetches one entity as a nested graph.
    async fn fetch_entity(
        &self,
        collection: &CollectionName,
        id: &EntityId,
        api: &ApiContext,
        auth: &AuthContext,
    ) -> Result<Value, TransportError>;

    /// Saves one entity and returns the saved graph.
    ///
    /// `id` is `None` when the entity is new and the server assigns identity.
    async fn persist_entity(
        &self,
        collection: &CollectionName,
        id: Option<&EntityId>,
        entity: &Entity,
        api: &ApiContext,
        auth: &AuthContext,
    ) -> Result<Value, TransportError>;

    /// Deletes one entity.
    async fn delete_entity(
        &self,
        collection: &CollectionName,
        id: &EntityId,
        api: &ApiContext,
        auth: &AuthContext,
    ) -> Result<(), TransportError>;
}
