//! # recache - Client-side normalized entity cache
//!
//! recache keeps a local, normalized copy of entities served by a remote data
//! source. Nested entity graphs are flattened into a per-collection
//! dictionary, list queries are cached by a stable fingerprint of their
//! canonical filter, and every entity carries a status describing whether it
//! is loaded, in flight or failed.
//!
//! ## Core Concepts
//!
//! - **Schema**: Per-collection identity field and association layout
//! - **Normalization**: Nested graph to flat dictionary and back, depth-bounded
//! - **Store**: Reducer-driven entity state with optimistic writes
//! - **Index**: Query fingerprint to ordered id list with fetch status
//! - **EntityCache**: Orchestrator that deduplicates remote calls
//!
//! ## Usage
//!
//! ```rust,ignore
//! use recache::{EntityCache, EntitySchema, Filter, SchemaRegistry};
//!
//! let schemas = SchemaRegistry::new([
//!     EntitySchema::builder("posts").field("title").belongs_to("author", "users").build(),
//!     EntitySchema::builder("users").field("name").build(),
//! ])?;
//! let cache = EntityCache::new(schemas, transport)?;
//!
//! // Two callers asking for the same page share one remote fetch.
//! cache.ensure_index("posts", &Filter::new().with("page", 2))?.wait().await?;
//! let view = cache.index_view("posts", &Filter::new().with("page", 2))?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod changes;
pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod index;
pub mod normalize;
pub mod schema;
pub mod store;
pub mod transport;

// Re-export primary types at crate root for convenience
pub use changes::{Change, ChangeStream};
pub use config::{CacheConfig, DEFAULT_PAGE_SIZE};
pub use engine::{Dispatch, EntityCache, FlightKey, IndexView};
pub use entity::{deep_merge, CollectionName, Entity, EntityDictionary, EntityId};
pub use error::{
    CacheError, CacheResult, FilterError, NormalizeError, SchemaError, TransportError,
    ValidationErrors,
};
pub use index::{Filter, Fingerprint, IndexEntry, IndexState, IndexTransition};
pub use normalize::{
    denormalize, denormalize_many, denormalize_one, normalize, Normalized, NormalizedResult,
};
pub use schema::{Association, EntitySchema, EntitySchemaBuilder, FieldSchema, SchemaRegistry};
pub use store::{EntityStatus, PersistIntent, ReceivedEntity, StoreState, Transition};
pub use transport::{ApiContext, ApiHost, AuthContext, IndexPage, Transport};
