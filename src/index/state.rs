use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::entity::{CollectionName, EntityId};
use crate::error::TransportError;

use super::filter::Filter;
use super::fingerprint::Fingerprint;

/// Cached result of one list query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    /// Queried collection.
    pub collection: CollectionName,
    /// Canonical filter the entry was fetched with.
    pub filter: Filter,
    /// Ids of the page, in server order.
    pub ordered_ids: Vec<EntityId>,
    /// Total matching entities reported by the server.
    pub existing_count: Option<u64>,
    /// A fetch is in flight.
    pub fetching: bool,
    /// At least one fetch has completed successfully.
    pub ready: bool,
    /// Error of the most recent failed fetch.
    pub error: Option<TransportError>,
    /// Request time of the data in `ordered_ids`.
    pub valid_at: Option<DateTime<Utc>>,
}

impl IndexEntry {
    fn new(collection: CollectionName, filter: Filter) -> Self {
        Self {
            collection,
            filter,
            ordered_ids: Vec::new(),
            existing_count: None,
            fetching: false,
            ready: false,
            error: None,
            valid_at: None,
        }
    }

    /// 1-based page number of this entry's window.
    #[must_use]
    pub fn page(&self) -> Option<u64> {
        self.filter.page()
    }
}

/// Event driving the query index.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexTransition {
    /// A fetch was dispatched; creates the entry on first use.
    Attempt {
        fingerprint: Fingerprint,
        collection: CollectionName,
        filter: Filter,
    },
    /// A fetch completed.
    Receive {
        fingerprint: Fingerprint,
        ordered_ids: Vec<EntityId>,
        existing_count: Option<u64>,
        valid_at: DateTime<Utc>,
    },
    /// A fetch failed.
    Failed {
        fingerprint: Fingerprint,
        error: TransportError,
    },
}

impl IndexTransition {
    /// Fingerprint the transition applies to.
    #[must_use]
    pub const fn fingerprint(&self) -> Fingerprint {
        match self {
            Self::Attempt { fingerprint, .. }
            | Self::Receive { fingerprint, .. }
            | Self::Failed { fingerprint, .. } => *fingerprint,
        }
    }

    /// Short name used in logs and change notifications.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Attempt { .. } => "index_attempt",
            Self::Receive { .. } => "index_receive",
            Self::Failed { .. } => "index_failed",
        }
    }
}

/// All index entries, keyed by fingerprint. Entries are never evicted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct IndexState {
    entries: BTreeMap<Fingerprint, IndexEntry>,
}

impl IndexState {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `transition` and returns the resulting state.
    #[must_use]
    pub fn reduce(mut self, transition: IndexTransition) -> Self {
        self.apply(transition);
        self
    }

    /// In-place form of [`IndexState::reduce`].
    pub fn apply(&mut self, transition: IndexTransition) {
        match transition {
            IndexTransition::Attempt {
                fingerprint,
                collection,
                filter,
            } => {
                self.entries
                    .entry(fingerprint)
                    .or_insert_with(|| IndexEntry::new(collection, filter))
                    .fetching = true;
            }
            IndexTransition::Receive {
                fingerprint,
                ordered_ids,
                existing_count,
                valid_at,
            } => {
                let Some(entry) = self.entries.get_mut(&fingerprint) else {
                    warn!(%fingerprint, "index result for unknown query");
                    return;
                };
                entry.ordered_ids = ordered_ids;
                entry.existing_count = existing_count;
                entry.ready = true;
                entry.fetching = false;
                entry.error = None;
                entry.valid_at = Some(valid_at);
            }
            IndexTransition::Failed { fingerprint, error } => {
                let Some(entry) = self.entries.get_mut(&fingerprint) else {
                    warn!(%fingerprint, "index failure for unknown query");
                    return;
                };
                entry.fetching = false;
                entry.error = Some(error);
            }
        }
    }

    /// Entry for a fingerprint.
    #[must_use]
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&IndexEntry> {
        self.entries.get(fingerprint)
    }

    /// Iterates all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&Fingerprint, &IndexEntry)> {
        self.entries.iter()
    }

    /// Number of cached queries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no query is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
