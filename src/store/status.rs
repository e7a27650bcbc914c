use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-entity bookkeeping of in-progress operations.
///
/// At most one of `fetching`, `persisting` and `deleting` is expected to be
/// set at a time. This is not enforced: the orchestrating layer must not race
/// a persist against a delete of the same entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityStatus {
    /// No authoritative server copy is known (unknown, optimistic or being deleted).
    pub transient: bool,
    /// A fetch is in flight.
    pub fetching: bool,
    /// A persist is in flight.
    pub persisting: bool,
    /// A delete is in flight.
    pub deleting: bool,
    /// Request time of the newest server data applied to this entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_at: Option<DateTime<Utc>>,
}

impl EntityStatus {
    /// Returns true if any remote operation is in flight.
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        self.fetching || self.persisting || self.deleting
    }

    /// Returns true if a server copy has been applied and is not being replaced.
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        !self.transient && self.valid_at.is_some()
    }

    /// Returns true if data stamped `at` would be older than what is applied.
    #[must_use]
    pub fn is_newer_than(&self, at: DateTime<Utc>) -> bool {
        self.valid_at.is_some_and(|current| current > at)
    }
}
