//! Single-flight bookkeeping.
//!
//! At most one remote operation runs per [`FlightKey`]. A key is acquired
//! when the operation is dispatched and released in the same critical
//! section that applies its result.

use std::collections::HashSet;

use tokio::task::{JoinError, JoinHandle};

use crate::entity::{CollectionName, EntityId};
use crate::error::{CacheError, CacheResult};
use crate::index::Fingerprint;

/// Identity of one remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FlightKey {
    /// List query fetch.
    Index(Fingerprint),
    /// Single-entity fetch.
    Fetch(CollectionName, EntityId),
    /// Entity write.
    Persist(CollectionName, EntityId),
    /// Entity delete.
    Delete(CollectionName, EntityId),
}

#[derive(Debug, Default)]
pub(crate) struct InFlight {
    keys: HashSet<FlightKey>,
}

impl InFlight {
    /// Returns false if the key is already taken.
    pub(crate) fn try_acquire(&mut self, key: FlightKey) -> bool {
        self.keys.insert(key)
    }

    pub(crate) fn release(&mut self, key: &FlightKey) -> bool {
        self.keys.remove(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }
}

/// Outcome of an intent that may reach the remote source.
#[derive(Debug)]
pub enum Dispatch {
    /// A task was started; await it with [`Dispatch::wait`].
    Started(JoinHandle<()>),
    /// The same operation is already running; nothing was sent.
    InFlight,
    /// No remote call is needed (already loaded, or handled locally).
    Skipped,
}

impl Dispatch {
    /// Returns true if a new task was started.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        matches!(self, Self::Started(_))
    }

    /// Returns true if the operation was deduplicated.
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, Self::InFlight)
    }

    /// Waits for the started task to apply its result.
    ///
    /// Resolves immediately for [`Dispatch::InFlight`] and [`Dispatch::Skipped`].
    pub async fn wait(self) -> CacheResult<()> {
        match self {
            Self::Started(handle) => handle.await.map_err(join_err),
            Self::InFlight | Self::Skipped => Ok(()),
        }
    }
}

fn join_err(err: JoinError) -> CacheError {
    CacheError::internal(format!("sync task did not complete: {err}"))
}
