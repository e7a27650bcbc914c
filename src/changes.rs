//! Change notifications.
//!
//! Every transition applied by [`crate::EntityCache`] is announced to all
//! subscribers. Delivery uses bounded channels and `try_send`: a slow
//! subscriber loses notifications (counted) instead of stalling the writer.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;

use crate::entity::{CollectionName, EntityId};
use crate::index::{Fingerprint, IndexTransition};
use crate::store::Transition;

/// What changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Change {
    /// One entity's content or status changed.
    Entity {
        kind: &'static str,
        collection: CollectionName,
        id: EntityId,
    },
    /// A batch of entities was received.
    Entities {
        kind: &'static str,
        count: usize,
    },
    /// A query index entry changed.
    Index {
        kind: &'static str,
        fingerprint: Fingerprint,
    },
}

impl Change {
    /// Transition name that produced this change.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Entity { kind, .. } | Self::Entities { kind, .. } | Self::Index { kind, .. } => {
                *kind
            }
        }
    }
}

impl From<&Transition> for Change {
    fn from(transition: &Transition) -> Self {
        let kind = transition.kind();
        match (transition, transition.target()) {
            (_, Some((collection, id))) => Self::Entity {
                kind,
                collection: collection.clone(),
                id: id.clone(),
            },
            (Transition::ReceiveMany { entities, .. }, None) => Self::Entities {
                kind,
                count: entities.len(),
            },
            (_, None) => Self::Entities { kind, count: 0 },
        }
    }
}

impl From<&IndexTransition> for Change {
    fn from(transition: &IndexTransition) -> Self {
        Self::Index {
            kind: transition.kind(),
            fingerprint: transition.fingerprint(),
        }
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct ChangeStream {
    rx: Receiver<Change>,
}

impl ChangeStream {
    /// Next pending change, without waiting.
    #[must_use]
    pub fn try_recv(&self) -> Option<Change> {
        self.rx.try_recv().ok()
    }

    /// Waits up to `timeout` for the next change.
    ///
    /// Returns `None` on timeout or once the cache is gone.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Change> {
        match self.rx.recv_timeout(timeout) {
            Ok(change) => Some(change),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// All changes queued so far.
    #[must_use]
    pub fn drain(&self) -> Vec<Change> {
        self.rx.try_iter().collect()
    }
}

/// Fan-out of changes to subscribers.
#[derive(Debug)]
pub(crate) struct ChangeFeed {
    capacity: usize,
    subscribers: Vec<Sender<Change>>,
    dropped: u64,
}

impl ChangeFeed {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Vec::new(),
            dropped: 0,
        }
    }

    pub(crate) fn subscribe(&mut self) -> ChangeStream {
        let (tx, rx) = bounded(self.capacity);
        self.subscribers.push(tx);
        ChangeStream { rx }
    }

    pub(crate) fn publish(&mut self, change: &Change) {
        if self.subscribers.is_empty() {
            return;
        }
        let mut dropped = 0u64;
        self.subscribers
            .retain(|tx| match tx.try_send(change.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
        self.dropped = self.dropped.saturating_add(dropped);
    }

    /// Notifications lost to full subscriber buffers.
    pub(crate) const fn dropped(&self) -> u64 {
        self.dropped
    }
}
