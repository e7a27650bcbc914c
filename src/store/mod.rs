//! Entity store.
//!
//! The authoritative in-memory map of collection → id → entity, with a
//! parallel status overlay and error maps. All mutation goes through
//! [`Transition`]s applied by [`StoreState::reduce`].

mod state;
mod status;
mod transition;

pub use state::StoreState;
pub use status::EntityStatus;
pub use transition::{PersistIntent, ReceivedEntity, Transition};
