//! Query index.
//!
//! Maps a `(collection, filter)` query to the cached, ordered ids of its
//! result page plus the total count and readiness flags.

mod filter;
mod fingerprint;
mod state;

pub use filter::Filter;
pub use fingerprint::Fingerprint;
pub use state::{IndexEntry, IndexState, IndexTransition};
