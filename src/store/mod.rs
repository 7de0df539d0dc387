//! Persistence layer: the JSON state ledger of committed message ids.

pub mod state;

pub use state::{ProcessingState, STATE_SCHEMA_VERSION, StateStats, StateStore};
