//! Tabular sinks receiving one row per processed message.

pub mod jsonl;
pub mod sheets;

pub use jsonl::JsonlSink;
pub use sheets::{SheetsConfig, SheetsSink};
