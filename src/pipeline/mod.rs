//! Batch sync pipeline.
//!
//! Every run flows through:
//! 1. `MessageSource::fetch_unread()`: source-specific I/O
//! 2. `StateStore::contains()`: drop ids already committed
//! 3. `Categorizer::classify()`: first-match keyword rules
//! 4. `PriorityScheduler::schedule()`: importance descending, stable
//! 5. Per item: enrichment hooks, `Sink::append_row()`, `MessageSource::mark_read()`
//! 6. `StateStore::persist()`: once, atomically
//!
//! **Nothing is recorded or marked read before the sink confirms the row.**

pub mod enrichment;
pub mod rules;
pub mod runner;
pub mod scheduler;
pub mod types;

pub use enrichment::RuleBasedEnrichment;
pub use rules::Categorizer;
pub use runner::{PipelineRunner, RunConfig, RunSummary, Timeouts};
pub use scheduler::PriorityScheduler;
