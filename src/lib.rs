//! Inbox sync: unread mail → categorize → prioritize → tabular sink, exactly once.

pub mod analytics;
pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod sinks;
pub mod store;

pub use error::{Error, Result};
