//! Message sources.

pub mod imap;

pub use imap::{ImapConfig, ImapSource};
