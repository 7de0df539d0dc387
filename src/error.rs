//! Error types for inbox-sync.
//!
//! Fatal errors surface through [`Error`]. Per-item failures (`SinkError`,
//! `EnrichmentError`) are recorded on the item's `ProcessingRecord` and never
//! escape the item boundary.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for a run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Source fetch failed: {0}")]
    SourceFetch(#[source] SourceError),

    #[error("State corruption: {0}")]
    StateCorruption(#[source] StateError),

    #[error(
        "State persist failed ({} committed item(s) not recorded): {source}",
        .unrecorded.len()
    )]
    StatePersist {
        #[source]
        source: StateError,
        /// Identifiers committed to the sink this run but absent from durable state.
        unrecorded: Vec<String>,
    },
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid category rule '{category}': {reason}")]
    InvalidRule { category: String, reason: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Credential rejected by the mail source or sink.
#[derive(Debug, thiserror::Error)]
#[error("Authentication failed for {service}: {reason}")]
pub struct AuthError {
    pub service: String,
    pub reason: String,
}

/// Mail source errors.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown message id: {0}")]
    UnknownMessage(String),

    #[error("Source call timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sink commit errors.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Sink request failed: {0}")]
    Request(String),

    #[error("Sink rejected row with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Sink call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unreadable sink response: {0}")]
    Response(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SinkError {
    /// Whether the failed commit is known not to have reached the sink.
    ///
    /// Only requests that never left the client and explicit rate limiting
    /// qualify. A 5xx, a timeout or an IO error may follow a landed write.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request(_) => true,
            Self::Rejected { status, .. } => *status == 429,
            Self::Timeout(_) | Self::Response(_) | Self::Serialization(_) | Self::Io(_) => false,
        }
    }
}

/// Best-effort enrichment hook errors.
#[derive(Debug, thiserror::Error)]
pub enum EnrichmentError {
    #[error("Hook {hook} failed: {reason}")]
    Failed { hook: String, reason: String },

    #[error("Hook {hook} timed out after {timeout:?}")]
    Timeout { hook: String, timeout: Duration },
}

/// Analytics report errors. Never fatal to a run.
#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    #[error("Could not read rows back from the sink: {0}")]
    Read(#[from] SinkError),

    #[error("Failed to write report {path}: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// State ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("State file {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Unsupported state schema version {found} in {path} (expected {expected})")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("Failed to write state file {path}: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("State persist timed out after {0:?}; the write may still reach disk")]
    Timeout(Duration),
}

/// Result type alias for a run.
pub type Result<T> = std::result::Result<T, Error>;
