//! Configuration types, built from environment variables.
//!
//! Every `from_env()` has a `from_lookup()` twin that reads from a closure,
//! so parsing can be tested without touching the process environment.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::pipeline::runner::{RunConfig, Timeouts};

/// Variable lookup, normally `std::env::var(key).ok()`.
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

pub(crate) fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Value of `key`, treating unset and blank the same.
pub(crate) fn optional(lookup: Lookup<'_>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn required(lookup: Lookup<'_>, key: &str) -> Result<String, ConfigError> {
    optional(lookup, key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

/// Parse `key`, falling back to `default` only when it is unset.
///
/// A value that is set but does not parse is an error, never the default.
pub(crate) fn parse_or<T>(lookup: Lookup<'_>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match optional(lookup, key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
    }
}

fn positive<T>(lookup: Lookup<'_>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
    T::Err: Display,
{
    let value = parse_or(lookup, key, default)?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".into(),
        });
    }
    Ok(value)
}

fn secs(lookup: Lookup<'_>, key: &str, default: u64) -> Result<Duration, ConfigError> {
    positive(lookup, key, default).map(Duration::from_secs)
}

/// Which sink rows are written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Sheets,
    Jsonl,
}

impl FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sheets" => Ok(Self::Sheets),
            "jsonl" => Ok(Self::Jsonl),
            other => Err(format!("unknown sink '{other}', expected sheets or jsonl")),
        }
    }
}

/// Which enrichment hooks run for each message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentKind {
    Rules,
    None,
}

impl FromStr for EnrichmentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rules" => Ok(Self::Rules),
            "none" => Ok(Self::None),
            other => Err(format!("unknown enrichment '{other}', expected rules or none")),
        }
    }
}

/// Top-level sync configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Durable state ledger location.
    pub state_file: PathBuf,
    /// JSON rules file; built-in rules when unset.
    pub rules_file: Option<PathBuf>,
    pub sink: SinkKind,
    /// Output file for the JSONL sink.
    pub jsonl_path: PathBuf,
    pub enrichment: EnrichmentKind,
    /// Write an analytics report over all committed rows after each run.
    pub analytics: bool,
    /// Directory the analytics report is written to.
    pub analytics_dir: PathBuf,
    pub run: RunConfig,
}

impl SyncConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let folders: Vec<String> = optional(lookup, "INBOX_SYNC_FOLDERS")
            .unwrap_or_else(|| "INBOX".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if folders.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "INBOX_SYNC_FOLDERS".into(),
                message: "no folder names given".into(),
            });
        }

        let timeouts = Timeouts {
            fetch: secs(lookup, "INBOX_SYNC_FETCH_TIMEOUT_SECS", 120)?,
            commit: secs(lookup, "INBOX_SYNC_COMMIT_TIMEOUT_SECS", 30)?,
            enrich: secs(lookup, "INBOX_SYNC_ENRICH_TIMEOUT_SECS", 10)?,
            mark_read: secs(lookup, "INBOX_SYNC_MARK_READ_TIMEOUT_SECS", 30)?,
            persist: secs(lookup, "INBOX_SYNC_PERSIST_TIMEOUT_SECS", 15)?,
        };

        let run = RunConfig {
            max_results: positive(lookup, "INBOX_SYNC_MAX_RESULTS", 10usize)?,
            folders,
            timeouts,
            commit_attempts: positive(lookup, "INBOX_SYNC_COMMIT_ATTEMPTS", 1u32)?,
        };

        Ok(Self {
            state_file: optional(lookup, "INBOX_SYNC_STATE_FILE")
                .unwrap_or_else(|| "./state.json".to_string())
                .into(),
            rules_file: optional(lookup, "INBOX_SYNC_RULES_FILE").map(PathBuf::from),
            sink: parse_or(lookup, "INBOX_SYNC_SINK", SinkKind::Sheets)?,
            jsonl_path: optional(lookup, "INBOX_SYNC_JSONL_PATH")
                .unwrap_or_else(|| "./emails.jsonl".to_string())
                .into(),
            enrichment: parse_or(lookup, "INBOX_SYNC_ENRICHMENT", EnrichmentKind::Rules)?,
            analytics: parse_or(lookup, "INBOX_SYNC_ANALYTICS", false)?,
            analytics_dir: optional(lookup, "INBOX_SYNC_ANALYTICS_DIR")
                .unwrap_or_else(|| "./analytics".to_string())
                .into(),
            run,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let env = lookup_from(&[]);
        let config = SyncConfig::from_lookup(&env).unwrap();
        assert_eq!(config.state_file, PathBuf::from("./state.json"));
        assert_eq!(config.sink, SinkKind::Sheets);
        assert_eq!(config.enrichment, EnrichmentKind::Rules);
        assert_eq!(config.run, RunConfig::default());
        assert!(config.rules_file.is_none());
        assert!(!config.analytics);
        assert_eq!(config.analytics_dir, PathBuf::from("./analytics"));
    }

    #[test]
    fn reads_overrides() {
        let env = lookup_from(&[
            ("INBOX_SYNC_STATE_FILE", "/var/lib/sync/state.json"),
            ("INBOX_SYNC_MAX_RESULTS", "25"),
            ("INBOX_SYNC_FOLDERS", "INBOX, Receipts ,"),
            ("INBOX_SYNC_SINK", "JSONL"),
            ("INBOX_SYNC_ENRICHMENT", "none"),
            ("INBOX_SYNC_COMMIT_TIMEOUT_SECS", "5"),
            ("INBOX_SYNC_COMMIT_ATTEMPTS", "3"),
            ("INBOX_SYNC_ANALYTICS", "true"),
            ("INBOX_SYNC_ANALYTICS_DIR", "/tmp/reports"),
        ]);
        let config = SyncConfig::from_lookup(&env).unwrap();
        assert_eq!(config.run.max_results, 25);
        assert_eq!(config.run.folders, vec!["INBOX", "Receipts"]);
        assert_eq!(config.sink, SinkKind::Jsonl);
        assert_eq!(config.enrichment, EnrichmentKind::None);
        assert_eq!(config.run.timeouts.commit, Duration::from_secs(5));
        assert_eq!(config.run.commit_attempts, 3);
        assert!(config.analytics);
        assert_eq!(config.analytics_dir, PathBuf::from("/tmp/reports"));
    }

    #[test]
    fn bad_number_is_an_error_not_a_default() {
        let env = lookup_from(&[("INBOX_SYNC_MAX_RESULTS", "ten")]);
        let err = SyncConfig::from_lookup(&env).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "INBOX_SYNC_MAX_RESULTS"
        ));
    }

    #[test]
    fn analytics_flag_must_be_a_bool() {
        let env = lookup_from(&[("INBOX_SYNC_ANALYTICS", "sometimes")]);
        assert!(SyncConfig::from_lookup(&env).is_err());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let env = lookup_from(&[("INBOX_SYNC_PERSIST_TIMEOUT_SECS", "0")]);
        assert!(SyncConfig::from_lookup(&env).is_err());
    }

    #[test]
    fn unknown_sink_is_rejected() {
        let env = lookup_from(&[("INBOX_SYNC_SINK", "csv")]);
        let err = SyncConfig::from_lookup(&env).unwrap_err();
        assert!(err.to_string().contains("unknown sink"));
    }

    #[test]
    fn blank_folders_rejected() {
        let env = lookup_from(&[("INBOX_SYNC_FOLDERS", " , ")]);
        assert!(SyncConfig::from_lookup(&env).is_err());
    }

    #[test]
    fn required_treats_blank_as_missing() {
        let env = lookup_from(&[("SOME_KEY", "   ")]);
        assert!(matches!(
            required(&env, "SOME_KEY"),
            Err(ConfigError::MissingEnvVar(_))
        ));
    }
}
