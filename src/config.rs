//! Recognized configuration options for the remote-queue backend.
//!
//! Loading is an external concern — this module only defines the shape,
//! via `serde`, so an embedder can fill it from TOML, a CLI, or a test
//! fixture however suits it.

use serde::{Deserialize, Serialize};

use crate::path::TempPatterns;

/// Tuning and root-path configuration for an `RqShare`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the local cache tree.
    pub local_path: String,
    /// Root of the work/queue metadata tree.
    pub work_path: String,
    /// Base URL prepended to a remote-encoded path to form a request URL.
    pub remote_prefix: String,
    /// Tolerance, in milliseconds, for the safe-delete predicate and the
    /// cache-freshness check.
    #[serde(default = "default_modified_threshold_ms")]
    pub modified_threshold_ms: i64,
    /// Minimum age, in milliseconds, before a queue entry becomes eligible
    /// for processing.
    #[serde(default = "default_expiration_ms")]
    pub expiration_ms: i64,
    /// Retry budget before an entry is poisoned and purged.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Minimum delay, in milliseconds, between retry attempts for the same
    /// entry.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: i64,
    /// Processor loop period, in milliseconds.
    #[serde(default = "default_frequency_ms")]
    pub frequency_ms: u64,
    /// Disable the background processor (manual/test-driven sync only).
    #[serde(default)]
    pub no_processor: bool,
    /// Glob patterns (matched against the leaf name) identifying temp
    /// files that are never cached, queued, or given work markers.
    #[serde(default = "default_temp_patterns")]
    pub temp_patterns: Vec<String>,
}

fn default_modified_threshold_ms() -> i64 {
    500
}

fn default_expiration_ms() -> i64 {
    0
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> i64 {
    2_000
}

fn default_frequency_ms() -> u64 {
    1_000
}

fn default_temp_patterns() -> Vec<String> {
    crate::path::DEFAULT_TEMP_PATTERNS.iter().map(|s| s.to_string()).collect()
}

impl Config {
    /// Parse a TOML document into a `Config`.
    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Compile `temp_patterns` into a matcher, falling back to the crate
    /// defaults if compilation fails (an embedder's own config validation
    /// should normally catch a bad pattern before this point).
    pub fn temp_patterns(&self) -> TempPatterns {
        TempPatterns::compile(&self.temp_patterns).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_missing_fields() {
        let cfg: Config = Config::from_toml(
            r#"
            local_path = "/var/rq/local"
            work_path = "/var/rq/work"
            remote_prefix = "https://content.example.com"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.modified_threshold_ms, 500);
        assert_eq!(cfg.max_retries, 5);
        assert!(!cfg.no_processor);
        assert!(!cfg.temp_patterns.is_empty());
    }
}
