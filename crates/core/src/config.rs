//! # Orchestrator Configuration
//!
//! Tunables for stream capacities, crawl ceilings, retry budget, and
//! persistence. Loaded from `.sitescope/config.json` with `SITESCOPE_*`
//! environment overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the persisted config
pub const DEFAULT_CONFIG_PATH: &str = ".sitescope/config.json";

/// Configuration for the orchestrator and pipeline executor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Capacity of each progress stream handed to subscribers
    pub stream_capacity: usize,
    /// Capacity of the executor's internal result stream
    pub result_capacity: usize,
    /// Hard ceiling on the crawl stage, independent of caller deadlines
    pub crawl_timeout_secs: u64,
    /// Retry budget for network failures during crawl
    pub max_network_retries: u32,
    /// Fixed delay between network retries
    pub retry_delay_ms: u64,
    /// How long shutdown waits for in-flight audits to wind down
    pub shutdown_grace_secs: u64,
    /// Number of finished audits kept for status/results queries
    pub history_limit: usize,
    /// Where crawlers may write fetched content
    pub output_dir: Option<PathBuf>,
    /// SQLite file for audit records (in-memory only when unset)
    pub database_path: Option<PathBuf>,
    /// User agent sent by the reference crawler
    pub user_agent: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stream_capacity: 100,
            result_capacity: 100,
            crawl_timeout_secs: 90,
            max_network_retries: 3,
            retry_delay_ms: 2_000,
            shutdown_grace_secs: 5,
            history_limit: 256,
            output_dir: None,
            database_path: None,
            user_agent: format!("sitescope/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl OrchestratorConfig {
    /// Load from a JSON file; a missing file yields defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Persist as pretty JSON, creating the parent directory
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config {}", path.display()))
    }

    /// Apply `SITESCOPE_*` environment overrides
    pub fn merge_env(mut self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok());
        self
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(raw: Option<String>, key: &str) -> Option<T> {
            let raw = raw?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!("Ignoring invalid {}={}", key, raw);
                    None
                }
            }
        }

        if let Some(v) = parsed(lookup("SITESCOPE_STREAM_CAPACITY"), "SITESCOPE_STREAM_CAPACITY") {
            self.stream_capacity = v;
        }
        if let Some(v) = parsed(lookup("SITESCOPE_CRAWL_TIMEOUT_SECS"), "SITESCOPE_CRAWL_TIMEOUT_SECS") {
            self.crawl_timeout_secs = v;
        }
        if let Some(v) = parsed(lookup("SITESCOPE_MAX_RETRIES"), "SITESCOPE_MAX_RETRIES") {
            self.max_network_retries = v;
        }
        if let Some(v) = parsed(lookup("SITESCOPE_RETRY_DELAY_MS"), "SITESCOPE_RETRY_DELAY_MS") {
            self.retry_delay_ms = v;
        }
        if let Some(dir) = lookup("SITESCOPE_OUTPUT_DIR") {
            self.output_dir = Some(PathBuf::from(dir));
        }
        if let Some(db) = lookup("SITESCOPE_DATABASE") {
            self.database_path = Some(PathBuf::from(db));
        }
    }

    pub fn crawl_timeout(&self) -> Duration {
        Duration::from_secs(self.crawl_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
