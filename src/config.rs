//! TOML configuration for the querywatch pipeline.
//!
//! Every section has defaults matching the stock MySQL-on-Elasticsearch
//! deployment, so a partial file (or no file at all) yields a runnable setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detect::severity::SeverityThresholds;

/// Environment variable naming a config file to load.
pub const CONFIG_ENV: &str = "QUERYWATCH_CONFIG";

/// System-wide config location checked when no explicit path is given.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/querywatch/querywatch.toml";

/// Largest accepted `ingest.fallback_window_mins` (200 years).
pub const MAX_FALLBACK_WINDOW_MINS: i64 = 200 * 365 * 24 * 60;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the pipeline process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub indices: IndexConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub severity: SeverityThresholds,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded pipeline configuration");
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. An explicit path (from the command line). Errors here are fatal.
    /// 2. The path in `QUERYWATCH_CONFIG`.
    /// 3. `/etc/querywatch/querywatch.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "QUERYWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ingest.page_size == 0 {
            anyhow::bail!("ingest.page_size must be at least 1");
        }
        if self.ingest.poll_interval_secs == 0 {
            anyhow::bail!("ingest.poll_interval_secs must be at least 1");
        }
        if !(0..=MAX_FALLBACK_WINDOW_MINS).contains(&self.ingest.fallback_window_mins) {
            anyhow::bail!(
                "ingest.fallback_window_mins must be in 0..={}, got {}",
                MAX_FALLBACK_WINDOW_MINS,
                self.ingest.fallback_window_mins
            );
        }
        if self.store.timeout_secs == 0 {
            anyhow::bail!("store.timeout_secs must be at least 1");
        }
        if self.model.min_batch_size > self.ingest.page_size {
            anyhow::bail!(
                "model.min_batch_size ({}) cannot exceed ingest.page_size ({})",
                self.model.min_batch_size,
                self.ingest.page_size
            );
        }
        if !(self.model.contamination > 0.0 && self.model.contamination <= 0.5) {
            anyhow::bail!(
                "model.contamination must be in (0, 0.5], got {}",
                self.model.contamination
            );
        }
        if self.model.n_estimators == 0 {
            anyhow::bail!("model.n_estimators must be at least 1");
        }
        if self.model.max_samples == 0 {
            anyhow::bail!("model.max_samples must be at least 1");
        }
        if self.escalation.limit == 0 {
            anyhow::bail!("escalation.limit must be at least 1");
        }
        self.severity.validate()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Which document store implementation to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Remote Elasticsearch cluster over its REST API.
    Elasticsearch,
    /// Embedded SQLite file, for standalone runs and replay.
    Sqlite,
}

/// Document store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Base URL of the Elasticsearch cluster.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Database file for the SQLite backend.
    pub sqlite_path: PathBuf,
    /// Upper bound on any single store call.
    pub timeout_secs: u64,
    /// Reachability attempts at startup before giving up.
    pub startup_attempts: u32,
    pub startup_backoff_secs: u64,
    /// Document field carrying the record timestamp.
    pub timestamp_field: String,
    /// Document field carrying the raw log line.
    pub message_field: String,
    /// Field used for exact severity matches (keyword sub-field on Elasticsearch).
    pub severity_term_field: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Elasticsearch,
            url: "http://localhost:9200".to_string(),
            username: None,
            password: None,
            sqlite_path: PathBuf::from("data/querywatch.db"),
            timeout_secs: 10,
            startup_attempts: 5,
            startup_backoff_secs: 5,
            timestamp_field: "@timestamp".to_string(),
            message_field: "message".to_string(),
            severity_term_field: "severity.keyword".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Indices
// ---------------------------------------------------------------------------

/// Logical index (collection) names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Raw query logs, may be a wildcard pattern.
    pub source: String,
    /// Every scored record lands here.
    pub results: String,
    /// Incident queue for escalated alerts.
    pub alerts: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            source: "mysql-logs-*".to_string(),
            results: "mysql-logs-ai".to_string(),
            alerts: "mysql-soar-alerts".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

/// Polling and checkpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Maximum records fetched per cycle.
    pub page_size: usize,
    pub poll_interval_secs: u64,
    /// Sleep after a failed cycle.
    pub recovery_interval_secs: u64,
    pub checkpoint_path: PathBuf,
    /// How far back the first run looks when no checkpoint exists.
    pub fallback_window_mins: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            page_size: 2000,
            poll_interval_secs: 60,
            recovery_interval_secs: 30,
            checkpoint_path: PathBuf::from("last_processed_time.txt"),
            fallback_window_mins: 15,
        }
    }
}

impl IngestConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

/// What `rows_examined` becomes when the payload does not carry it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowsFallback {
    /// Character length of the raw message.
    #[default]
    MessageLength,
    Zero,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub rows_fallback: RowsFallback,
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Isolation forest hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Expected outlier proportion.
    pub contamination: f64,
    /// Number of trees.
    pub n_estimators: usize,
    /// Subsample size per tree (capped at the batch size).
    pub max_samples: usize,
    pub seed: u64,
    /// Batches smaller than this are not scored.
    pub min_batch_size: usize,
    /// Feature vectors retained from earlier cycles as extra training data.
    pub window_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            contamination: 0.03,
            n_estimators: 120,
            max_samples: 256,
            seed: 42,
            min_batch_size: 1,
            window_size: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Escalation
// ---------------------------------------------------------------------------

/// Whether CRITICAL records are re-alerted on every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationPolicy {
    /// Emit an alert for every CRITICAL hit, every cycle.
    #[default]
    Repeat,
    /// Emit at most one alert per scored record.
    Dedup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Lookback: how many of the newest CRITICAL records to consider.
    pub limit: usize,
    pub policy: EscalationPolicy,
    pub alert_type: String,
    /// Value of the alert's `source` field.
    pub source_label: String,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            policy: EscalationPolicy::Repeat,
            alert_type: "MYSQL_AI_ANOMALY".to_string(),
            source_label: "SOAR".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
