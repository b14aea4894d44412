//! Anomaly scoring, severity bucketing and escalation.

pub mod anomaly;
pub mod engine;
pub mod incident;
pub mod severity;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ingest::features::FeatureVector;
use crate::ingest::LogRecord;

/// Engine label stamped on every scored document.
pub const ENGINE_LABEL: &str = "IsolationForest";

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("insufficient batch: need {needed} records, have {have}")]
    InsufficientBatch { needed: usize, have: usize },
    #[error("feature vector {index} contains a non-finite value")]
    NonFiniteFeature { index: usize },
}

/// Severity bucket of a scored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A log record with its features and model verdict, as persisted to the
/// results index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredRecord {
    /// Stable document id, derived from the source record.
    #[serde(skip)]
    pub id: String,
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub query_time: f64,
    pub rows_examined: u64,
    #[serde(rename = "anomaly")]
    pub anomaly_flag: bool,
    pub anomaly_score: f64,
    pub severity: Severity,
    pub engine: String,
}

impl ScoredRecord {
    pub fn new(
        record: &LogRecord,
        features: FeatureVector,
        anomaly_flag: bool,
        anomaly_score: f64,
        severity: Severity,
    ) -> Self {
        Self {
            id: record.stable_id(),
            timestamp: record.timestamp,
            message: record.raw_message.clone(),
            query_time: features.query_time,
            rows_examined: features.rows_examined,
            anomaly_flag,
            anomaly_score,
            severity,
            engine: ENGINE_LABEL.to_string(),
        }
    }
}
