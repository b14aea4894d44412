//! Score-to-severity bucketing.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::detect::Severity;

/// Upper (exclusive) score bounds for each severity bucket.
///
/// A score below `critical` is CRITICAL, below `high` is HIGH, below
/// `medium` is MEDIUM, anything else is LOW.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityThresholds {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            critical: -0.15,
            high: -0.08,
            medium: -0.03,
        }
    }
}

impl SeverityThresholds {
    /// Map an anomaly score to its bucket. Total over all f64 values;
    /// NaN compares false everywhere and lands in LOW.
    pub fn classify(&self, score: f64) -> Severity {
        if score < self.critical {
            Severity::Critical
        } else if score < self.high {
            Severity::High
        } else if score < self.medium {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn validate(&self) -> Result<()> {
        let all_finite = [self.critical, self.high, self.medium]
            .iter()
            .all(|t| t.is_finite());
        if !all_finite {
            anyhow::bail!("severity thresholds must be finite");
        }
        if !(self.critical <= self.high && self.high <= self.medium) {
            anyhow::bail!(
                "severity thresholds must satisfy critical <= high <= medium (got {}, {}, {})",
                self.critical,
                self.high,
                self.medium
            );
        }
        Ok(())
    }
}
