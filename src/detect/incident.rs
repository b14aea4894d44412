use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EscalationPolicy, PipelineConfig};
use crate::detect::Severity;
use crate::storage::{with_timeout, Hit, SearchQuery, SharedStore, StoreError};

/// Status every alert is created with; later transitions belong to the
/// response tooling.
pub const STATUS_OPEN: &str = "OPEN";

/// Document written to the incident queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertDocument {
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,
    pub alert_type: String,
    pub severity: Severity,
    pub message: String,
    pub anomaly_score: f64,
    pub source: String,
    pub status: String,
    /// Id of the scored record this alert was raised for.
    pub record_id: String,
    pub created_at: DateTime<Utc>,
}

/// The fields escalation needs from a scored document.
#[derive(Debug, Deserialize)]
struct CriticalHit {
    #[serde(rename = "@timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    message: String,
    anomaly_score: f64,
}

/// Copies the newest CRITICAL results into the incident queue.
pub struct Escalator {
    store: SharedStore,
    results_index: String,
    alerts_index: String,
    policy: EscalationPolicy,
    alert_type: String,
    source_label: String,
    timeout: Duration,
}

impl Escalator {
    pub fn new(store: SharedStore, config: &PipelineConfig) -> Self {
        Self {
            store,
            results_index: config.indices.results.clone(),
            alerts_index: config.indices.alerts.clone(),
            policy: config.escalation.policy,
            alert_type: config.escalation.alert_type.clone(),
            source_label: config.escalation.source_label.clone(),
            timeout: config.store.timeout(),
        }
    }

    /// Emit one alert per CRITICAL record among the newest `limit`, and
    /// return how many were written.
    ///
    /// Under [`EscalationPolicy::Repeat`] nothing remembers earlier cycles,
    /// so a CRITICAL record still inside the lookback is alerted again.
    /// [`EscalationPolicy::Dedup`] keys alerts by record id and skips those
    /// already in the queue.
    pub async fn escalate(&self, limit: usize) -> Result<usize, StoreError> {
        let query = SearchQuery::latest_with_severity(Severity::Critical, limit);
        let hits = with_timeout(self.timeout, self.store.search(&self.results_index, &query)).await?;

        if hits.is_empty() {
            info!("no CRITICAL anomalies to escalate");
            return Ok(0);
        }

        let mut emitted = 0;
        for hit in &hits {
            let Some(alert) = self.alert_for(hit) else {
                continue;
            };

            let alert_id = match self.policy {
                EscalationPolicy::Repeat => Uuid::new_v4().to_string(),
                EscalationPolicy::Dedup => {
                    let seen = with_timeout(self.timeout, self.store.exists(&self.alerts_index, &hit.id)).await?;
                    if seen {
                        debug!(record = %hit.id, "alert already raised, skipping");
                        continue;
                    }
                    hit.id.clone()
                }
            };

            let doc = serde_json::to_value(&alert).map_err(|e| StoreError::Decode(e.to_string()))?;
            with_timeout(self.timeout, self.store.index(&self.alerts_index, &alert_id, &doc)).await?;
            warn!(
                alert = %alert_id,
                record = %hit.id,
                score = alert.anomaly_score,
                "CRITICAL anomaly escalated"
            );
            emitted += 1;
        }

        info!(emitted, candidates = hits.len(), "escalation finished");
        Ok(emitted)
    }

    fn alert_for(&self, hit: &Hit) -> Option<AlertDocument> {
        let critical: CriticalHit = match serde_json::from_value(hit.source.clone()) {
            Ok(c) => c,
            Err(e) => {
                warn!(record = %hit.id, error = %e, "unreadable CRITICAL result, not escalated");
                return None;
            }
        };
        Some(AlertDocument {
            timestamp: critical.timestamp,
            alert_type: self.alert_type.clone(),
            severity: Severity::Critical,
            message: critical.message,
            anomaly_score: critical.anomaly_score,
            source: self.source_label.clone(),
            status: STATUS_OPEN.to_string(),
            record_id: hit.id.clone(),
            created_at: Utc::now(),
        })
    }
}
