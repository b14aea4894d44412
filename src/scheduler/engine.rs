use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::PipelineConfig;
use crate::detect::engine::AnomalyEngine;
use crate::detect::incident::Escalator;
use crate::detect::Severity;
use crate::ingest::LogSource;
use crate::scheduler::{CycleFault, CycleReport, CycleState};
use crate::storage::checkpoint::CheckpointStore;
use crate::storage::SharedStore;

/// The whole detection pipeline, driven one cycle at a time.
pub struct Pipeline {
    source: LogSource,
    engine: AnomalyEngine,
    escalator: Escalator,
    page_size: usize,
    escalation_limit: usize,
    poll_interval: Duration,
    recovery_interval: Duration,
    state: CycleState,
}

impl Pipeline {
    pub fn new(store: SharedStore, config: &PipelineConfig) -> Self {
        let checkpoint = CheckpointStore::new(
            config.ingest.checkpoint_path.clone(),
            config.ingest.fallback_window_mins,
        );
        Self {
            source: LogSource::new(store.clone(), config),
            engine: AnomalyEngine::new(store.clone(), checkpoint, config),
            escalator: Escalator::new(store, config),
            page_size: config.ingest.page_size,
            escalation_limit: config.escalation.limit,
            poll_interval: config.ingest.poll_interval(),
            recovery_interval: config.ingest.recovery_interval(),
            state: CycleState::Idle,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Move to `next` unless cancellation was requested.
    fn transition(&mut self, next: CycleState, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            debug!(state = %self.state, "cancellation requested, stopping");
            return false;
        }
        debug!(from = %self.state, to = %next, "cycle state");
        self.state = next;
        true
    }

    /// Run one fetch-score-persist-escalate cycle.
    ///
    /// A fault before persistence leaves the checkpoint untouched. A fault
    /// during escalation keeps the batch that was already persisted.
    pub async fn run_cycle(&mut self, token: &CancellationToken) -> Result<CycleReport, CycleFault> {
        let mut report = CycleReport::default();
        let result = self.cycle_steps(token, &mut report).await;
        self.state = CycleState::Idle;
        result.map(|()| report)
    }

    async fn cycle_steps(&mut self, token: &CancellationToken, report: &mut CycleReport) -> Result<(), CycleFault> {
        if !self.transition(CycleState::Fetching, token) {
            report.interrupted = true;
            return Ok(());
        }
        let since = self.engine.checkpoint().load();
        let page = self.source.fetch_page(since, self.page_size).await?;
        let records = page.records;
        report.fetched = records.len();

        if records.is_empty() {
            info!(%since, "no new logs found");
        } else if let (false, Err(short)) = (page.has_more, self.engine.check_batch(records.len())) {
            // A short batch with a backlog behind it is scored anyway.
            info!(%since, reason = %short, "batch deferred until more records arrive");
            report.deferred = records.len();
        } else {
            if !self.transition(CycleState::Scoring, token) {
                report.interrupted = true;
                return Ok(());
            }
            let scored = self.engine.score(&records)?;
            report.flagged = scored.iter().filter(|r| r.anomaly_flag).count();
            report.critical = scored.iter().filter(|r| r.severity == Severity::Critical).count();

            if !self.transition(CycleState::Persisting, token) {
                report.interrupted = true;
                return Ok(());
            }
            report.checkpoint = self.engine.persist(&scored).await?;
            report.persisted = scored.len();
        }

        if !self.transition(CycleState::Escalating, token) {
            report.interrupted = true;
            return Ok(());
        }
        report.escalated = self.escalator.escalate(self.escalation_limit).await?;
        Ok(())
    }

    /// Loop until cancelled. Recoverable faults are logged and retried after
    /// the recovery interval; a fatal fault ends the loop with an error.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        info!(
            poll_secs = self.poll_interval.as_secs(),
            page_size = self.page_size,
            "pipeline started"
        );

        loop {
            let pause = match self.run_cycle(&token).await {
                Ok(report) if report.interrupted => break,
                Ok(report) => {
                    info!(
                        fetched = report.fetched,
                        flagged = report.flagged,
                        critical = report.critical,
                        escalated = report.escalated,
                        "cycle complete"
                    );
                    self.poll_interval
                }
                Err(fault) if fault.is_fatal() => {
                    error!(error = %fault, "unrecoverable fault, stopping pipeline");
                    return Err(fault.into());
                }
                Err(fault) => {
                    error!(error = %fault, retry_secs = self.recovery_interval.as_secs(), "cycle aborted");
                    self.recovery_interval
                }
            };

            if !self.transition(CycleState::Sleeping, &token) {
                break;
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
            self.state = CycleState::Idle;
        }

        info!("pipeline stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStore;
    use crate::storage::{DocumentStore, Hit, SearchQuery, StoreError};
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct DownStore;

    #[async_trait::async_trait]
    impl DocumentStore for DownStore {
        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }
        async fn search(&self, _: &str, _: &SearchQuery) -> Result<Vec<Hit>, StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }
        async fn index(&self, _: &str, _: &str, _: &Value) -> Result<(), StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }
        async fn exists(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }
    }

    fn config(dir: &tempfile::TempDir) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.ingest.checkpoint_path = dir.path().join("checkpoint");
        config.ingest.poll_interval_secs = 1;
        config.ingest.recovery_interval_secs = 1;
        config
    }

    #[tokio::test]
    async fn test_store_outage_aborts_cycle_without_checkpoint() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = config(&dir);
        let mut pipeline = Pipeline::new(Arc::new(DownStore), &cfg);

        let fault = pipeline.run_cycle(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(fault, CycleFault::Transient(_)));
        assert!(!fault.is_fatal());
        assert_eq!(pipeline.state(), CycleState::Idle);
        assert!(!cfg.ingest.checkpoint_path.exists());
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_fetch() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = config(&dir);
        let mut pipeline = Pipeline::new(Arc::new(DownStore), &cfg);
        let token = CancellationToken::new();
        token.cancel();

        let report = pipeline.run_cycle(&token).await.unwrap();
        assert!(report.interrupted);
        assert_eq!(report.fetched, 0);
    }

    #[tokio::test]
    async fn test_run_loop_survives_faults_until_cancelled() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = config(&dir);
        let pipeline = Pipeline::new(Arc::new(DownStore), &cfg);
        let token = CancellationToken::new();

        let handle = tokio::spawn(pipeline.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        tokio_test::assert_ok!(result);
    }

    #[tokio::test]
    async fn test_cycle_reports_counts() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = config(&dir);
        let sqlite = SqliteStore::open(&dir.path().join("s.db"), "@timestamp").unwrap();
        let now = chrono::Utc::now();
        for i in 0..30 {
            let ts = now - chrono::Duration::seconds(60 - i);
            sqlite
                .index(
                    "mysql-logs-1",
                    &format!("d{}", i),
                    &json!({ "@timestamp": ts.to_rfc3339(), "message": "{\"query_time\": 0.02, \"rows_examined\": 10}" }),
                )
                .await
                .unwrap();
        }

        let mut pipeline = Pipeline::new(Arc::new(sqlite), &cfg);
        let report = pipeline.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.fetched, 30);
        assert_eq!(report.persisted, 30);
        assert_eq!(report.flagged, 0);
        assert_eq!(report.escalated, 0);
        assert!(report.checkpoint.is_some());

        let report = pipeline.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.fetched, 0);
        assert!(report.checkpoint.is_none());
    }
}
