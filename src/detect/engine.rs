use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::detect::anomaly::{score_batch, ForestParams, Point};
use crate::detect::severity::SeverityThresholds;
use crate::detect::{DetectError, ScoredRecord};
use crate::ingest::features::FeatureExtractor;
use crate::ingest::LogRecord;
use crate::storage::checkpoint::{CheckpointError, CheckpointStore};
use crate::storage::{with_timeout, SharedStore, StoreError};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("persisted {written} of {total} scored records: {source}")]
    Partial {
        written: usize,
        total: usize,
        #[source]
        source: StoreError,
    },
    #[error("failed to save checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// Scores batches of log records and writes the results.
///
/// The forest is refit on every call to [`AnomalyEngine::score`]; the only
/// state carried between cycles is the optional window of earlier feature
/// vectors used as extra training data.
pub struct AnomalyEngine {
    store: SharedStore,
    checkpoint: CheckpointStore,
    extractor: FeatureExtractor,
    params: ForestParams,
    thresholds: SeverityThresholds,
    results_index: String,
    min_batch_size: usize,
    window_size: usize,
    window: VecDeque<Point>,
    timeout: Duration,
}

impl AnomalyEngine {
    pub fn new(store: SharedStore, checkpoint: CheckpointStore, config: &PipelineConfig) -> Self {
        Self {
            store,
            checkpoint,
            extractor: FeatureExtractor::new(config.features.rows_fallback),
            params: ForestParams::from(&config.model),
            thresholds: config.severity,
            results_index: config.indices.results.clone(),
            min_batch_size: config.model.min_batch_size.max(1),
            window_size: config.model.window_size,
            window: VecDeque::with_capacity(config.model.window_size),
            timeout: config.store.timeout(),
        }
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    /// Whether a batch of `len` records is large enough to score under
    /// `model.min_batch_size`.
    pub fn check_batch(&self, len: usize) -> Result<(), DetectError> {
        if len < self.min_batch_size {
            return Err(DetectError::InsufficientBatch {
                needed: self.min_batch_size,
                have: len,
            });
        }
        Ok(())
    }

    /// Extract features, fit a fresh forest and classify every record.
    /// Output order matches `records`. The minimum batch size is left to
    /// the caller, see [`AnomalyEngine::check_batch`].
    pub fn score(&self, records: &[LogRecord]) -> Result<Vec<ScoredRecord>, DetectError> {
        let features = self.extractor.extract_all(records);
        let points: Vec<Point> = features.iter().map(|f| f.to_point()).collect();

        let verdicts = if self.window.is_empty() {
            score_batch(&points, &points, &self.params)?
        } else {
            let mut training: Vec<Point> = self.window.iter().copied().collect();
            training.extend_from_slice(&points);
            debug!(window = self.window.len(), batch = points.len(), "fitting on window + batch");
            score_batch(&training, &points, &self.params)?
        };

        let scored: Vec<ScoredRecord> = records
            .iter()
            .zip(features)
            .zip(verdicts)
            .map(|((record, fv), verdict)| {
                let severity = self.thresholds.classify(verdict.anomaly_score);
                ScoredRecord::new(record, fv, verdict.anomaly_flag, verdict.anomaly_score, severity)
            })
            .collect();

        let flagged = scored.iter().filter(|r| r.anomaly_flag).count();
        info!(records = scored.len(), flagged, "batch scored");
        Ok(scored)
    }

    /// Write every scored record to the results index, then advance the
    /// checkpoint to the last record's timestamp. Returns the new checkpoint,
    /// or `None` for an empty batch.
    ///
    /// On a failed write the checkpoint only moves up to confirmed records
    /// strictly older than the failed one, so nothing unpersisted is skipped.
    pub async fn persist(&mut self, scored: &[ScoredRecord]) -> Result<Option<DateTime<Utc>>, PersistError> {
        let Some(last) = scored.last() else {
            return Ok(None);
        };

        for (i, record) in scored.iter().enumerate() {
            let doc = match serde_json::to_value(record) {
                Ok(doc) => doc,
                Err(e) => {
                    let source = StoreError::Decode(e.to_string());
                    return Err(self.partial_failure(scored, i, source).await);
                }
            };
            let write = self.store.index(&self.results_index, &record.id, &doc);
            if let Err(source) = with_timeout(self.timeout, write).await {
                return Err(self.partial_failure(scored, i, source).await);
            }
        }

        self.checkpoint.commit(last.timestamp).await?;
        info!(count = scored.len(), checkpoint = %last.timestamp, "scored records persisted");

        if let Err(e) = with_timeout(self.timeout, self.store.refresh(&self.results_index)).await {
            warn!(index = %self.results_index, error = %e, "results index refresh failed");
        }

        self.remember(scored);
        Ok(Some(last.timestamp))
    }

    async fn partial_failure(&self, scored: &[ScoredRecord], failed_at: usize, source: StoreError) -> PersistError {
        let failed_ts = scored[failed_at].timestamp;
        let safe = scored[..failed_at]
            .iter()
            .rev()
            .find(|r| r.timestamp < failed_ts)
            .map(|r| r.timestamp);

        if let Some(ts) = safe {
            if let Err(e) = self.checkpoint.commit(ts).await {
                return PersistError::Checkpoint(e);
            }
            warn!(checkpoint = %ts, written = failed_at, "checkpoint advanced to last confirmed write");
        }

        PersistError::Partial {
            written: failed_at,
            total: scored.len(),
            source,
        }
    }

    fn remember(&mut self, scored: &[ScoredRecord]) {
        if self.window_size == 0 {
            return;
        }
        for r in scored {
            if self.window.len() == self.window_size {
                self.window.pop_front();
            }
            self.window.push_back([r.query_time, r.rows_examined as f64]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Severity;
    use crate::storage::sqlite::SqliteStore;
    use crate::storage::{DocumentStore, Hit, SearchQuery, SortOrder};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn record(secs: u32, message: &str) -> LogRecord {
        LogRecord {
            source_index: "mysql-logs-a".to_string(),
            source_id: None,
            timestamp: format!("2024-01-01T00:{:02}:{:02}Z", secs / 60, secs % 60)
                .parse()
                .unwrap(),
            raw_message: message.to_string(),
        }
    }

    fn config(dir: &tempfile::TempDir) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.ingest.checkpoint_path = dir.path().join("checkpoint");
        config
    }

    /// Accepts the first `fail_after` writes, then refuses.
    struct FlakyStore {
        writes: AtomicUsize,
        fail_after: usize,
    }

    #[async_trait::async_trait]
    impl DocumentStore for FlakyStore {
        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
        async fn search(&self, _: &str, _: &SearchQuery) -> Result<Vec<Hit>, StoreError> {
            Ok(Vec::new())
        }
        async fn index(&self, _: &str, _: &str, _: &Value) -> Result<(), StoreError> {
            if self.writes.fetch_add(1, Ordering::SeqCst) >= self.fail_after {
                return Err(StoreError::Connection("connection reset".to_string()));
            }
            Ok(())
        }
        async fn exists(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    #[test]
    fn test_score_preserves_order_and_classifies() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = config(&dir);
        let store = Arc::new(FlakyStore { writes: AtomicUsize::new(0), fail_after: 0 });
        let engine = AnomalyEngine::new(store, CheckpointStore::new(&cfg.ingest.checkpoint_path, 15), &cfg);

        let mut records: Vec<LogRecord> = (0..60)
            .map(|i| record(i, r#"{"query_time": 0.01, "rows_examined": 50}"#))
            .collect();
        records.push(record(60, r#"{"query_time": 9.0, "rows_examined": 900000}"#));

        let scored = engine.score(&records).unwrap();
        assert_eq!(scored.len(), records.len());
        for (s, r) in scored.iter().zip(&records) {
            assert_eq!(s.timestamp, r.timestamp);
            assert_eq!(s.severity, cfg.severity.classify(s.anomaly_score));
        }
        let outlier = scored.last().unwrap();
        assert!(outlier.anomaly_flag);
        assert_eq!(outlier.severity, Severity::Critical);
        assert!(scored[..60].iter().all(|s| !s.anomaly_flag));
    }

    #[test]
    fn test_min_batch_size_guard() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.model.min_batch_size = 10;
        let store = Arc::new(FlakyStore { writes: AtomicUsize::new(0), fail_after: 0 });
        let engine = AnomalyEngine::new(store, CheckpointStore::new(&cfg.ingest.checkpoint_path, 15), &cfg);

        let err = engine.check_batch(3).unwrap_err();
        assert!(matches!(err, DetectError::InsufficientBatch { needed: 10, have: 3 }));
        engine.check_batch(10).unwrap();

        // an empty batch still cannot be fit
        let err = engine.score(&[]).unwrap_err();
        assert!(matches!(err, DetectError::InsufficientBatch { have: 0, .. }));
    }

    #[tokio::test]
    async fn test_persist_writes_all_and_advances_checkpoint() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = config(&dir);
        let sqlite = SqliteStore::open(&dir.path().join("s.db"), "@timestamp").unwrap();
        let store: SharedStore = Arc::new(sqlite);
        let checkpoint = CheckpointStore::new(&cfg.ingest.checkpoint_path, 15);
        let mut engine = AnomalyEngine::new(store.clone(), checkpoint.clone(), &cfg);

        let records: Vec<LogRecord> = (0..20).map(|i| record(i, &format!("q{}", i))).collect();
        let scored = engine.score(&records).unwrap();
        let advanced = engine.persist(&scored).await.unwrap();

        assert_eq!(advanced, Some(records[19].timestamp));
        assert_eq!(checkpoint.read(), Some(records[19].timestamp));

        let all = SearchQuery { after: None, severity: None, sort: SortOrder::Ascending, size: 100 };
        let hits = store.search(&cfg.indices.results, &all).await.unwrap();
        assert_eq!(hits.len(), 20);

        // persisting the same batch again overwrites instead of duplicating
        engine.persist(&scored).await.unwrap();
        let hits = store.search(&cfg.indices.results, &all).await.unwrap();
        assert_eq!(hits.len(), 20);
    }

    #[tokio::test]
    async fn test_persist_empty_batch_is_noop() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = config(&dir);
        let store = Arc::new(FlakyStore { writes: AtomicUsize::new(0), fail_after: 0 });
        let checkpoint = CheckpointStore::new(&cfg.ingest.checkpoint_path, 15);
        let mut engine = AnomalyEngine::new(store, checkpoint.clone(), &cfg);

        assert_eq!(engine.persist(&[]).await.unwrap(), None);
        assert!(checkpoint.read().is_none());
    }

    #[tokio::test]
    async fn test_partial_failure_withholds_checkpoint() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = config(&dir);
        let store = Arc::new(FlakyStore { writes: AtomicUsize::new(0), fail_after: 3 });
        let checkpoint = CheckpointStore::new(&cfg.ingest.checkpoint_path, 15);
        let mut engine = AnomalyEngine::new(store, checkpoint.clone(), &cfg);

        // records 2 and 3 share a timestamp; 3 is the one that fails
        let records = vec![record(1, "a"), record(2, "b"), record(3, "c"), record(3, "d"), record(4, "e")];
        let scored = engine.score(&records).unwrap();
        let err = engine.persist(&scored).await.unwrap_err();

        assert!(matches!(err, PersistError::Partial { written: 3, total: 5, .. }));
        assert_eq!(checkpoint.read(), Some(records[1].timestamp));
    }

    #[tokio::test]
    async fn test_window_feeds_later_fits() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.model.window_size = 50;
        let store = Arc::new(FlakyStore { writes: AtomicUsize::new(0), fail_after: usize::MAX });
        let mut engine = AnomalyEngine::new(store, CheckpointStore::new(&cfg.ingest.checkpoint_path, 15), &cfg);

        let history: Vec<LogRecord> = (0..40)
            .map(|i| record(i, r#"{"query_time": 0.01, "rows_examined": 50}"#))
            .collect();
        let scored = engine.score(&history).unwrap();
        engine.persist(&scored).await.unwrap();
        assert_eq!(engine.window.len(), 40);

        // a lone slow query is judged against the remembered history
        let batch = vec![record(100, r#"{"query_time": 8.0, "rows_examined": 50}"#)];
        let scored = engine.score(&batch).unwrap();
        assert!(scored[0].anomaly_flag);
    }
}
