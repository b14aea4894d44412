//! Document store access -- the search/index seam the pipeline talks through,
//! plus the checkpoint file.

pub mod checkpoint;
pub mod elastic;
pub mod schema;
pub mod sqlite;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::config::{StoreBackend, StoreConfig};
use crate::detect::Severity;

/// Shared handle to the configured store, built once at startup.
pub type SharedStore = Arc<dyn DocumentStore>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Connection(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed store response: {0}")]
    Decode(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// The subset of a search request the pipeline needs: an exclusive lower
/// bound on the timestamp, an exact severity match, a sort direction and a
/// result cap.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub after: Option<DateTime<Utc>>,
    pub severity: Option<Severity>,
    pub sort: SortOrder,
    pub size: usize,
}

impl SearchQuery {
    /// Records strictly newer than `since`, oldest first.
    pub fn newer_than(since: DateTime<Utc>, size: usize) -> Self {
        Self {
            after: Some(since),
            severity: None,
            sort: SortOrder::Ascending,
            size,
        }
    }

    /// Most recent records of one severity, newest first.
    pub fn latest_with_severity(severity: Severity, size: usize) -> Self {
        Self {
            after: None,
            severity: Some(severity),
            sort: SortOrder::Descending,
            size,
        }
    }
}

/// One search result.
#[derive(Debug, Clone)]
pub struct Hit {
    /// Concrete index the document lives in (never a pattern).
    pub index: String,
    pub id: String,
    pub source: Value,
}

/// Query/insert operations against an indexed document store.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Cheap liveness check.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn search(&self, index: &str, query: &SearchQuery) -> Result<Vec<Hit>, StoreError>;

    /// Write `document` under `id`, replacing any previous version.
    async fn index(&self, index: &str, id: &str, document: &Value) -> Result<(), StoreError>;

    async fn exists(&self, index: &str, id: &str) -> Result<bool, StoreError>;

    /// Make recent writes visible to search.
    async fn refresh(&self, _index: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Run a store call under a deadline. An elapsed deadline is reported the
/// same way as a connection failure.
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

/// Build the store client selected by the configuration.
pub fn open_store(config: &StoreConfig) -> Result<SharedStore> {
    let store: SharedStore = match config.backend {
        StoreBackend::Elasticsearch => Arc::new(elastic::ElasticStore::new(config)?),
        StoreBackend::Sqlite => Arc::new(sqlite::SqliteStore::open(
            &config.sqlite_path,
            &config.timestamp_field,
        )?),
    };
    Ok(store)
}

/// Retry `ping` until it succeeds or `attempts` are used up.
pub async fn wait_until_reachable(store: &dyn DocumentStore, config: &StoreConfig) -> Result<()> {
    let attempts = config.startup_attempts.max(1);
    for attempt in 1..=attempts {
        match with_timeout(config.timeout(), store.ping()).await {
            Ok(()) => {
                tracing::info!(attempt, "document store reachable");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(attempt, attempts, error = %e, "document store not reachable");
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_secs(config.startup_backoff_secs)).await;
                }
            }
        }
    }
    anyhow::bail!("document store unreachable after {} attempts", attempts)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowStore;

    #[async_trait::async_trait]
    impl DocumentStore for SlowStore {
        async fn ping(&self) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
        async fn search(&self, _: &str, _: &SearchQuery) -> Result<Vec<Hit>, StoreError> {
            Ok(Vec::new())
        }
        async fn index(&self, _: &str, _: &str, _: &Value) -> Result<(), StoreError> {
            Ok(())
        }
        async fn exists(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_timeout_maps_to_store_error() {
        let err = with_timeout(Duration::from_millis(10), SlowStore.ping())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_startup() {
        let config = StoreConfig {
            timeout_secs: 0,
            startup_attempts: 2,
            startup_backoff_secs: 0,
            ..StoreConfig::default()
        };
        assert!(wait_until_reachable(&SlowStore, &config).await.is_err());
    }

    #[test]
    fn test_query_builders() {
        let q = SearchQuery::latest_with_severity(Severity::Critical, 10);
        assert_eq!(q.sort, SortOrder::Descending);
        assert_eq!(q.severity, Some(Severity::Critical));
        assert!(q.after.is_none());

        let since: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
        let q = SearchQuery::newer_than(since, 2000);
        assert_eq!(q.sort, SortOrder::Ascending);
        assert_eq!(q.after, Some(since));
        assert_eq!(q.size, 2000);
    }
}
