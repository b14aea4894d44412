//! Embedded document store on SQLite.
//!
//! Documents are kept as JSON bodies keyed by `(index_name, doc_id)`. The
//! timestamp and severity are lifted into columns at write time so range and
//! term lookups stay indexed. Index names in searches are `GLOB` patterns,
//! which lets `mysql-logs-*` behave as it does on Elasticsearch.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use serde_json::Value;

use super::{schema, DocumentStore, Hit, SearchQuery, SortOrder, StoreError};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a migrated connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = FULL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Fixed-width UTC rendering so lexical order equals time order.
pub fn sortable_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
    timestamp_field: String,
}

impl SqliteStore {
    pub fn open(path: &Path, timestamp_field: &str) -> Result<Self> {
        let pool = open_pool(path)?;
        tracing::info!(path = %path.display(), "opened sqlite document store");
        Ok(Self {
            pool,
            timestamp_field: timestamp_field.to_string(),
        })
    }

    fn extract_timestamp(&self, document: &Value) -> Option<String> {
        let ts = document.get(&self.timestamp_field)?.as_str()?;
        DateTime::parse_from_rfc3339(ts)
            .ok()
            .map(|dt| sortable_timestamp(&dt.with_timezone(&Utc)))
    }
}

#[async_trait::async_trait]
impl DocumentStore for SqliteStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = pool.get()?;
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await?
    }

    async fn search(&self, index: &str, query: &SearchQuery) -> Result<Vec<Hit>, StoreError> {
        let pool = self.pool.clone();

        let mut sql = String::from("SELECT index_name, doc_id, body_json FROM documents WHERE index_name GLOB ?1");
        let mut args: Vec<String> = vec![index.to_string()];
        if let Some(after) = &query.after {
            args.push(sortable_timestamp(after));
            sql.push_str(&format!(" AND ts > ?{}", args.len()));
        }
        if let Some(severity) = &query.severity {
            args.push(severity.as_str().to_string());
            sql.push_str(&format!(" AND severity = ?{}", args.len()));
        }
        let direction = match query.sort {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        sql.push_str(&format!(
            " ORDER BY ts {dir}, rowid {dir} LIMIT {}",
            query.size,
            dir = direction
        ));

        tokio::task::spawn_blocking(move || -> Result<Vec<Hit>, StoreError> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let mut hits = Vec::new();
            for r in rows {
                let (index, id, body) = r?;
                let source = serde_json::from_str(&body)
                    .map_err(|e| StoreError::Decode(format!("document {}: {}", id, e)))?;
                hits.push(Hit { index, id, source });
            }
            Ok(hits)
        })
        .await?
    }

    async fn index(&self, index: &str, id: &str, document: &Value) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        let index = index.to_string();
        let id = id.to_string();
        let ts = self.extract_timestamp(document);
        let severity = document
            .get("severity")
            .and_then(Value::as_str)
            .map(str::to_string);
        let body = serde_json::to_string(document).map_err(|e| StoreError::Decode(e.to_string()))?;

        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = pool.get()?;
            conn.execute(
                "INSERT OR REPLACE INTO documents (index_name, doc_id, ts, severity, body_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![index, id, ts, severity, body],
            )?;
            Ok(())
        })
        .await?
    }

    async fn exists(&self, index: &str, id: &str) -> Result<bool, StoreError> {
        let pool = self.pool.clone();
        let index = index.to_string();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let conn = pool.get()?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM documents WHERE index_name = ?1 AND doc_id = ?2",
                params![index, id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await?
    }
}
