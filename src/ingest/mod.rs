//! Incremental log ingestion from the source index.

pub mod features;
pub mod replay;

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::storage::{with_timeout, Hit, SearchQuery, SharedStore, StoreError};

/// One raw query-log record. Read-only to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Concrete index the record was read from.
    pub source_index: String,
    /// Document id in the source index, when the store provides one.
    pub source_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub raw_message: String,
}

impl LogRecord {
    /// Build a record from a search hit. Returns `None` when the timestamp
    /// field is missing or unparseable.
    pub fn from_hit(hit: &Hit, timestamp_field: &str, message_field: &str) -> Option<Self> {
        let timestamp = parse_timestamp(hit.source.get(timestamp_field)?)?;
        let raw_message = match hit.source.get(message_field) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        Some(Self {
            source_index: hit.index.clone(),
            source_id: (!hit.id.is_empty()).then(|| hit.id.clone()),
            timestamp,
            raw_message,
        })
    }

    /// Deterministic id for everything derived from this record, so a
    /// re-processed record overwrites its earlier result. Source ids are
    /// only unique per index, so the index is part of the name.
    pub fn stable_id(&self) -> String {
        let name = match &self.source_id {
            Some(id) => format!("source:{}/{}", self.source_index, id),
            None => format!(
                "{}\n{}",
                self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
                self.raw_message
            ),
        };
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }
}

/// Accepts RFC 3339 strings and epoch milliseconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Result of one fetch.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<LogRecord>,
    /// The store holds more records newer than the checkpoint than were
    /// returned.
    pub has_more: bool,
}

/// Reads records newer than a checkpoint from the source index.
pub struct LogSource {
    store: SharedStore,
    index: String,
    /// Excluded even when the source pattern matches it.
    results_index: String,
    timestamp_field: String,
    message_field: String,
    timeout: Duration,
}

impl LogSource {
    pub fn new(store: SharedStore, config: &PipelineConfig) -> Self {
        Self {
            store,
            index: config.indices.source.clone(),
            results_index: config.indices.results.clone(),
            timestamp_field: config.store.timestamp_field.clone(),
            message_field: config.store.message_field.clone(),
            timeout: config.store.timeout(),
        }
    }

    /// Up to `limit` records with `timestamp > since`, oldest first. Scored
    /// documents are skipped when the source pattern also covers the
    /// results index.
    ///
    /// One extra record is requested to look past the page boundary. If it
    /// shares the timestamp of the page's last record, the trailing records
    /// with that timestamp are held back for the next fetch; otherwise the
    /// ones left on the next page would fall behind the exclusive lower
    /// bound and never be read. A page made of a single tied timestamp
    /// cannot be trimmed, so the whole run of that timestamp is returned
    /// instead, even past `limit`.
    pub async fn fetch(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<LogRecord>, StoreError> {
        Ok(self.fetch_page(since, limit).await?.records)
    }

    /// Like [`LogSource::fetch`], also reporting whether a backlog remains.
    pub async fn fetch_page(&self, since: DateTime<Utc>, limit: usize) -> Result<Page, StoreError> {
        let size = limit.saturating_add(1);
        let hits = self.search(since, size).await?;

        // The extra hit only marks where the next page starts.
        let boundary = hits.get(limit).and_then(|h| self.hit_timestamp(h));

        let has_more = hits.len() > limit;
        let mut records = self.collect(&hits[..hits.len().min(limit)], since);
        let (Some(first), Some(last)) = (records.first(), records.last()) else {
            return Ok(Page { records, has_more });
        };
        if boundary != Some(last.timestamp) {
            return Ok(Page { records, has_more });
        }

        if first.timestamp == last.timestamp {
            let tied = last.timestamp;
            warn!(
                %tied,
                page = limit,
                "page holds a single timestamp that continues past it, reading the whole run"
            );
            return self.fetch_tied_run(since, tied, size).await;
        }

        trim_trailing_ties(&mut records);
        Ok(Page { records, has_more })
    }

    /// Every record at `tied`, the oldest timestamp newer than `since`.
    /// The request grows until the store returns something newer than
    /// `tied` or runs out of records.
    async fn fetch_tied_run(
        &self,
        since: DateTime<Utc>,
        tied: DateTime<Utc>,
        mut size: usize,
    ) -> Result<Page, StoreError> {
        loop {
            size = size.saturating_mul(2);
            let hits = self.search(since, size).await?;
            let exhausted = hits.len() < size || size == usize::MAX;
            let run_ended = hits
                .last()
                .and_then(|h| self.hit_timestamp(h))
                .is_some_and(|ts| ts > tied);
            if exhausted || run_ended {
                let mut records = self.collect(&hits, since);
                records.retain(|r| r.timestamp == tied);
                debug!(count = records.len(), %tied, "read tied run");
                return Ok(Page { records, has_more: run_ended });
            }
        }
    }

    async fn search(&self, since: DateTime<Utc>, size: usize) -> Result<Vec<Hit>, StoreError> {
        let query = SearchQuery::newer_than(since, size);
        with_timeout(self.timeout, self.store.search(&self.index, &query)).await
    }

    fn hit_timestamp(&self, hit: &Hit) -> Option<DateTime<Utc>> {
        hit.source.get(&self.timestamp_field).and_then(parse_timestamp)
    }

    /// Usable source records among `hits`, sorted by timestamp.
    fn collect(&self, hits: &[Hit], since: DateTime<Utc>) -> Vec<LogRecord> {
        let mut records: Vec<LogRecord> = Vec::with_capacity(hits.len());
        for hit in hits {
            if hit.index == self.results_index {
                continue;
            }
            match LogRecord::from_hit(hit, &self.timestamp_field, &self.message_field) {
                Some(r) if r.timestamp > since => records.push(r),
                Some(_) => debug!(id = %hit.id, "dropping record at or before checkpoint"),
                None => warn!(id = %hit.id, "skipping record without a usable timestamp"),
            }
        }
        records.sort_by_key(|r| r.timestamp);
        records
    }
}

fn trim_trailing_ties(records: &mut Vec<LogRecord>) {
    let Some(last) = records.last().map(|r| r.timestamp) else {
        return;
    };
    let keep = records
        .iter()
        .rposition(|r| r.timestamp < last)
        .map(|i| i + 1)
        .unwrap_or(records.len());
    if keep < records.len() {
        debug!(held_back = records.len() - keep, "holding back records tied at page boundary");
        records.truncate(keep);
    }
}
