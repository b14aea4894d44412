//! Load JSON-lines log documents into the source index.
//!
//! Meant for the SQLite backend: replaying a captured slow-log export gives
//! the pipeline something to chew on without a live shipper.

use std::io::BufRead;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use uuid::Uuid;

use crate::storage::{with_timeout, DocumentStore};

/// Index every JSON object line from `reader`; blank lines are skipped.
/// Document ids are derived from the line content, so replaying the same
/// file twice does not duplicate anything.
pub async fn replay_lines<R: BufRead>(
    store: &dyn DocumentStore,
    index: &str,
    reader: R,
    timeout: Duration,
) -> Result<usize> {
    let mut indexed = 0;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", lineno + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let doc: Value = serde_json::from_str(trimmed)
            .with_context(|| format!("line {} is not valid JSON", lineno + 1))?;
        if !doc.is_object() {
            anyhow::bail!("line {} is not a JSON object", lineno + 1);
        }
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, trimmed.as_bytes()).to_string();
        with_timeout(timeout, store.index(index, &id, &doc))
            .await
            .with_context(|| format!("failed to index line {}", lineno + 1))?;
        indexed += 1;
    }
    tracing::info!(indexed, %index, "replay finished");
    Ok(indexed)
}
