//! querywatch -- continuous anomaly detection over database query logs.
//!
//! Polls a document store for new slow-query log records, scores them with
//! an isolation forest, writes every scored record back, and escalates
//! CRITICAL ones into an incident queue.

pub mod config;
pub mod detect;
pub mod ingest;
pub mod scheduler;
pub mod storage;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::scheduler::{CycleReport, Pipeline};

/// Connect to the configured store and run the pipeline until `token` is
/// cancelled or a fatal fault occurs.
pub async fn run(config: &PipelineConfig, token: CancellationToken) -> Result<()> {
    let store = storage::open_store(&config.store)?;
    storage::wait_until_reachable(store.as_ref(), &config.store).await?;
    Pipeline::new(store, config).run(token).await
}

/// Run exactly one cycle and return what it did.
pub async fn run_once(config: &PipelineConfig) -> Result<CycleReport> {
    let store = storage::open_store(&config.store)?;
    storage::wait_until_reachable(store.as_ref(), &config.store).await?;
    let mut pipeline = Pipeline::new(store, config);
    let report = pipeline.run_cycle(&CancellationToken::new()).await?;
    Ok(report)
}
