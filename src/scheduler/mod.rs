//! Cycle driver: fetch, score, persist, escalate, sleep, repeat.

pub mod engine;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::detect::engine::PersistError;
use crate::detect::DetectError;
use crate::storage::checkpoint::CheckpointError;
use crate::storage::StoreError;

pub use self::engine::Pipeline;

/// Where the driver is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CycleState {
    Idle,
    Fetching,
    Scoring,
    Persisting,
    Escalating,
    Sleeping,
}

impl std::fmt::Display for CycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CycleState::Idle => "idle",
            CycleState::Fetching => "fetching",
            CycleState::Scoring => "scoring",
            CycleState::Persisting => "persisting",
            CycleState::Escalating => "escalating",
            CycleState::Sleeping => "sleeping",
        };
        f.write_str(s)
    }
}

/// Why a cycle stopped early. Everything except `Fatal` is retried on the
/// next cycle.
#[derive(Debug, Error)]
pub enum CycleFault {
    #[error("document store fault: {0}")]
    Transient(#[from] StoreError),
    #[error("model fit failed: {0}")]
    ModelFit(#[from] DetectError),
    #[error("{0}")]
    Persistence(PersistError),
    #[error("checkpoint could not be saved: {0}")]
    Fatal(#[from] CheckpointError),
}

impl CycleFault {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CycleFault::Fatal(_))
    }
}

impl From<PersistError> for CycleFault {
    fn from(e: PersistError) -> Self {
        match e {
            PersistError::Checkpoint(inner) => CycleFault::Fatal(inner),
            partial @ PersistError::Partial { .. } => CycleFault::Persistence(partial),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub fetched: usize,
    pub persisted: usize,
    pub flagged: usize,
    pub critical: usize,
    pub escalated: usize,
    /// Records left for a later cycle because the batch was below
    /// `model.min_batch_size`.
    pub deferred: usize,
    pub checkpoint: Option<DateTime<Utc>>,
    /// Set when cancellation stopped the cycle between states.
    pub interrupted: bool,
}
