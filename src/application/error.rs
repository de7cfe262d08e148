//! Errors returned synchronously by the job store and the engine.

use crate::domain::errors::ProbeError;
use crate::domain::jobs::{JobId, JobState};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("work queue is closed")]
pub struct QueueClosed;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid source {}: {reason}", .path.display())]
    InvalidSource { path: PathBuf, reason: String },

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {id} is already {state}")]
    InvalidState { id: JobId, state: JobState },

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error(transparent)]
    QueueClosed(#[from] QueueClosed),

    #[error("failed to open job snapshot {}: {source}", .path.display())]
    Snapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::InvalidTransition { id, from, to } => {
                EngineError::InvalidTransition { id, from, to }
            }
        }
    }
}
