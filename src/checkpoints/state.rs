// Checkpoint metadata and error types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Tensor name holding the JSON metadata blob
pub const METADATA_TENSOR: &str = "_metadata";
pub const EXP_AVG_PREFIX: &str = "optimizer.exp_avg.";
pub const EXP_AVG_SQ_PREFIX: &str = "optimizer.exp_avg_sq.";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("checkpoint {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("checkpoint I/O failed for {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CheckpointError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        CheckpointError::Corrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CheckpointError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Scalars stored next to the tensors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub global_step: u64,
    pub phase: usize,
    pub experiment_id: u64,
    pub adam_step: u64,
    /// RFC 3339
    pub saved_at: String,
}
