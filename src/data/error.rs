use crate::tensor::TensorError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("no shard files match {pattern}")]
    NoShardsFound { pattern: String },

    #[error("invalid shard pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("non-finite sample in {tensor} at index {index}")]
    NonFiniteSample { tensor: &'static str, index: usize },

    #[error("shard {}: {source}", path.display())]
    ShardIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("shard {} ends inside a record frame", path.display())]
    TruncatedShard { path: PathBuf },

    #[error(transparent)]
    Tensor(#[from] TensorError),

    #[error("input pipeline failed: {0}")]
    Pipeline(String),
}

impl DataError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        DataError::MalformedRecord(reason.into())
    }

    /// Per-record failures the pipeline absorbs instead of surfacing.
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            DataError::MalformedRecord(_) | DataError::NonFiniteSample { .. }
        )
    }
}
