//! Offline shard statistics: one full read of a split, no batching

use crate::data::decode::RecordDecoder;
use crate::data::error::DataError;
use crate::data::filter::ValidityFilter;
use crate::data::record::ShardReader;
use crate::data::shards::{ShardLocator, Split};
use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShardSummary {
    pub path: PathBuf,
    pub records: usize,
    pub malformed: usize,
    pub non_finite: usize,
    pub valid: usize,
    /// The file ends inside a frame
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplitSummary {
    pub split: String,
    pub shards: Vec<ShardSummary>,
}

impl SplitSummary {
    pub fn records(&self) -> usize {
        self.shards.iter().map(|s| s.records).sum()
    }

    pub fn malformed(&self) -> usize {
        self.shards.iter().map(|s| s.malformed).sum()
    }

    pub fn non_finite(&self) -> usize {
        self.shards.iter().map(|s| s.non_finite).sum()
    }

    pub fn valid(&self) -> usize {
        self.shards.iter().map(|s| s.valid).sum()
    }

    /// Full batches one pass would yield.
    pub fn full_batches(&self, batch_size: usize) -> usize {
        self.valid() / batch_size.max(1)
    }
}

/// Reads every shard of `split` in parallel and counts what the pipeline
/// would keep.
pub fn inspect_split(
    locator: &ShardLocator,
    split: Split,
    decoder: &RecordDecoder,
    buffer_bytes: usize,
) -> Result<SplitSummary, DataError> {
    let paths = locator.locate(split)?;
    let shards = paths
        .par_iter()
        .map(|path| inspect_shard(path, decoder, buffer_bytes))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SplitSummary {
        split: split.file_prefix().to_string(),
        shards,
    })
}

fn inspect_shard(
    path: &Path,
    decoder: &RecordDecoder,
    buffer_bytes: usize,
) -> Result<ShardSummary, DataError> {
    let filter = ValidityFilter::new();
    let mut reader = ShardReader::open(path, buffer_bytes)?;
    let mut summary = ShardSummary {
        path: path.to_path_buf(),
        ..Default::default()
    };

    loop {
        let payload = match reader.next_payload() {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(DataError::TruncatedShard { .. }) => {
                summary.truncated = true;
                break;
            }
            Err(e) => return Err(e),
        };
        summary.records += 1;
        match decoder.decode_payload_f32(&payload) {
            Ok(example) if filter.keep(&example) => summary.valid += 1,
            Ok(_) => summary.non_finite += 1,
            Err(_) => summary.malformed += 1,
        }
    }
    Ok(summary)
}
