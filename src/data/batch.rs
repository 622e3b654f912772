//! Fixed-shape batch assembly

use crate::data::decode::{DecodedExample, OutputMode};
use crate::data::error::DataError;
use crate::tensor::{Tensor, TensorError};

/// Per-example identifiers carried by non-training batches, each `[batch_size]`
#[derive(Debug, Clone, PartialEq)]
pub struct SideChannel {
    pub filename_ids: Tensor,
    pub sample_ids: Tensor,
}

/// Model inputs of a batch; each mode carries exactly what it needs.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchFeatures {
    Train {
        mixture: Tensor,
        labels: Tensor,
    },
    Eval {
        mixture: Tensor,
        labels: Tensor,
        ids: SideChannel,
    },
    Predict {
        mixture: Tensor,
        labels: Tensor,
        ids: SideChannel,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    batch_size: usize,
    features: BatchFeatures,
    /// `[B, S, N, C]`
    sources: Tensor,
}

impl Batch {
    /// Every tensor must lead with exactly `batch_size`.
    pub fn new(
        batch_size: usize,
        features: BatchFeatures,
        sources: Tensor,
    ) -> Result<Self, DataError> {
        let batch = Self {
            batch_size,
            features,
            sources,
        };
        batch.check_leading_dims()?;
        Ok(batch)
    }

    fn check_leading_dims(&self) -> Result<(), DataError> {
        let mut tensors = vec![
            ("mixture", self.mixture()),
            ("labels", self.labels()),
            ("sources", &self.sources),
        ];
        if let Some(ids) = self.side_channel() {
            tensors.push(("filename_ids", &ids.filename_ids));
            tensors.push(("sample_ids", &ids.sample_ids));
        }
        for (name, tensor) in tensors {
            if tensor.shape().first() != Some(&self.batch_size) {
                return Err(DataError::Pipeline(format!(
                    "{} has shape {:?}, expected leading dimension {}",
                    name,
                    tensor.shape(),
                    self.batch_size
                )));
            }
        }
        Ok(())
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn mode(&self) -> OutputMode {
        match self.features {
            BatchFeatures::Train { .. } => OutputMode::Train,
            BatchFeatures::Eval { .. } => OutputMode::Eval,
            BatchFeatures::Predict { .. } => OutputMode::Predict,
        }
    }

    pub fn features(&self) -> &BatchFeatures {
        &self.features
    }

    /// `[B, P, C]`
    pub fn mixture(&self) -> &Tensor {
        match &self.features {
            BatchFeatures::Train { mixture, .. }
            | BatchFeatures::Eval { mixture, .. }
            | BatchFeatures::Predict { mixture, .. } => mixture,
        }
    }

    /// `[B, S]`
    pub fn labels(&self) -> &Tensor {
        match &self.features {
            BatchFeatures::Train { labels, .. }
            | BatchFeatures::Eval { labels, .. }
            | BatchFeatures::Predict { labels, .. } => labels,
        }
    }

    pub fn sources(&self) -> &Tensor {
        &self.sources
    }

    pub fn side_channel(&self) -> Option<&SideChannel> {
        match &self.features {
            BatchFeatures::Train { .. } => None,
            BatchFeatures::Eval { ids, .. } | BatchFeatures::Predict { ids, .. } => Some(ids),
        }
    }
}

/// Groups examples into batches of exactly `batch_size`; a short tail is
/// dropped, never emitted.
#[derive(Debug)]
pub struct BatchAssembler {
    batch_size: usize,
    mode: OutputMode,
    pending: Vec<DecodedExample>,
    emitted: usize,
}

impl BatchAssembler {
    pub fn new(batch_size: usize, mode: OutputMode) -> Self {
        Self {
            batch_size: batch_size.max(1),
            mode,
            pending: Vec::with_capacity(batch_size),
            emitted: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn push(&mut self, example: DecodedExample) -> Result<Option<Batch>, DataError> {
        self.pending.push(example);
        if self.pending.len() < self.batch_size {
            return Ok(None);
        }
        let examples = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size));
        let batch = self.assemble(&examples)?;
        self.emitted += 1;
        Ok(Some(batch))
    }

    /// End of stream; returns how many trailing examples were dropped.
    pub fn finish(mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    fn assemble(&self, examples: &[DecodedExample]) -> Result<Batch, DataError> {
        let stack = |pick: fn(&DecodedExample) -> &Tensor| -> Result<Tensor, TensorError> {
            let items: Vec<&Tensor> = examples.iter().map(pick).collect();
            Tensor::stack(&items)
        };
        let mixture = stack(|e| &e.mixture)?;
        let sources = stack(|e| &e.sources)?;
        let labels = stack(|e| &e.labels)?;

        let features = match self.mode {
            OutputMode::Train => BatchFeatures::Train { mixture, labels },
            OutputMode::Eval => BatchFeatures::Eval {
                mixture,
                labels,
                ids: self.side_channel(examples)?,
            },
            OutputMode::Predict => BatchFeatures::Predict {
                mixture,
                labels,
                ids: self.side_channel(examples)?,
            },
        };
        Batch::new(self.batch_size, features, sources)
    }

    fn side_channel(&self, examples: &[DecodedExample]) -> Result<SideChannel, TensorError> {
        let filename_ids = examples.iter().map(|e| e.filename_id).collect();
        let sample_ids = examples.iter().map(|e| e.sample_id).collect();
        Ok(SideChannel {
            filename_ids: Tensor::from_i64(filename_ids, vec![self.batch_size])?,
            sample_ids: Tensor::from_i64(sample_ids, vec![self.batch_size])?,
        })
    }
}
