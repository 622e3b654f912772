//! Decoding packed examples into shaped tensors

use crate::config::RecordLayout;
use crate::data::error::DataError;
use crate::data::record::PackedExample;
use crate::tensor::Tensor;

/// What the consumer of a batch needs besides mixture and sources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Train,
    Eval,
    Predict,
}

impl OutputMode {
    pub fn is_training(&self) -> bool {
        matches!(self, OutputMode::Train)
    }
}

/// One excerpt ready for batching
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedExample {
    /// `[P, C]`
    pub mixture: Tensor,
    /// `[S, N, C]`
    pub sources: Tensor,
    /// `[S]`
    pub labels: Tensor,
    pub filename_id: i64,
    pub sample_id: i64,
    pub sample_rate: i64,
    pub source_names: String,
}

#[derive(Debug, Clone)]
pub struct RecordDecoder {
    layout: RecordLayout,
    use_bf16: bool,
}

impl RecordDecoder {
    pub fn new(layout: RecordLayout, use_bf16: bool) -> Self {
        Self { layout, use_bf16 }
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    /// Parse and decode one frame payload.
    pub fn decode_payload(&self, payload: &[u8]) -> Result<DecodedExample, DataError> {
        let packed = PackedExample::parse(payload)?;
        self.decode(packed)
    }

    /// Parse and decode one frame payload, keeping f32 precision whatever
    /// the output dtype. Pair with [`RecordDecoder::narrow`].
    pub fn decode_payload_f32(&self, payload: &[u8]) -> Result<DecodedExample, DataError> {
        let packed = PackedExample::parse(payload)?;
        self.decode_f32(packed)
    }

    pub fn decode(&self, packed: PackedExample) -> Result<DecodedExample, DataError> {
        self.decode_f32(packed).map(|example| self.narrow(example))
    }

    /// Cast to bf16 when low precision is on; otherwise a no-op.
    pub fn narrow(&self, mut example: DecodedExample) -> DecodedExample {
        if self.use_bf16 {
            example.mixture = example.mixture.narrow_to_bf16();
            example.sources = example.sources.narrow_to_bf16();
            example.labels = example.labels.narrow_to_bf16();
        }
        example
    }

    pub fn decode_f32(&self, packed: PackedExample) -> Result<DecodedExample, DataError> {
        let layout = &self.layout;

        let sample_rate = packed.sample_rate.unwrap_or(layout.sample_rate);
        self.check_declared("num samples", packed.num_samples, layout.num_samples)?;
        self.check_declared("channels", packed.channels, layout.channels)?;
        self.check_declared("num sources", packed.num_sources, layout.num_sources)?;

        let mut encoded = packed
            .encoded
            .ok_or_else(|| DataError::malformed("missing encoded buffer"))?;
        let expected = layout.encoded_len();
        if encoded.len() != expected {
            return Err(DataError::malformed(format!(
                "encoded buffer has {} samples, expected {}",
                encoded.len(),
                expected
            )));
        }

        let labels = packed
            .labels
            .ok_or_else(|| DataError::malformed("missing labels"))?;
        if labels.len() != layout.num_sources {
            return Err(DataError::malformed(format!(
                "{} labels for {} sources",
                labels.len(),
                layout.num_sources
            )));
        }

        let source_values = encoded.split_off(layout.mix_len * layout.channels);
        let mixture = Tensor::from_f32(encoded, layout.mixture_shape().to_vec())?;
        let sources = Tensor::from_f32(source_values, layout.sources_shape().to_vec())?;
        let labels = Tensor::from_i64(labels, vec![layout.num_sources])?;

        Ok(DecodedExample {
            mixture,
            sources,
            labels,
            filename_id: packed.file_id.unwrap_or(-1),
            sample_id: packed.sample_idx.unwrap_or(-1),
            sample_rate,
            source_names: packed.source_names.unwrap_or_default(),
        })
    }

    fn check_declared(
        &self,
        field: &str,
        declared: Option<i64>,
        expected: usize,
    ) -> Result<(), DataError> {
        match declared {
            Some(value) if value != expected as i64 => Err(DataError::malformed(format!(
                "record declares {} = {}, pipeline expects {}",
                field, value, expected
            ))),
            _ => Ok(()),
        }
    }
}
