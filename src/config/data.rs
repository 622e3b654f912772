use serde::{Deserialize, Serialize};

/// Fixed sample rate of the corpus
pub const SAMPLE_RATE: i64 = 22050;
/// Samples per source excerpt (model output length)
pub const NUM_SAMPLES: usize = 16384;
/// Mixture length including the model's input context
pub const MIX_WITH_PADDING: usize = 147443;
/// Always mono
pub const CHANNELS: usize = 1;
/// 13 instrument stems, the mix is stored separately
pub const NUM_SOURCES: usize = 13;

/// Degree of concurrency for a pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Concurrency {
    /// Resolved from host parallelism when the pipeline starts
    Auto,
    Fixed(usize),
}

impl Concurrency {
    pub fn resolve(self) -> usize {
        match self {
            Concurrency::Fixed(n) => n.max(1),
            Concurrency::Auto => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// Tensor geometry every record of the corpus must match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    pub mix_len: usize,
    pub num_sources: usize,
    pub num_samples: usize,
    pub channels: usize,
    pub sample_rate: i64,
}

impl RecordLayout {
    /// Length of the packed buffer: padded mixture followed by every source.
    pub fn encoded_len(&self) -> usize {
        (self.mix_len + self.num_sources * self.num_samples) * self.channels
    }

    pub fn mixture_shape(&self) -> [usize; 2] {
        [self.mix_len, self.channels]
    }

    pub fn sources_shape(&self) -> [usize; 3] {
        [self.num_sources, self.num_samples, self.channels]
    }
}

impl Default for RecordLayout {
    fn default() -> Self {
        Self {
            mix_len: MIX_WITH_PADDING,
            num_sources: NUM_SOURCES,
            num_samples: NUM_SAMPLES,
            channels: CHANNELS,
            sample_rate: SAMPLE_RATE,
        }
    }
}

/// Input pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub mix_with_padding: usize,
    pub num_sources: usize,
    pub num_samples: usize,
    pub channels: usize,
    pub sample_rate: i64,

    /// Shards read concurrently by the interleaver (training split only)
    pub cycle_length: Concurrency,
    /// Batches the producers may run ahead of the training step
    pub prefetch_batches: Concurrency,
    /// Decoded examples each shard reader may queue ahead of the interleaver
    pub read_ahead: usize,
    /// Buffered reader capacity per open shard
    pub read_buffer_bytes: usize,

    /// Cast decoded tensors to bf16
    pub use_bf16: bool,
    /// Shuffle training shard order each pass
    pub shuffle_shards: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            mix_with_padding: MIX_WITH_PADDING,
            num_sources: NUM_SOURCES,
            num_samples: NUM_SAMPLES,
            channels: CHANNELS,
            sample_rate: SAMPLE_RATE,
            cycle_length: Concurrency::Fixed(6),
            prefetch_batches: Concurrency::Auto,
            read_ahead: 16,
            read_buffer_bytes: 8 * 1024 * 1024,
            use_bf16: false,
            shuffle_shards: false,
        }
    }
}

impl DataConfig {
    pub fn layout(&self) -> RecordLayout {
        RecordLayout {
            mix_len: self.mix_with_padding,
            num_sources: self.num_sources,
            num_samples: self.num_samples,
            channels: self.channels,
            sample_rate: self.sample_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_matches_corpus() {
        let layout = DataConfig::default().layout();
        assert_eq!(layout.encoded_len(), 147443 + 13 * 16384);
        assert_eq!(layout.sources_shape(), [13, 16384, 1]);
    }

    #[test]
    fn test_concurrency_serde() {
        let auto: Concurrency = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(auto, Concurrency::Auto);
        let fixed: Concurrency = serde_json::from_str("{\"fixed\": 3}").unwrap();
        assert_eq!(fixed.resolve(), 3);
        assert!(Concurrency::Auto.resolve() >= 1);
    }
}
