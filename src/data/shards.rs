//! Shard discovery and ordering

use crate::data::error::DataError;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};

/// Dataset split; selects the shard file prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Eval,
}

impl Split {
    pub fn file_prefix(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Eval => "test",
        }
    }
}

/// Shard file order policy for the training split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShufflePolicy {
    Sequential,
    Seeded(u64),
}

#[derive(Debug, Clone)]
pub struct ShardLocator {
    root: PathBuf,
    shuffle: ShufflePolicy,
    /// Training streams begin this many shards into their first pass
    start_offset: usize,
}

impl ShardLocator {
    pub fn new(root: &Path, shuffle: ShufflePolicy) -> Self {
        Self {
            root: root.to_path_buf(),
            shuffle,
            start_offset: 0,
        }
    }

    /// Same shard set, with a new seed if shard order is shuffled.
    pub fn reseeded(&self, seed: u64) -> Self {
        let shuffle = match self.shuffle {
            ShufflePolicy::Seeded(_) => ShufflePolicy::Seeded(seed),
            ShufflePolicy::Sequential => ShufflePolicy::Sequential,
        };
        Self {
            shuffle,
            ..self.clone()
        }
    }

    /// Start training streams `offset` shards into the first pass, wrapping
    /// around the shard set. Evaluation streams ignore it.
    pub fn starting_at(mut self, offset: usize) -> Self {
        self.start_offset = offset;
        self
    }

    pub fn shuffle(&self) -> ShufflePolicy {
        self.shuffle
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pattern(&self, split: Split) -> String {
        self.root
            .join(format!("{}-*", split.file_prefix()))
            .to_string_lossy()
            .into_owned()
    }

    /// Matching shard files in lexicographic order.
    pub fn locate(&self, split: Split) -> Result<Vec<PathBuf>, DataError> {
        let pattern = self.pattern(split);
        let entries = glob::glob(&pattern).map_err(|e| DataError::InvalidPattern {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) if path.is_file() => paths.push(path),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable shard path");
                }
            }
        }

        if paths.is_empty() {
            return Err(DataError::NoShardsFound { pattern });
        }
        paths.sort();
        Ok(paths)
    }

    /// Shard paths in read order. The training split repeats forever,
    /// reshuffling between passes when a seed is set; evaluation yields each
    /// shard once in sorted order.
    pub fn stream(&self, split: Split) -> Result<ShardStream, DataError> {
        let paths = self.locate(split)?;
        let (repeat, rng) = match (split, self.shuffle) {
            (Split::Train, ShufflePolicy::Seeded(seed)) => (true, Some(StdRng::seed_from_u64(seed))),
            (Split::Train, ShufflePolicy::Sequential) => (true, None),
            (Split::Eval, _) => (false, None),
        };
        let mut stream = ShardStream::new(paths, repeat, rng);
        if repeat {
            stream.rotate(self.start_offset);
        }
        Ok(stream)
    }
}

/// Iterator over shard paths, possibly infinite.
pub struct ShardStream {
    paths: Vec<PathBuf>,
    order: Vec<usize>,
    position: usize,
    pass: u64,
    repeat: bool,
    rng: Option<StdRng>,
}

impl ShardStream {
    fn new(paths: Vec<PathBuf>, repeat: bool, rng: Option<StdRng>) -> Self {
        let mut stream = Self {
            order: (0..paths.len()).collect(),
            paths,
            position: 0,
            pass: 0,
            repeat,
            rng,
        };
        stream.reshuffle();
        stream
    }

    fn rotate(&mut self, offset: usize) {
        if !self.order.is_empty() {
            let offset = offset % self.order.len();
            self.order.rotate_left(offset);
        }
    }

    fn reshuffle(&mut self) {
        if let Some(rng) = &mut self.rng {
            self.order.shuffle(rng);
        }
    }

    pub fn shard_count(&self) -> usize {
        self.paths.len()
    }

    /// Completed passes over the shard set.
    pub fn passes(&self) -> u64 {
        self.pass
    }
}

impl Iterator for ShardStream {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        if self.position == self.order.len() {
            if !self.repeat || self.order.is_empty() {
                return None;
            }
            self.pass += 1;
            self.position = 0;
            self.reshuffle();
            tracing::debug!(pass = self.pass, "restarting shard pass");
        }
        let path = self.paths[self.order[self.position]].clone();
        self.position += 1;
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch_shards(dir: &Path, prefix: &str, count: usize) {
        for i in 0..count {
            let name = format!("{}-{:05}-of-{:05}", prefix, i, count);
            std::fs::write(dir.join(name), b"").unwrap();
        }
    }

    #[test]
    fn test_no_shards_is_an_error() {
        let dir = TempDir::new().unwrap();
        touch_shards(dir.path(), "train", 2);
        let locator = ShardLocator::new(dir.path(), ShufflePolicy::Sequential);
        let err = locator.locate(Split::Eval).unwrap_err();
        assert!(matches!(err, DataError::NoShardsFound { .. }));
    }

    #[test]
    fn test_eval_stream_is_sorted_and_finite() {
        let dir = TempDir::new().unwrap();
        touch_shards(dir.path(), "test", 3);
        touch_shards(dir.path(), "train", 5);
        let locator = ShardLocator::new(dir.path(), ShufflePolicy::Seeded(3));

        let paths: Vec<_> = locator.stream(Split::Eval).unwrap().collect();
        assert_eq!(paths.len(), 3);
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
    }

    #[test]
    fn test_train_stream_repeats() {
        let dir = TempDir::new().unwrap();
        touch_shards(dir.path(), "train", 2);
        let locator = ShardLocator::new(dir.path(), ShufflePolicy::Sequential);

        let mut stream = locator.stream(Split::Train).unwrap();
        let first: Vec<_> = stream.by_ref().take(6).collect();
        assert_eq!(first[0], first[2]);
        assert_eq!(first[1], first[5]);
        assert_eq!(stream.passes(), 2);
    }

    #[test]
    fn test_seeded_shuffle_is_reproducible() {
        let dir = TempDir::new().unwrap();
        touch_shards(dir.path(), "train", 8);
        let locator = ShardLocator::new(dir.path(), ShufflePolicy::Seeded(42));

        let a: Vec<_> = locator.stream(Split::Train).unwrap().take(24).collect();
        let b: Vec<_> = locator.stream(Split::Train).unwrap().take(24).collect();
        assert_eq!(a, b);

        let mut one_pass = a[..8].to_vec();
        one_pass.sort();
        assert_eq!(one_pass, locator.locate(Split::Train).unwrap());
    }

    #[test]
    fn test_reseeded_locator_changes_shard_order() {
        let dir = TempDir::new().unwrap();
        touch_shards(dir.path(), "train", 8);
        let locator = ShardLocator::new(dir.path(), ShufflePolicy::Seeded(42));

        let a: Vec<_> = locator.stream(Split::Train).unwrap().take(8).collect();
        let b: Vec<_> = locator
            .reseeded(43)
            .stream(Split::Train)
            .unwrap()
            .take(8)
            .collect();
        assert_ne!(a, b);

        let sequential = ShardLocator::new(dir.path(), ShufflePolicy::Sequential);
        assert_eq!(sequential.reseeded(43).shuffle(), ShufflePolicy::Sequential);
    }

    #[test]
    fn test_start_offset_rotates_training_stream_only() {
        let dir = TempDir::new().unwrap();
        touch_shards(dir.path(), "train", 3);
        touch_shards(dir.path(), "test", 3);
        let locator = ShardLocator::new(dir.path(), ShufflePolicy::Sequential).starting_at(4);
        let sorted = locator.locate(Split::Train).unwrap();

        let train: Vec<_> = locator.stream(Split::Train).unwrap().take(4).collect();
        assert_eq!(train, vec![
            sorted[1].clone(),
            sorted[2].clone(),
            sorted[0].clone(),
            sorted[1].clone(),
        ]);

        let eval: Vec<_> = locator.stream(Split::Eval).unwrap().collect();
        assert_eq!(eval, locator.locate(Split::Eval).unwrap());
    }
}
