//! Training example cache
//!
//! Holds up to `capacity` decoded examples and hands them out in seeded
//! random order. Once full, it releases `replacement_rate` examples and
//! refills that many from the upstream stream. Every example is emitted exactly once.

use crate::data::decode::DecodedExample;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub struct ShuffleBuffer {
    capacity: usize,
    replacement_rate: usize,
    entries: Vec<DecodedExample>,
    rng: StdRng,
}

impl ShuffleBuffer {
    pub fn new(capacity: usize, replacement_rate: usize, seed: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            replacement_rate: replacement_rate.clamp(1, capacity),
            entries: Vec::with_capacity(capacity),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add one example. When the buffer is full, `replacement_rate` random
    /// entries are released to make room for the next refill.
    pub fn push(&mut self, example: DecodedExample) -> Vec<DecodedExample> {
        self.entries.push(example);
        if self.entries.len() < self.capacity {
            return Vec::new();
        }
        (0..self.replacement_rate)
            .filter_map(|_| self.take_random())
            .collect()
    }

    /// Upstream ended: emit what is left in random order.
    pub fn drain(&mut self) -> Vec<DecodedExample> {
        let mut out = Vec::with_capacity(self.entries.len());
        while let Some(example) = self.take_random() {
            out.push(example);
        }
        out
    }

    fn take_random(&mut self) -> Option<DecodedExample> {
        if self.entries.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0..self.entries.len());
        Some(self.entries.swap_remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn example(id: i64) -> DecodedExample {
        DecodedExample {
            mixture: Tensor::from_f32(vec![0.0; 2], vec![2, 1]).unwrap(),
            sources: Tensor::from_f32(vec![0.0; 2], vec![1, 2, 1]).unwrap(),
            labels: Tensor::from_i64(vec![0], vec![1]).unwrap(),
            filename_id: id,
            sample_id: id,
            sample_rate: 22050,
            source_names: String::new(),
        }
    }

    fn run(capacity: usize, rate: usize, seed: u64, count: i64) -> Vec<i64> {
        let mut buffer = ShuffleBuffer::new(capacity, rate, seed);
        let mut out = Vec::new();
        for id in 0..count {
            out.extend(buffer.push(example(id)).into_iter().map(|e| e.filename_id));
            assert!(buffer.len() <= capacity);
        }
        out.extend(buffer.drain().into_iter().map(|e| e.filename_id));
        out
    }

    #[test]
    fn test_every_example_emitted_once() {
        let mut ids = run(8, 3, 1, 50);
        assert_eq!(ids.len(), 50);
        ids.sort();
        assert_eq!(ids, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_seeded_order_is_reproducible_and_shuffled() {
        let a = run(8, 2, 9, 40);
        let b = run(8, 2, 9, 40);
        assert_eq!(a, b);
        assert_ne!(a, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn test_nothing_emitted_until_warm() {
        let mut buffer = ShuffleBuffer::new(4, 4, 0);
        for id in 0..3 {
            assert!(buffer.push(example(id)).is_empty());
        }
        assert_eq!(buffer.push(example(3)).len(), 4);
    }
}
