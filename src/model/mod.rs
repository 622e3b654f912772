//! Separation model interface and parameter storage

pub mod gain;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use gain::{GainSeparator, GainSeparatorConfig};

use crate::tensor::Tensor;

/// A named trainable tensor, always f32
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamTensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl ParamTensor {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            anyhow::bail!(
                "parameter data has {} values but shape {:?} needs {}",
                data.len(),
                shape,
                expected
            );
        }
        Ok(Self { data, shape })
    }

    pub fn zeros_like(other: &ParamTensor) -> Self {
        Self {
            data: vec![0.0; other.data.len()],
            shape: other.shape.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Parameters keyed by name; ordered so serialization is stable
pub type ParamMap = BTreeMap<String, ParamTensor>;

/// Zeroed copy of every parameter
pub fn zeros_like(params: &ParamMap) -> ParamMap {
    params
        .iter()
        .map(|(name, p)| (name.clone(), ParamTensor::zeros_like(p)))
        .collect()
}

/// Total number of scalar parameters
pub fn num_parameters(params: &ParamMap) -> usize {
    params.values().map(ParamTensor::len).sum()
}

/// Maps a mixture batch to one estimate per source.
///
/// Implementations are stateless; parameters live in the training state so
/// that replicas can share one model and checkpoints stay self-contained.
pub trait SeparatorModel: Send + Sync {
    fn num_sources(&self) -> usize;

    fn init_parameters(&self, seed: u64) -> ParamMap;

    /// `mixture` is `[B, P, C]`; returns `S` estimates, each `[B, N, C]`.
    fn predict(&self, params: &ParamMap, mixture: &Tensor, training: bool) -> Result<Vec<Tensor>>;

    /// Gradient of the loss with respect to every parameter, given one
    /// upstream gradient per source estimate.
    fn backward(
        &self,
        params: &ParamMap,
        mixture: &Tensor,
        output_grads: &[Vec<f32>],
    ) -> Result<ParamMap>;
}
