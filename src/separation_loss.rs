//! Source separation loss
//!
//! Each source contributes the mean squared error between its estimate and
//! its reference; the separation loss is the average of those per-source
//! terms.
//!
//! ```text
//! L = (1 / S) × Σ_s mean((ŝ_s − s_s)²)
//! ```
//!
//! The model yields one `[batch, sample, channel]` estimate per source; the
//! references arrive stacked as `[batch, source, sample, channel]`.

use crate::tensor::Tensor;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum SeparationLossError {
    #[error("got {estimates} source estimates for {sources} reference sources")]
    SourceCountMismatch { estimates: usize, sources: usize },

    #[error("estimate for source {source_index} has shape {estimate:?}, expected {expected:?}")]
    ShapeMismatch {
        source_index: usize,
        estimate: Vec<usize>,
        expected: Vec<usize>,
    },

    #[error("expected a [batch, source, sample, channel] reference tensor, got rank {0}")]
    InvalidRank(usize),

    #[error("cannot compute a loss over an empty tensor")]
    Empty,
}

/// Loss value plus the gradient with respect to every estimate
#[derive(Debug, Clone)]
pub struct LossWithGrad {
    pub loss: f32,
    pub per_source: Vec<f32>,
    /// One entry per source, each laid out like its estimate
    pub grads: Vec<Vec<f32>>,
}

/// Returns `(batch, sources, samples * channels)`.
fn check_shapes(
    estimates: &[Tensor],
    sources: &Tensor,
) -> Result<(usize, usize, usize), SeparationLossError> {
    let shape = sources.shape();
    if shape.len() != 4 {
        return Err(SeparationLossError::InvalidRank(shape.len()));
    }
    if sources.is_empty() {
        return Err(SeparationLossError::Empty);
    }
    let (batch, num_sources) = (shape[0], shape[1]);
    if estimates.len() != num_sources {
        return Err(SeparationLossError::SourceCountMismatch {
            estimates: estimates.len(),
            sources: num_sources,
        });
    }
    let expected = [batch, shape[2], shape[3]];
    for (source_index, estimate) in estimates.iter().enumerate() {
        if estimate.shape() != expected {
            return Err(SeparationLossError::ShapeMismatch {
                source_index,
                estimate: estimate.shape().to_vec(),
                expected: expected.to_vec(),
            });
        }
    }
    Ok((batch, num_sources, shape[2] * shape[3]))
}

/// Mean squared error of every source, in source order.
pub fn per_source_mse(estimates: &[Tensor], sources: &Tensor) -> Result<Vec<f32>, SeparationLossError> {
    let (batch, num_sources, inner) = check_shapes(estimates, sources)?;
    let reference = sources.to_f32_vec();

    // Accumulate in f64; bf16 inputs lose enough precision already.
    let per_source_count = (batch * inner) as f64;
    Ok(estimates
        .iter()
        .enumerate()
        .map(|(s, estimate)| {
            let est = estimate.to_f32_vec();
            let mut sum = 0.0f64;
            for b in 0..batch {
                let tgt = &reference[(b * num_sources + s) * inner..][..inner];
                sum += est[b * inner..][..inner]
                    .iter()
                    .zip(tgt)
                    .map(|(e, t)| {
                        let d = (*e - *t) as f64;
                        d * d
                    })
                    .sum::<f64>();
            }
            (sum / per_source_count) as f32
        })
        .collect())
}

/// Separation loss: per-source MSE summed and divided by the source count.
pub fn separation_loss(estimates: &[Tensor], sources: &Tensor) -> Result<f32, SeparationLossError> {
    let per_source = per_source_mse(estimates, sources)?;
    Ok(per_source.iter().sum::<f32>() / per_source.len() as f32)
}

/// Loss and its gradient in one pass.
///
/// `∂L/∂ŝ_s = 2 (ŝ_s − s_s) / (numel_s × S)`.
pub fn separation_loss_with_grad(
    estimates: &[Tensor],
    sources: &Tensor,
) -> Result<LossWithGrad, SeparationLossError> {
    let per_source = per_source_mse(estimates, sources)?;
    let (batch, num_sources, inner) = check_shapes(estimates, sources)?;
    let loss = per_source.iter().sum::<f32>() / num_sources as f32;

    let reference = sources.to_f32_vec();
    let scale = 2.0 / (batch * inner * num_sources) as f32;
    let grads = estimates
        .iter()
        .enumerate()
        .map(|(s, estimate)| {
            let est = estimate.to_f32_vec();
            let mut grad = Vec::with_capacity(est.len());
            for b in 0..batch {
                let tgt = &reference[(b * num_sources + s) * inner..][..inner];
                grad.extend(
                    est[b * inner..][..inner]
                        .iter()
                        .zip(tgt)
                        .map(|(e, t)| scale * (e - t)),
                );
            }
            grad
        })
        .collect();

    Ok(LossWithGrad {
        loss,
        per_source,
        grads,
    })
}
