//! Synchronized data-parallel training step
//!
//! The batch is split evenly across replicas. Every replica runs forward and
//! backward on its slice against the same parameters; the step then waits
//! for all of them, averages their gradients and applies one optimizer
//! update. If anything fails before the update, the state is left exactly as
//! it was.

use crate::data::Batch;
use crate::model::{ParamMap, SeparatorModel};
use crate::separation_loss::{separation_loss_with_grad, SeparationLossError};
use crate::tensor::{Tensor, TensorError};
use crate::training::optimizer::Adam;
use crate::training::state::TrainingState;
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StepExecutionError {
    #[error("cannot split batch across {shards} replicas: {source}")]
    UnevenSplit {
        shards: usize,
        #[source]
        source: TensorError,
    },

    #[error("replica {replica} failed: {reason}")]
    ReplicaFailed { replica: usize, reason: String },

    #[error("replica {replica} loss: {source}")]
    Loss {
        replica: usize,
        #[source]
        source: SeparationLossError,
    },

    #[error("replica {replica} produced incompatible gradients: {reason}")]
    GradientMismatch { replica: usize, reason: String },

    #[error("non-finite loss {loss} at step {step}")]
    NonFiniteLoss { loss: f32, step: u64 },

    #[error("non-finite gradient for {name} at step {step}")]
    NonFiniteGradient { name: String, step: u64 },
}

/// Result of one applied step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    pub loss: f32,
    pub global_step: u64,
}

#[derive(Debug, Clone)]
pub struct TrainingStepExecutor {
    num_shards: usize,
    optimizer: Adam,
}

impl TrainingStepExecutor {
    pub fn new(num_shards: usize, optimizer: Adam) -> Self {
        Self {
            num_shards: num_shards.max(1),
            optimizer,
        }
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    pub fn learning_rate(&self) -> f32 {
        self.optimizer.learning_rate
    }

    pub fn execute<M: SeparatorModel>(
        &self,
        model: &M,
        state: &mut TrainingState,
        batch: &Batch,
    ) -> Result<StepOutput, StepExecutionError> {
        let split = |tensor: &Tensor| {
            tensor
                .chunk_leading(self.num_shards)
                .map_err(|source| StepExecutionError::UnevenSplit {
                    shards: self.num_shards,
                    source,
                })
        };
        let mixtures = split(batch.mixture())?;
        let sources = split(batch.sources())?;

        let params = &state.parameters;
        let replicas: Vec<Result<(f32, ParamMap), StepExecutionError>> = mixtures
            .par_iter()
            .zip(sources.par_iter())
            .enumerate()
            .map(|(replica, (mixture, reference))| {
                run_replica(model, params, replica, mixture, reference)
            })
            .collect();

        // Barrier: nothing is applied unless every replica succeeded.
        let mut losses = Vec::with_capacity(replicas.len());
        let mut gradients = Vec::with_capacity(replicas.len());
        for result in replicas {
            let (loss, grads) = result?;
            losses.push(loss);
            gradients.push(grads);
        }
        for (replica, grads) in gradients.iter().enumerate() {
            self.optimizer
                .check_compatible(params, grads)
                .map_err(|reason| StepExecutionError::GradientMismatch { replica, reason })?;
        }

        let step = state.global_step + 1;
        let loss = losses.iter().sum::<f32>() / losses.len() as f32;
        if !loss.is_finite() {
            return Err(StepExecutionError::NonFiniteLoss { loss, step });
        }
        let averaged = average(gradients);
        if let Some((name, _)) = averaged
            .iter()
            .find(|(_, g)| g.data.iter().any(|v| !v.is_finite()))
        {
            return Err(StepExecutionError::NonFiniteGradient {
                name: name.clone(),
                step,
            });
        }

        self.optimizer
            .apply(&mut state.parameters, &mut state.optimizer, &averaged);
        state.global_step = step;

        Ok(StepOutput {
            loss,
            global_step: step,
        })
    }
}

fn run_replica<M: SeparatorModel>(
    model: &M,
    params: &ParamMap,
    replica: usize,
    mixture: &Tensor,
    reference: &Tensor,
) -> Result<(f32, ParamMap), StepExecutionError> {
    let failed = |e: anyhow::Error| StepExecutionError::ReplicaFailed {
        replica,
        reason: format!("{:#}", e),
    };
    let estimates = model.predict(params, mixture, true).map_err(failed)?;
    let loss = separation_loss_with_grad(&estimates, reference)
        .map_err(|source| StepExecutionError::Loss { replica, source })?;
    let grads = model
        .backward(params, mixture, &loss.grads)
        .map_err(failed)?;
    Ok((loss.loss, grads))
}

/// Element-wise mean of replica gradients. Inputs are already checked to
/// share names and shapes.
fn average(mut gradients: Vec<ParamMap>) -> ParamMap {
    let count = gradients.len();
    let Some(mut total) = gradients.pop() else {
        return ParamMap::new();
    };
    for grads in &gradients {
        for (name, sum) in total.iter_mut() {
            if let Some(grad) = grads.get(name) {
                for (acc, g) in sum.data.iter_mut().zip(&grad.data) {
                    *acc += g;
                }
            }
        }
    }
    let scale = 1.0 / count as f32;
    for sum in total.values_mut() {
        sum.data.iter_mut().for_each(|v| *v *= scale);
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecordLayout;
    use crate::data::BatchFeatures;
    use crate::model::{GainSeparator, GainSeparatorConfig, ParamTensor};

    fn layout() -> RecordLayout {
        RecordLayout {
            mix_len: 6,
            num_sources: 2,
            num_samples: 2,
            channels: 1,
            sample_rate: 22050,
        }
    }

    fn batch(size: usize) -> Batch {
        let mixture = Tensor::from_f32(
            (0..size * 6).map(|i| (i % 7) as f32 * 0.1).collect(),
            vec![size, 6, 1],
        )
        .unwrap();
        let sources =
            Tensor::from_f32(vec![0.2; size * 4], vec![size, 2, 2, 1]).unwrap();
        let labels = Tensor::from_i64(vec![0; size * 2], vec![size, 2]).unwrap();
        Batch::new(size, BatchFeatures::Train { mixture, labels }, sources).unwrap()
    }

    fn adam() -> Adam {
        Adam {
            learning_rate: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }

    fn model() -> GainSeparator {
        GainSeparator::new(layout(), GainSeparatorConfig::default())
    }

    #[test]
    fn test_step_increments_global_step_once() {
        let model = model();
        let mut state = TrainingState::new(model.init_parameters(1));
        let executor = TrainingStepExecutor::new(2, adam());

        let out = executor.execute(&model, &mut state, &batch(4)).unwrap();
        assert_eq!(out.global_step, 1);
        assert_eq!(state.global_step, 1);
        assert_eq!(state.optimizer.step, 1);
        assert!(out.loss.is_finite());
    }

    #[test]
    fn test_replica_split_matches_single_replica() {
        let model = model();
        let initial = TrainingState::new(model.init_parameters(1));

        let mut one = initial.clone();
        let mut two = initial.clone();
        let a = TrainingStepExecutor::new(1, adam())
            .execute(&model, &mut one, &batch(4))
            .unwrap();
        let b = TrainingStepExecutor::new(2, adam())
            .execute(&model, &mut two, &batch(4))
            .unwrap();

        approx::assert_abs_diff_eq!(a.loss, b.loss, epsilon = 1e-6);
        for (name, p) in &one.parameters {
            for (x, y) in p.data.iter().zip(&two.parameters[name].data) {
                approx::assert_abs_diff_eq!(x, y, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_uneven_split_leaves_state_untouched() {
        let model = model();
        let mut state = TrainingState::new(model.init_parameters(1));
        let before = state.clone();

        let err = TrainingStepExecutor::new(3, adam())
            .execute(&model, &mut state, &batch(4))
            .unwrap_err();
        assert!(matches!(err, StepExecutionError::UnevenSplit { .. }));
        assert_eq!(state, before);
    }

    #[test]
    fn test_non_finite_loss_leaves_state_untouched() {
        let model = model();
        let mut params = model.init_parameters(1);
        params.insert(
            "separator.gain".to_string(),
            ParamTensor::new(vec![f32::INFINITY, 1.0], vec![2]).unwrap(),
        );
        let mut state = TrainingState::new(params);
        let before = state.clone();

        let err = TrainingStepExecutor::new(1, adam())
            .execute(&model, &mut state, &batch(2))
            .unwrap_err();
        assert!(matches!(
            err,
            StepExecutionError::NonFiniteLoss { .. } | StepExecutionError::NonFiniteGradient { .. }
        ));
        assert_eq!(state, before);
    }
}
