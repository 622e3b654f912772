//! Validation of saved checkpoints

use crate::checkpoints::load_checkpoint;
use crate::data::{FeedOptions, FeedPipeline, ShardLocator};
use crate::model::SeparatorModel;
use crate::separation_loss::separation_loss;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// Scores a checkpoint against held-out data; lower is better.
#[allow(async_fn_in_trait)]
pub trait Evaluator {
    async fn evaluate(&self, checkpoint: &Path) -> Result<f32>;
}

/// Mean separation loss over one full pass of the evaluation split
pub struct PipelineEvaluator<M> {
    model: Arc<M>,
    locator: ShardLocator,
    options: FeedOptions,
}

impl<M: SeparatorModel> PipelineEvaluator<M> {
    /// `options` should come from [`FeedOptions::for_eval`].
    pub fn new(model: Arc<M>, locator: ShardLocator, options: FeedOptions) -> Self {
        Self {
            model,
            locator,
            options,
        }
    }
}

impl<M: SeparatorModel> Evaluator for PipelineEvaluator<M> {
    async fn evaluate(&self, checkpoint: &Path) -> Result<f32> {
        let (state, _) = load_checkpoint(checkpoint)?;
        let mut pipeline = FeedPipeline::start(&self.locator, self.options.clone())
            .context("Failed to start evaluation pipeline")?;

        let mut total = 0.0f64;
        let mut batches = 0usize;
        while let Some(batch) = pipeline.next_batch().await {
            let estimates = self
                .model
                .predict(&state.parameters, batch.mixture(), false)
                .with_context(|| format!("Evaluation failed on batch {}", batches))?;
            total += separation_loss(&estimates, batch.sources())? as f64;
            batches += 1;
        }
        let stats = pipeline.shutdown().await?;

        if batches == 0 {
            anyhow::bail!(
                "Evaluation split produced no full batch ({} valid examples, batch size {})",
                stats.examples,
                self.options.batch_size
            );
        }

        let loss = (total / batches as f64) as f32;
        tracing::info!(
            checkpoint = %checkpoint.display(),
            batches,
            loss,
            "evaluated checkpoint"
        );
        Ok(loss)
    }
}
