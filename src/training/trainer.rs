use crate::checkpoints::{CheckpointManager, CheckpointMetadata};
use crate::config::Config;
use crate::data::{FeedOptions, FeedPipeline, ShardLocator, ShufflePolicy};
use crate::metrics::{MetricsWriter, StepMetrics};
use crate::model::{num_parameters, SeparatorModel};
use crate::training::early_stopping::{EarlyStoppingController, EpochOutcome, Transition};
use crate::training::evaluation::Evaluator;
use crate::training::executor::TrainingStepExecutor;
use crate::training::optimizer::Adam;
use crate::training::phase::{PhaseConfig, PhaseSchedule};
use crate::training::state::TrainingState;
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

const CONTROLLER_FILE: &str = "controller.json";

/// What a finished run reports
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub best_checkpoint: PathBuf,
    pub best_validation_loss: f32,
    /// Loss of the best checkpoint from the closing evaluation
    pub final_loss: f32,
    pub global_step: u64,
    pub history: Vec<EpochOutcome>,
}

/// Training stream kept open across the epochs of one phase
struct TrainingFeed {
    phase: usize,
    pipeline: FeedPipeline,
}

/// Format duration in seconds to human-readable string
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{}h{}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Epoch-driven training: each epoch runs `epoch_it` synchronized steps,
/// saves a checkpoint, validates it and feeds the result to the
/// early-stopping controller, which decides the phase.
///
/// One training stream serves every epoch of a phase, so successive epochs
/// move on through the corpus. A new phase (or a resumed run) restarts the
/// stream with the epoch's seed and starting shard.
pub struct TrainingLoop<M, E> {
    config: Config,
    experiment_id: u64,
    model: Arc<M>,
    evaluator: E,
    checkpoints: CheckpointManager,
    locator: ShardLocator,
    schedule: PhaseSchedule,
    state: TrainingState,
    controller: EarlyStoppingController,
    metrics: Option<MetricsWriter>,
    max_epochs: Option<u64>,
    feed: Option<TrainingFeed>,
    training_start_time: Option<Instant>,
}

impl<M: SeparatorModel, E: Evaluator> TrainingLoop<M, E> {
    /// `config.experiment_id` must be set (see [`Config::ensure_experiment_id`]).
    pub fn new(config: Config, model: Arc<M>, evaluator: E) -> Result<Self> {
        config.validate()?;
        let experiment_id = config
            .experiment_id
            .context("experiment_id must be set before training starts")?;

        let checkpoints = CheckpointManager::new(
            &config.paths.model_base_dir,
            experiment_id,
            config.training.checkpoint_keep_last_n,
        )?;
        let shuffle = if config.data.shuffle_shards {
            ShufflePolicy::Seeded(config.seed)
        } else {
            ShufflePolicy::Sequential
        };
        let locator = ShardLocator::new(&config.paths.data_dir, shuffle);
        let schedule = config.training.phase_schedule();
        let state = TrainingState::new(model.init_parameters(config.seed));
        let controller = EarlyStoppingController::new(schedule.len(), config.training.patience);

        tracing::info!(
            experiment_id,
            parameters = num_parameters(&state.parameters),
            phases = schedule.len(),
            "initialized training loop"
        );

        Ok(Self {
            config,
            experiment_id,
            model,
            evaluator,
            checkpoints,
            locator,
            schedule,
            state,
            controller,
            metrics: None,
            max_epochs: None,
            feed: None,
            training_start_time: None,
        })
    }

    pub fn with_metrics(mut self, metrics: MetricsWriter) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Stop after this many epochs even if the controller is still running.
    pub fn with_max_epochs(mut self, max_epochs: u64) -> Self {
        self.max_epochs = Some(max_epochs);
        self
    }

    pub fn experiment_id(&self) -> u64 {
        self.experiment_id
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn controller(&self) -> &EarlyStoppingController {
        &self.controller
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    fn controller_path(&self) -> PathBuf {
        self.checkpoints.experiment_dir().join(CONTROLLER_FILE)
    }

    /// Continue from a saved checkpoint. The live state is replaced only if
    /// the checkpoint loads completely.
    pub async fn resume(&mut self, checkpoint: &Path) -> Result<CheckpointMetadata> {
        let (state, metadata) = self
            .checkpoints
            .load(checkpoint)
            .await
            .with_context(|| format!("Failed to resume from {}", checkpoint.display()))?;
        if metadata.experiment_id != self.experiment_id {
            tracing::warn!(
                checkpoint_experiment = metadata.experiment_id,
                experiment = self.experiment_id,
                "resuming from another experiment's checkpoint"
            );
        }

        let controller_path = self.controller_path();
        let controller = if controller_path.exists() {
            EarlyStoppingController::load(&controller_path)?
        } else {
            tracing::warn!(
                phase = metadata.phase,
                "no controller state found, restarting patience in the checkpoint's phase"
            );
            EarlyStoppingController::starting_at(
                self.schedule.len(),
                self.config.training.patience,
                metadata.phase,
            )
        };

        self.state = state;
        self.controller = controller;
        if let Some(feed) = self.feed.take() {
            self.stop_feed(feed).await?;
        }
        tracing::info!(
            step = metadata.global_step,
            phase = metadata.phase,
            epochs = self.controller.history().len(),
            "resumed training"
        );
        Ok(metadata)
    }

    pub async fn run(&mut self) -> Result<TrainingOutcome> {
        self.training_start_time = Some(Instant::now());
        let mut epochs_this_run = 0u64;

        while let Some(phase) = self.controller.phase() {
            if self.max_epochs.is_some_and(|max| epochs_this_run >= max) {
                tracing::warn!(epochs = epochs_this_run, "stopping at epoch limit");
                break;
            }

            let outcome = match self.run_epoch(phase).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    if let Some(feed) = self.feed.take() {
                        let _ = feed.pipeline.shutdown().await;
                    }
                    return Err(e);
                }
            };
            let transition = self.controller.observe(outcome.clone());
            epochs_this_run += 1;

            if let Some(metrics) = &self.metrics {
                metrics.record_epoch(&outcome, &transition, self.controller.best_loss())?;
            }
            self.controller.save(&self.controller_path())?;
            self.checkpoints
                .cleanup(phase, self.controller.best_checkpoint())
                .await?;

            match transition {
                Transition::Improved => tracing::info!(
                    epoch = outcome.epoch_index,
                    loss = outcome.validation_loss,
                    "new best validation loss"
                ),
                Transition::NotImproved { worse_epochs } => tracing::info!(
                    epoch = outcome.epoch_index,
                    loss = outcome.validation_loss,
                    best = self.controller.best_loss(),
                    worse_epochs,
                    "no improvement"
                ),
                Transition::PhaseAdvanced { from, to } => tracing::info!(
                    from = self.schedule.name(from),
                    to = self.schedule.name(to),
                    "patience exhausted, advancing phase"
                ),
                Transition::Finished => tracing::info!("patience exhausted in final phase"),
            }
        }

        if let Some(feed) = self.feed.take() {
            self.stop_feed(feed).await?;
        }

        let best_checkpoint = self
            .controller
            .best_checkpoint()
            .context("Training finished without a finite validation loss")?
            .to_path_buf();
        let final_loss = self.evaluator.evaluate(&best_checkpoint).await?;

        let outcome = TrainingOutcome {
            best_checkpoint,
            best_validation_loss: self.controller.best_loss(),
            final_loss,
            global_step: self.state.global_step,
            history: self.controller.history().to_vec(),
        };
        self.log_summary(&outcome);
        Ok(outcome)
    }

    async fn run_epoch(&mut self, phase: usize) -> Result<EpochOutcome> {
        let phase_config = *self
            .schedule
            .get(phase)
            .with_context(|| format!("No configuration for phase {}", phase))?;
        let epoch_index = self.controller.history().len() as u64;
        let epoch_it = self.config.training.epoch_it;

        let executor = TrainingStepExecutor::new(
            self.config.training.num_accelerator_shards,
            Adam::from_config(&self.config.training, phase_config.learning_rate),
        );
        let mut feed = match self.feed.take() {
            Some(feed) if feed.phase == phase => feed,
            previous => {
                if let Some(previous) = previous {
                    self.stop_feed(previous).await?;
                }
                self.start_feed(phase, &phase_config, epoch_index)?
            }
        };

        tracing::info!(
            epoch = epoch_index,
            phase = self.schedule.name(phase),
            batch_size = phase_config.batch_size,
            lr = phase_config.learning_rate,
            "starting epoch"
        );

        let pb = if self.config.training.show_progress {
            ProgressBar::new(epoch_it as u64)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ETA:{eta} {msg}")
                .context("Invalid progress bar template")?
                .progress_chars("=>-"),
        );

        let logging_steps = self.config.training.logging_steps.max(1);
        let start = Instant::now();
        let mut recent_losses: Vec<f32> = Vec::with_capacity(logging_steps);

        for it in 0..epoch_it {
            let Some(batch) = feed.pipeline.next_batch().await else {
                let stats = feed.pipeline.shutdown().await?;
                anyhow::bail!(
                    "Training stream ended after {} batches in epoch {}",
                    stats.batches,
                    epoch_index
                );
            };

            let step = executor
                .execute(self.model.as_ref(), &mut self.state, &batch)
                .with_context(|| format!("Training step failed in epoch {}", epoch_index))?;
            pb.inc(1);
            recent_losses.push(step.loss);

            if (it + 1) % logging_steps == 0 || it + 1 == epoch_it {
                let avg_loss = recent_losses.iter().sum::<f32>() / recent_losses.len() as f32;
                let elapsed = start.elapsed().as_secs_f32();
                let steps_per_sec = if elapsed > 0.0 {
                    (it + 1) as f32 / elapsed
                } else {
                    0.0
                };
                let eta_secs = if steps_per_sec > 0.0 {
                    (epoch_it - it - 1) as f32 / steps_per_sec
                } else {
                    0.0
                };
                pb.set_message(format!(
                    "loss: {:.4} (avg: {:.4}) | lr: {:.2e} | {:.1} steps/s | ETA: {}",
                    step.loss,
                    avg_loss,
                    executor.learning_rate(),
                    steps_per_sec,
                    format_duration(eta_secs as u64)
                ));
                if let Some(metrics) = &self.metrics {
                    metrics.record_step(&StepMetrics {
                        global_step: step.global_step,
                        phase,
                        loss: step.loss,
                        avg_loss,
                        learning_rate: executor.learning_rate(),
                        steps_per_sec,
                    })?;
                }
                recent_losses.clear();
            }
        }
        pb.finish_and_clear();
        // Queued batches wait for the next epoch of this phase.
        self.feed = Some(feed);

        let checkpoint_path = self.checkpoints.save(&self.state, phase).await?;
        let validation_loss = self
            .evaluator
            .evaluate(&checkpoint_path)
            .await
            .with_context(|| format!("Validation failed for {}", checkpoint_path.display()))?;

        Ok(EpochOutcome {
            epoch_index,
            phase,
            global_step: self.state.global_step,
            validation_loss,
            checkpoint_path,
        })
    }

    fn start_feed(
        &self,
        phase: usize,
        phase_config: &PhaseConfig,
        epoch_index: u64,
    ) -> Result<TrainingFeed> {
        // Reproducible from the run seed, and distinct for every restart.
        let seed = self.config.seed.wrapping_add(epoch_index);
        let locator = self
            .locator
            .reseeded(seed)
            .starting_at(usize::try_from(epoch_index).unwrap_or(usize::MAX));
        let options = FeedOptions::for_phase(&self.config.data, phase_config, seed);
        let pipeline = FeedPipeline::start(&locator, options)
            .context("Failed to start training pipeline")?;
        tracing::debug!(phase, epoch = epoch_index, seed, "started training stream");
        Ok(TrainingFeed { phase, pipeline })
    }

    async fn stop_feed(&self, feed: TrainingFeed) -> Result<()> {
        let stats = feed
            .pipeline
            .shutdown()
            .await
            .context("Training pipeline failed")?;
        tracing::debug!(
            phase = feed.phase,
            shards = stats.shards_opened,
            records = stats.records_read,
            malformed = stats.malformed,
            rejected = stats.rejected,
            batches = stats.batches,
            "training pipeline stopped"
        );
        Ok(())
    }

    fn log_summary(&self, outcome: &TrainingOutcome) {
        let duration = self
            .training_start_time
            .map(|t| format_duration(t.elapsed().as_secs()))
            .unwrap_or_default();
        tracing::info!(
            experiment_id = self.experiment_id,
            steps = outcome.global_step,
            epochs = outcome.history.len(),
            best_loss = outcome.best_validation_loss,
            final_loss = outcome.final_loss,
            best_checkpoint = %outcome.best_checkpoint.display(),
            duration = %duration,
            "training complete"
        );
    }
}
