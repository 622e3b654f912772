use anyhow::Result;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use stemsep_rs::config::Concurrency;
use stemsep_rs::data::{FeedOptions, PackedExample, ShardLocator, ShardWriter, ShufflePolicy};
use stemsep_rs::metrics::MetricsWriter;
use stemsep_rs::model::{GainSeparator, ParamMap, SeparatorModel};
use stemsep_rs::tensor::Tensor;
use stemsep_rs::training::{Evaluator, PipelineEvaluator, Transition, TrainingLoop};
use stemsep_rs::Config;
use tempfile::TempDir;

/// Hands out a fixed sequence of validation losses and records what it saw
#[derive(Clone, Default)]
struct ScriptedEvaluator {
    losses: Arc<Mutex<VecDeque<f32>>>,
    seen: Arc<Mutex<Vec<PathBuf>>>,
}

impl ScriptedEvaluator {
    fn new(losses: &[f32]) -> Self {
        Self {
            losses: Arc::new(Mutex::new(losses.iter().copied().collect())),
            seen: Arc::default(),
        }
    }

    fn seen(&self) -> Vec<PathBuf> {
        self.seen.lock().unwrap().clone()
    }
}

impl Evaluator for ScriptedEvaluator {
    async fn evaluate(&self, checkpoint: &Path) -> Result<f32> {
        assert!(checkpoint.exists(), "evaluated a missing checkpoint");
        self.seen.lock().unwrap().push(checkpoint.to_path_buf());
        self.losses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("evaluator script exhausted"))
    }
}

/// Gain separator that remembers which training records it was fed
struct RecordingSeparator {
    inner: GainSeparator,
    seen: Mutex<Vec<i64>>,
}

impl RecordingSeparator {
    fn take_seen(&self) -> Vec<i64> {
        std::mem::take(&mut *self.seen.lock().unwrap())
    }
}

impl SeparatorModel for RecordingSeparator {
    fn num_sources(&self) -> usize {
        self.inner.num_sources()
    }

    fn init_parameters(&self, seed: u64) -> ParamMap {
        self.inner.init_parameters(seed)
    }

    fn predict(&self, params: &ParamMap, mixture: &Tensor, training: bool) -> Result<Vec<Tensor>> {
        if training {
            // First mixture sample of each row holds the record key
            let values = mixture.to_f32_vec();
            let keys = values.chunks(6).map(|row| row[0] as i64);
            self.seen.lock().unwrap().extend(keys);
        }
        self.inner.predict(params, mixture, training)
    }

    fn backward(
        &self,
        params: &ParamMap,
        mixture: &Tensor,
        output_grads: &[Vec<f32>],
    ) -> Result<ParamMap> {
        self.inner.backward(params, mixture, output_grads)
    }
}

fn write_shard(path: &Path, file_id: i64, records: usize) {
    let mut writer = ShardWriter::create(path).unwrap();
    for idx in 0..records {
        let mut mixture: Vec<f32> = (0..6).map(|i| ((idx * 6 + i) as f32 * 0.1).sin()).collect();
        // Outside the centre window, so it only tags the record
        mixture[0] = (file_id * 100 + idx as i64) as f32;
        let mut encoded = mixture.clone();
        // Sources are scaled copies of the mixture centre
        for gain in [0.7f32, 0.3] {
            encoded.extend(mixture[1..4].iter().map(|v| v * gain));
        }
        writer
            .write_example(&PackedExample {
                file_id: Some(file_id),
                sample_idx: Some(idx as i64),
                labels: Some(vec![0, 1]),
                encoded: Some(encoded),
                ..Default::default()
            })
            .unwrap();
    }
    writer.finish().unwrap();
}

fn test_config(root: &Path) -> Config {
    let data_dir = root.join("data");
    std::fs::create_dir_all(&data_dir).unwrap();
    write_shard(&data_dir.join("train-00000-of-00002"), 0, 8);
    write_shard(&data_dir.join("train-00001-of-00002"), 1, 8);
    write_shard(&data_dir.join("test-00000-of-00001"), 2, 8);

    let mut config = Config::default();
    config.data.mix_with_padding = 6;
    config.data.num_sources = 2;
    config.data.num_samples = 3;
    config.data.cycle_length = Concurrency::Fixed(2);
    config.data.prefetch_batches = Concurrency::Fixed(2);
    config.data.read_buffer_bytes = 4096;
    config.training.batch_size = 2;
    config.training.cache_size = 4;
    config.training.min_replacement_rate = 2;
    config.training.learning_rate = 1e-2;
    config.training.epoch_it = 3;
    config.training.patience = 1;
    config.training.num_accelerator_shards = 2;
    config.training.logging_steps = 1;
    config.training.show_progress = false;
    config.paths.data_dir = data_dir;
    config.paths.model_base_dir = root.join("checkpoints");
    config.paths.log_dir = root.join("logs");
    config.experiment_id = Some(7);
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_walks_every_phase_and_keeps_best() -> Result<()> {
    let dir = TempDir::new()?;
    let config = test_config(dir.path());
    let metrics_path = dir.path().join("logs/metrics.jsonl");

    let model = Arc::new(GainSeparator::from_config(&config)?);
    // One loss per epoch, then the closing evaluation of the best checkpoint
    let evaluator = ScriptedEvaluator::new(&[1.0, 2.0, 3.0, 1.0]);
    let mut trainer = TrainingLoop::new(config, model, evaluator.clone())?
        .with_metrics(MetricsWriter::create(&metrics_path)?);
    let outcome = trainer.run().await?;

    assert_eq!(outcome.history.len(), 3);
    assert_eq!(outcome.global_step, 9);
    assert_eq!(outcome.best_validation_loss, 1.0);
    assert_eq!(outcome.final_loss, 1.0);
    assert_eq!(outcome.best_checkpoint, outcome.history[0].checkpoint_path);
    assert!(outcome.best_checkpoint.exists());

    let phases: Vec<usize> = outcome.history.iter().map(|e| e.phase).collect();
    assert_eq!(phases, vec![0, 0, 1]);
    let steps: Vec<u64> = outcome.history.iter().map(|e| e.global_step).collect();
    assert_eq!(steps, vec![3, 6, 9]);
    assert!(outcome.history[2]
        .checkpoint_path
        .ends_with("7/phase-1/7-9.safetensors"));

    let seen = evaluator.seen();
    assert_eq!(seen.len(), 4);
    assert_eq!(seen[3], outcome.best_checkpoint);
    assert!(trainer.controller().is_done());
    assert!(dir.path().join("checkpoints/7/controller.json").exists());

    let text = std::fs::read_to_string(&metrics_path)?;
    let records: Vec<serde_json::Value> = text
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    let epochs: Vec<&serde_json::Value> = records.iter().filter(|r| r["kind"] == "epoch").collect();
    assert_eq!(epochs.len(), 3);
    assert_eq!(records.iter().filter(|r| r["kind"] == "step").count(), 9);
    assert_eq!(
        epochs[1]["transition"],
        serde_json::to_value(Transition::PhaseAdvanced { from: 0, to: 1 })?
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parameters_change_during_training() -> Result<()> {
    let dir = TempDir::new()?;
    let config = test_config(dir.path());
    let model = Arc::new(GainSeparator::from_config(&config)?);

    let mut trainer = TrainingLoop::new(config, model, ScriptedEvaluator::new(&[0.5, 0.5]))?
        .with_max_epochs(1);
    let initial = trainer.state().parameters.clone();
    let outcome = trainer.run().await?;

    assert_eq!(outcome.history.len(), 1);
    assert_eq!(trainer.state().global_step, 3);
    assert_eq!(trainer.state().optimizer.step, 3);
    assert_ne!(trainer.state().parameters, initial);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pipeline_evaluator_scores_saved_checkpoint() -> Result<()> {
    let dir = TempDir::new()?;
    let config = test_config(dir.path());
    let model = Arc::new(GainSeparator::from_config(&config)?);

    let locator = ShardLocator::new(&config.paths.data_dir, ShufflePolicy::Sequential);
    let evaluator = PipelineEvaluator::new(
        model.clone(),
        locator,
        FeedOptions::for_eval(&config.data, 2),
    );
    let mut trainer = TrainingLoop::new(config, model, evaluator)?.with_max_epochs(1);
    let outcome = trainer.run().await?;

    let loss = outcome.history[0].validation_loss;
    assert!(loss.is_finite());
    assert!(loss >= 0.0);
    // Evaluation is a deterministic pass, so scoring the same file twice agrees
    assert_eq!(outcome.final_loss, loss);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resume_restores_step_and_controller() -> Result<()> {
    let dir = TempDir::new()?;
    let config = test_config(dir.path());
    let model = Arc::new(GainSeparator::from_config(&config)?);

    let mut first = TrainingLoop::new(config.clone(), model.clone(), ScriptedEvaluator::new(&[0.8, 0.8]))?
        .with_max_epochs(1);
    let outcome = first.run().await?;
    let checkpoint = outcome.history[0].checkpoint_path.clone();

    let mut second = TrainingLoop::new(config, model, ScriptedEvaluator::new(&[0.9, 0.8]))?
        .with_max_epochs(1);
    let metadata = second.resume(&checkpoint).await?;
    assert_eq!(metadata.global_step, 3);
    assert_eq!(second.state(), first.state());
    assert_eq!(second.controller().history().len(), 1);
    assert_eq!(second.controller().best_loss(), 0.8);

    let resumed = second.run().await?;
    assert_eq!(resumed.history.len(), 2);
    assert_eq!(resumed.global_step, 6);
    assert_eq!(resumed.best_checkpoint, checkpoint);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_resume_keeps_fresh_state() -> Result<()> {
    let dir = TempDir::new()?;
    let config = test_config(dir.path());
    let model = Arc::new(GainSeparator::from_config(&config)?);
    let mut trainer = TrainingLoop::new(config, model, ScriptedEvaluator::new(&[]))?;
    let before = trainer.state().clone();

    let bogus = dir.path().join("bogus.safetensors");
    std::fs::write(&bogus, b"not a checkpoint")?;
    assert!(trainer.resume(&bogus).await.is_err());
    assert!(trainer.resume(&dir.path().join("missing.safetensors")).await.is_err());
    assert_eq!(trainer.state(), &before);
    assert_eq!(trainer.controller().phase(), Some(0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_successive_epochs_move_through_the_corpus() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = test_config(dir.path());
    // Pass-through cache keeps the read order visible
    config.training.cache_size = 1;
    config.training.min_replacement_rate = 1;
    let model = Arc::new(RecordingSeparator {
        inner: GainSeparator::from_config(&config)?,
        seen: Mutex::default(),
    });

    let evaluator = ScriptedEvaluator::new(&[1.0, 0.5, 0.4, 0.4]);
    let mut trainer = TrainingLoop::new(config, model.clone(), evaluator)?.with_max_epochs(3);
    let outcome = trainer.run().await?;
    assert_eq!(outcome.history.len(), 3);

    // Each epoch is 3 steps of 2 records
    let seen = model.take_seen();
    assert_eq!(seen.len(), 18);
    let per_epoch: Vec<&[i64]> = seen.chunks(6).collect();
    for (a, b) in [(0, 1), (1, 2)] {
        assert!(
            per_epoch[a].iter().all(|key| !per_epoch[b].contains(key)),
            "epochs {} and {} trained on the same records: {:?} / {:?}",
            a,
            b,
            per_epoch[a],
            per_epoch[b]
        );
    }
    let mut first_two: Vec<i64> = seen[..12].to_vec();
    first_two.sort();
    first_two.dedup();
    assert_eq!(first_two.len(), 12);
    Ok(())
}

#[test]
fn test_missing_experiment_id_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.experiment_id = None;
    let model = Arc::new(GainSeparator::from_config(&config).unwrap());
    assert!(TrainingLoop::new(config, model, ScriptedEvaluator::new(&[])).is_err());
}

#[test]
fn test_uneven_replica_split_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.training.num_accelerator_shards = 3;
    let model = Arc::new(GainSeparator::from_config(&config).unwrap());
    assert!(TrainingLoop::new(config, model, ScriptedEvaluator::new(&[])).is_err());
}
