use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stemsep_rs::config::Config;
use stemsep_rs::data::{inspect_split, FeedOptions, RecordDecoder, ShardLocator, ShufflePolicy, Split};
use stemsep_rs::metrics::MetricsWriter;
use stemsep_rs::model::GainSeparator;
use stemsep_rs::training::{Evaluator, PipelineEvaluator, TrainingLoop};

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => Ok(Config::default()),
    }
}

/// Command-line overrides for `train`
pub struct TrainArgs {
    pub data_dir: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub epoch_it: Option<usize>,
    pub patience: Option<usize>,
    pub experiment_id: Option<u64>,
    pub resume: Option<PathBuf>,
    pub max_epochs: Option<u64>,
    pub metrics_file: Option<PathBuf>,
    pub no_progress: bool,
}

fn evaluator_for(
    config: &Config,
    model: Arc<GainSeparator>,
    batch_size: usize,
) -> PipelineEvaluator<GainSeparator> {
    let locator = ShardLocator::new(&config.paths.data_dir, ShufflePolicy::Sequential);
    let options = FeedOptions::for_eval(&config.data, batch_size);
    PipelineEvaluator::new(model, locator, options)
}

pub async fn train(mut config: Config, args: TrainArgs) -> Result<()> {
    // Apply command-line overrides
    if let Some(dir) = args.data_dir {
        config.paths.data_dir = dir;
    }
    if let Some(dir) = args.model_dir {
        config.paths.model_base_dir = dir;
    }
    if let Some(bs) = args.batch_size {
        config.training.batch_size = bs;
    }
    if let Some(it) = args.epoch_it {
        config.training.epoch_it = it;
    }
    if let Some(patience) = args.patience {
        config.training.patience = patience;
    }
    if args.experiment_id.is_some() {
        config.experiment_id = args.experiment_id;
    }
    if args.no_progress {
        config.training.show_progress = false;
    }
    config.validate()?;
    let experiment_id = config.ensure_experiment_id();

    let schedule = config.training.phase_schedule();
    println!("{}", RULE);
    println!("Training Configuration");
    println!("{}", RULE);
    println!("  Experiment:     {}", experiment_id);
    println!("  Data:           {}", config.paths.data_dir.display());
    println!(
        "  Checkpoints:    {}",
        config.paths.experiment_checkpoint_dir(experiment_id).display()
    );
    for (phase, phase_config) in schedule.iter().enumerate() {
        println!(
            "  Phase {} ({}): batch {} | cache {} | replace {} | lr {:.0e}",
            phase,
            schedule.name(phase),
            phase_config.batch_size,
            phase_config.cache_size,
            phase_config.replacement_rate,
            phase_config.learning_rate
        );
    }
    println!("  Steps/epoch:    {}", config.training.epoch_it);
    println!("  Patience:       {}", config.training.patience);
    println!("  Replicas:       {}", config.training.num_accelerator_shards);
    println!("{}", RULE);
    println!();

    // Keep the resolved config next to the checkpoints so the run can be
    // reproduced and resumed.
    let experiment_dir = config.paths.experiment_checkpoint_dir(experiment_id);
    std::fs::create_dir_all(&experiment_dir)
        .with_context(|| format!("Failed to create {}", experiment_dir.display()))?;
    config.save(&experiment_dir.join("config.json"))?;

    let metrics_path = args
        .metrics_file
        .unwrap_or_else(|| config.paths.experiment_log_dir(experiment_id).join("metrics.jsonl"));
    let metrics = MetricsWriter::create(&metrics_path)?;

    let model = Arc::new(GainSeparator::from_config(&config)?);
    let evaluator = evaluator_for(&config, model.clone(), config.training.batch_size);

    let mut trainer = TrainingLoop::new(config, model, evaluator)?.with_metrics(metrics);
    if let Some(max_epochs) = args.max_epochs {
        trainer = trainer.with_max_epochs(max_epochs);
    }
    if let Some(checkpoint) = &args.resume {
        trainer.resume(checkpoint).await?;
    }

    let outcome = trainer.run().await?;

    println!();
    println!("{}", RULE);
    println!("Training Complete");
    println!("{}", RULE);
    println!("  Epochs:          {}", outcome.history.len());
    println!("  Steps:           {}", outcome.global_step);
    println!("  Best val loss:   {:.6}", outcome.best_validation_loss);
    println!("  Final loss:      {:.6}", outcome.final_loss);
    println!("  Best checkpoint: {}", outcome.best_checkpoint.display());
    println!("  Metrics saved:   {}", metrics_path.display());
    println!("{}", RULE);

    Ok(())
}

pub async fn evaluate(
    mut config: Config,
    checkpoint: PathBuf,
    data_dir: Option<PathBuf>,
    batch_size: Option<usize>,
) -> Result<()> {
    if let Some(dir) = data_dir {
        config.paths.data_dir = dir;
    }
    let batch_size = batch_size.unwrap_or(config.training.batch_size);

    let model = Arc::new(GainSeparator::from_config(&config)?);
    let evaluator = evaluator_for(&config, model, batch_size);
    let loss = evaluator.evaluate(&checkpoint).await?;

    println!("Checkpoint:      {}", checkpoint.display());
    println!("Validation loss: {:.6}", loss);
    Ok(())
}

pub fn inspect(mut config: Config, data_dir: Option<PathBuf>, json: bool) -> Result<()> {
    if let Some(dir) = data_dir {
        config.paths.data_dir = dir;
    }
    let locator = ShardLocator::new(&config.paths.data_dir, ShufflePolicy::Sequential);
    let decoder = RecordDecoder::new(config.data.layout(), false);

    let mut summaries = Vec::new();
    for split in [Split::Train, Split::Eval] {
        let summary = inspect_split(&locator, split, &decoder, config.data.read_buffer_bytes)
            .with_context(|| format!("Failed to inspect {} split", split.file_prefix()))?;
        summaries.push(summary);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    let batch_size = config.training.batch_size;
    for summary in &summaries {
        println!("{}", RULE);
        println!("Split: {} ({} shards)", summary.split, summary.shards.len());
        println!("{}", RULE);
        for shard in &summary.shards {
            println!(
                "  {:<40} records {:>7} | valid {:>7} | malformed {:>5} | non-finite {:>5}{}",
                shard
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                shard.records,
                shard.valid,
                shard.malformed,
                shard.non_finite,
                if shard.truncated { " | truncated" } else { "" }
            );
        }
        println!(
            "  Total: {} records, {} valid, {} malformed, {} non-finite, {} full batches of {}",
            summary.records(),
            summary.valid(),
            summary.malformed(),
            summary.non_finite(),
            summary.full_batches(batch_size),
            batch_size
        );
    }
    Ok(())
}
