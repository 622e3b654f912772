pub mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stemsep")]
#[command(about = "Streaming training driver for audio source separation", long_about = None)]
struct Cli {
    /// JSON config file; defaults apply for anything it leaves out
    #[arg(long, global = true, env = "STEMSEP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train with early stopping across phases
    Train {
        /// Directory holding train-* and test-* shards
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Base directory for checkpoints
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Base-phase batch size
        #[arg(long)]
        batch_size: Option<usize>,
        /// Training steps per epoch
        #[arg(long)]
        epoch_it: Option<usize>,
        /// Non-improving epochs before the next phase
        #[arg(long)]
        patience: Option<usize>,
        /// Fix the experiment id instead of drawing one
        #[arg(long)]
        experiment_id: Option<u64>,
        /// Resume from this checkpoint file
        #[arg(long)]
        resume: Option<PathBuf>,
        /// Stop after this many epochs
        #[arg(long)]
        max_epochs: Option<u64>,
        /// JSONL metrics output (default: <log_dir>/<experiment_id>/metrics.jsonl)
        #[arg(long)]
        metrics_file: Option<PathBuf>,
        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },
    /// Compute the validation loss of a checkpoint
    Evaluate {
        /// Checkpoint file to score
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Count records, malformed records and non-finite examples per split
    Inspect {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Train {
            data_dir,
            model_dir,
            batch_size,
            epoch_it,
            patience,
            experiment_id,
            resume,
            max_epochs,
            metrics_file,
            no_progress,
        } => {
            commands::train(
                config,
                commands::TrainArgs {
                    data_dir,
                    model_dir,
                    batch_size,
                    epoch_it,
                    patience,
                    experiment_id,
                    resume,
                    max_epochs,
                    metrics_file,
                    no_progress,
                },
            )
            .await
        }
        Commands::Evaluate {
            checkpoint,
            data_dir,
            batch_size,
        } => commands::evaluate(config, checkpoint, data_dir, batch_size).await,
        Commands::Inspect { data_dir, json } => commands::inspect(config, data_dir, json),
    }
}
