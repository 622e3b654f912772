pub mod data;
pub mod paths;
pub mod training;

use anyhow::Context;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use data::{Concurrency, DataConfig, RecordLayout};
pub use paths::PathConfig;
pub use training::TrainingConfig;

/// Main configuration for a separation training run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data: DataConfig,
    pub training: TrainingConfig,
    pub paths: PathConfig,
    /// Architecture hyperparameters, handed to the model untouched
    pub model: serde_json::Value,
    pub seed: u64,
    /// Random when unset, fixed once the run starts
    pub experiment_id: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: DataConfig::default(),
            training: TrainingConfig::default(),
            paths: PathConfig::default(),
            model: serde_json::Value::Object(Default::default()),
            seed: 1337,
            experiment_id: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write config {}", path.display()))
    }

    /// Experiment id for this run, drawing one if the config left it unset.
    pub fn ensure_experiment_id(&mut self) -> u64 {
        *self
            .experiment_id
            .get_or_insert_with(|| rand::thread_rng().gen_range(0..1_000_000))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let data = &self.data;
        if data.num_sources == 0 || data.num_samples == 0 || data.channels == 0 {
            anyhow::bail!("num_sources, num_samples and channels must all be > 0");
        }
        if data.mix_with_padding < data.num_samples {
            anyhow::bail!(
                "mix_with_padding ({}) must be at least num_samples ({})",
                data.mix_with_padding,
                data.num_samples
            );
        }
        if data.read_ahead == 0 {
            anyhow::bail!("read_ahead must be > 0");
        }

        let training = &self.training;
        if training.epoch_it == 0 {
            anyhow::bail!("epoch_it must be > 0");
        }
        if training.patience == 0 {
            anyhow::bail!("patience must be > 0");
        }
        if training.num_accelerator_shards == 0 {
            anyhow::bail!("num_accelerator_shards must be > 0");
        }
        if training.phases.is_empty() {
            anyhow::bail!("at least one training phase is required");
        }

        let schedule = training.phase_schedule();
        for (index, phase) in schedule.iter().enumerate() {
            if phase.batch_size == 0 {
                anyhow::bail!("phase {} has batch_size 0", index);
            }
            if phase.batch_size % training.num_accelerator_shards != 0 {
                anyhow::bail!(
                    "phase {} batch_size {} is not divisible across {} accelerator shards",
                    index,
                    phase.batch_size,
                    training.num_accelerator_shards
                );
            }
            if !(phase.learning_rate.is_finite() && phase.learning_rate > 0.0) {
                anyhow::bail!("phase {} has invalid learning rate {}", index, phase.learning_rate);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"training": {"batch_size": 4}, "seed": 7}"#).unwrap();
        assert_eq!(config.training.batch_size, 4);
        assert_eq!(config.training.patience, 20);
        assert_eq!(config.data.num_sources, 13);
        assert_eq!(config.seed, 7);
    }

    #[test]
    fn test_uneven_shard_split_is_rejected() {
        let mut config = Config::default();
        config.training.batch_size = 6;
        config.training.num_accelerator_shards = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mixture_shorter_than_sources_is_rejected() {
        let mut config = Config::default();
        config.data.mix_with_padding = 2;
        config.data.num_samples = 3;
        assert!(config.validate().is_err());

        config.data.mix_with_padding = 3;
        config.validate().unwrap();
    }

    #[test]
    fn test_experiment_id_is_stable_once_drawn() {
        let mut config = Config::default();
        let id = config.ensure_experiment_id();
        assert_eq!(config.ensure_experiment_id(), id);
        assert!(id < 1_000_000);
    }
}
