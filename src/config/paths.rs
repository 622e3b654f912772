use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Directory holding `train-*` and `test-*` shard files
    pub data_dir: PathBuf,
    /// Base folder for model checkpoints
    pub model_base_dir: PathBuf,
    /// Base folder for metric logs
    pub log_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            model_base_dir: PathBuf::from("checkpoints"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl PathConfig {
    pub fn experiment_checkpoint_dir(&self, experiment_id: u64) -> PathBuf {
        self.model_base_dir.join(experiment_id.to_string())
    }

    pub fn experiment_log_dir(&self, experiment_id: u64) -> PathBuf {
        self.log_dir.join(experiment_id.to_string())
    }
}
