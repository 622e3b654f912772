use crate::training::phase::{PhaseConfig, PhaseDelta, PhaseSchedule, DEFAULT_PHASES};
use serde::{Deserialize, Serialize};

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    /// Number of audio excerpts cached to build batches from
    pub cache_size: usize,
    /// Roughly how many cache entries to replace per refill
    pub min_replacement_rate: usize,
    pub learning_rate: f32,
    /// Separator steps per epoch
    pub epoch_it: usize,
    /// Consecutive non-improving epochs before moving to the next phase
    pub patience: usize,
    /// Replicas the batch is split across for each synchronized step
    pub num_accelerator_shards: usize,
    pub adam_beta1: f32,
    pub adam_beta2: f32,
    pub adam_epsilon: f32,
    pub phases: Vec<PhaseDelta>,
    pub logging_steps: usize,
    /// 0 keeps every checkpoint
    pub checkpoint_keep_last_n: usize,
    pub show_progress: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            cache_size: 16,
            min_replacement_rate: 16,
            learning_rate: 1e-4,
            epoch_it: 2000,
            patience: 20,
            num_accelerator_shards: 1,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
            phases: DEFAULT_PHASES.clone(),
            logging_steps: 10,
            checkpoint_keep_last_n: 0,
            show_progress: true,
        }
    }
}

impl TrainingConfig {
    pub fn base_phase(&self) -> PhaseConfig {
        PhaseConfig {
            batch_size: self.batch_size,
            cache_size: self.cache_size,
            replacement_rate: self.min_replacement_rate,
            learning_rate: self.learning_rate,
        }
    }

    pub fn phase_schedule(&self) -> PhaseSchedule {
        PhaseSchedule::new(self.base_phase(), &self.phases)
    }
}
