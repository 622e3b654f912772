//! Training phases as a transition table
//!
//! Phase 0 runs on the base settings. Every later phase is the base
//! [`PhaseConfig`] with one [`PhaseDelta`] applied, so adding a phase is a
//! table entry rather than new loop logic.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Immutable per-phase hyperparameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub batch_size: usize,
    /// Examples held in the training shuffle cache
    pub cache_size: usize,
    /// Fresh examples admitted into the cache per refill
    pub replacement_rate: usize,
    pub learning_rate: f32,
}

/// How a phase derives its learning rate from the base phase
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateRule {
    Keep,
    Scale(f32),
    Fixed(f32),
}

/// Deltas applied to the base phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDelta {
    pub name: String,
    pub batch_scale: usize,
    pub cache_scale: usize,
    pub replacement_scale: usize,
    pub learning_rate: LearningRateRule,
}

impl PhaseDelta {
    pub fn apply(&self, base: &PhaseConfig) -> PhaseConfig {
        let learning_rate = match self.learning_rate {
            LearningRateRule::Keep => base.learning_rate,
            LearningRateRule::Scale(factor) => base.learning_rate * factor,
            LearningRateRule::Fixed(lr) => lr,
        };
        PhaseConfig {
            batch_size: base.batch_size * self.batch_scale,
            cache_size: base.cache_size * self.cache_scale,
            replacement_rate: base.replacement_rate * self.replacement_scale,
            learning_rate,
        }
    }
}

/// Base training followed by a fine-tuning stage with doubled batch/cache
/// settings and a learning rate of 1e-5.
pub static DEFAULT_PHASES: Lazy<Vec<PhaseDelta>> = Lazy::new(|| {
    vec![
        PhaseDelta {
            name: "base".to_string(),
            batch_scale: 1,
            cache_scale: 1,
            replacement_scale: 1,
            learning_rate: LearningRateRule::Keep,
        },
        PhaseDelta {
            name: "fine-tune".to_string(),
            batch_scale: 2,
            cache_scale: 2,
            replacement_scale: 2,
            learning_rate: LearningRateRule::Fixed(1e-5),
        },
    ]
});

/// Resolved configs, indexed by phase
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSchedule {
    phases: Vec<(String, PhaseConfig)>,
}

impl PhaseSchedule {
    pub fn new(base: PhaseConfig, deltas: &[PhaseDelta]) -> Self {
        Self {
            phases: deltas.iter().map(|d| (d.name.clone(), d.apply(&base))).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn get(&self, phase: usize) -> Option<&PhaseConfig> {
        self.phases.get(phase).map(|(_, cfg)| cfg)
    }

    pub fn name(&self, phase: usize) -> &str {
        self.phases.get(phase).map(|(name, _)| name.as_str()).unwrap_or("unknown")
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhaseConfig> {
        self.phases.iter().map(|(_, cfg)| cfg)
    }
}
