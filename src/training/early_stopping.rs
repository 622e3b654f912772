//! Patience-based early stopping across training phases
//!
//! ```text
//! Running(0) ──patience exhausted──▶ Running(1) ── … ──▶ Done
//! ```
//!
//! The best loss and best checkpoint carry over from one phase to the next.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Result of one training epoch plus its validation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochOutcome {
    pub epoch_index: u64,
    pub phase: usize,
    pub global_step: u64,
    #[serde(with = "non_finite_as_null")]
    pub validation_loss: f32,
    pub checkpoint_path: PathBuf,
}

/// JSON has no NaN; a diverged validation loss is stored as `null`.
mod non_finite_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
        value.is_finite().then_some(*value).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
        Ok(Option::<f32>::deserialize(deserializer)?.unwrap_or(f32::NAN))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Running { phase: usize },
    Done,
}

/// What a single observation changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Improved,
    NotImproved { worse_epochs: usize },
    PhaseAdvanced { from: usize, to: usize },
    Finished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStoppingController {
    state: ControllerState,
    num_phases: usize,
    patience: usize,
    /// `None` until the first finite validation loss
    best_loss: Option<f32>,
    best_checkpoint: Option<PathBuf>,
    worse_epochs: usize,
    history: Vec<EpochOutcome>,
}

impl EarlyStoppingController {
    pub fn new(num_phases: usize, patience: usize) -> Self {
        let state = if num_phases == 0 {
            ControllerState::Done
        } else {
            ControllerState::Running { phase: 0 }
        };
        Self {
            state,
            num_phases,
            patience: patience.max(1),
            best_loss: None,
            best_checkpoint: None,
            worse_epochs: 0,
            history: Vec::new(),
        }
    }

    /// Controller for a resumed run whose own state file is gone; counters
    /// start over inside `phase`.
    pub fn starting_at(num_phases: usize, patience: usize, phase: usize) -> Self {
        let mut controller = Self::new(num_phases, patience);
        if phase < num_phases {
            controller.state = ControllerState::Running { phase };
        }
        controller
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Current phase, `None` once done.
    pub fn phase(&self) -> Option<usize> {
        match self.state {
            ControllerState::Running { phase } => Some(phase),
            ControllerState::Done => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ControllerState::Done
    }

    pub fn best_loss(&self) -> f32 {
        self.best_loss.unwrap_or(f32::INFINITY)
    }

    pub fn best_checkpoint(&self) -> Option<&Path> {
        self.best_checkpoint.as_deref()
    }

    pub fn worse_epochs(&self) -> usize {
        self.worse_epochs
    }

    pub fn history(&self) -> &[EpochOutcome] {
        &self.history
    }

    pub fn observe(&mut self, outcome: EpochOutcome) -> Transition {
        let ControllerState::Running { phase } = self.state else {
            tracing::warn!(
                epoch = outcome.epoch_index,
                "ignoring epoch outcome after training finished"
            );
            return Transition::Finished;
        };

        // NaN never compares less, so it counts as no improvement.
        let improved = outcome.validation_loss < self.best_loss();
        let transition = if improved {
            self.best_loss = Some(outcome.validation_loss);
            self.best_checkpoint = Some(outcome.checkpoint_path.clone());
            self.worse_epochs = 0;
            Transition::Improved
        } else {
            self.worse_epochs += 1;
            if self.worse_epochs < self.patience {
                Transition::NotImproved {
                    worse_epochs: self.worse_epochs,
                }
            } else {
                self.worse_epochs = 0;
                if phase + 1 < self.num_phases {
                    self.state = ControllerState::Running { phase: phase + 1 };
                    Transition::PhaseAdvanced {
                        from: phase,
                        to: phase + 1,
                    }
                } else {
                    self.state = ControllerState::Done;
                    Transition::Finished
                }
            }
        };

        self.history.push(outcome);
        transition
    }

    /// Written to a temp file and renamed into place, so `path` always
    /// holds a complete state.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&tmp_path, text) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e).with_context(|| {
                format!("Failed to write controller state {}", tmp_path.display())
            });
        }
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to replace controller state {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read controller state {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse controller state {}", path.display()))
    }
}
