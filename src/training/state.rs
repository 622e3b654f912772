//! Mutable training state: parameters, optimizer moments and step counter

use crate::model::{zeros_like, ParamMap};

/// Adam moment estimates, keyed like the parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdamState {
    /// Updates applied so far; drives bias correction
    pub step: u64,
    pub exp_avg: ParamMap,
    pub exp_avg_sq: ParamMap,
}

impl AdamState {
    pub fn zeros_for(params: &ParamMap) -> Self {
        Self {
            step: 0,
            exp_avg: zeros_like(params),
            exp_avg_sq: zeros_like(params),
        }
    }
}

/// Everything a synchronized step mutates. Only the step executor writes to
/// it; checkpointing reads it between steps.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    pub global_step: u64,
    pub parameters: ParamMap,
    pub optimizer: AdamState,
}

impl TrainingState {
    /// Fresh state at step 0 with zeroed moments.
    pub fn new(parameters: ParamMap) -> Self {
        Self {
            global_step: 0,
            optimizer: AdamState::zeros_for(&parameters),
            parameters,
        }
    }
}
