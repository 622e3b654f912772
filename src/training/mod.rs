pub mod early_stopping;
pub mod evaluation;
pub mod executor;
pub mod optimizer;
pub mod phase;
pub mod state;
pub mod trainer;

pub use early_stopping::{ControllerState, EarlyStoppingController, EpochOutcome, Transition};
pub use evaluation::{Evaluator, PipelineEvaluator};
pub use executor::{StepExecutionError, StepOutput, TrainingStepExecutor};
pub use optimizer::Adam;
pub use phase::{LearningRateRule, PhaseConfig, PhaseDelta, PhaseSchedule, DEFAULT_PHASES};
pub use state::{AdamState, TrainingState};
pub use trainer::{TrainingLoop, TrainingOutcome};
