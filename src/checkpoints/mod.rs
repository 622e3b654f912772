pub mod manager;
pub mod state;

pub use manager::{load_checkpoint, CheckpointManager};
pub use state::{CheckpointError, CheckpointMetadata};
