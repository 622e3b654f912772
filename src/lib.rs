//! Streaming ingestion and two-phase training for audio source separation
//!
//! Training data lives in sharded files of packed records, each holding one
//! padded mixture excerpt plus the isolated source excerpts it was mixed
//! from. The crate streams those shards into fixed-shape batches and drives
//! a separator model through phases of training with patience-based early
//! stopping.
//!
//! ## Main Components
//!
//! - `data`: shard discovery, record decoding, filtering, batching and the async feed pipeline
//! - `separation_loss`: per-source MSE averaged over sources
//! - `model`: the separator interface and a baseline gain model
//! - `training`: synchronized step executor, early stopping and the epoch loop
//! - `checkpoints`: safetensors checkpoint management
//! - `config`: configuration management

pub mod checkpoints;
pub mod config;
pub mod data;
pub mod metrics;
pub mod model;
pub mod separation_loss;
pub mod tensor;
pub mod training;

pub use config::Config;
pub use separation_loss::{separation_loss, separation_loss_with_grad};

/// Library errors
pub use anyhow::{Error, Result};
