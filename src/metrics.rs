//! JSONL metrics export
//!
//! One JSON object per line, tagged with `"kind"` (`"step"` or `"epoch"`).

use crate::training::early_stopping::{EpochOutcome, Transition};
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Training-step scalars logged every `logging_steps`
#[derive(Debug, Clone, Copy)]
pub struct StepMetrics {
    pub global_step: u64,
    pub phase: usize,
    pub loss: f32,
    pub avg_loss: f32,
    pub learning_rate: f32,
    pub steps_per_sec: f32,
}

#[derive(Debug, Clone)]
pub struct MetricsWriter {
    path: PathBuf,
    started: Instant,
}

impl MetricsWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create metrics directory {}", parent.display()))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            started: Instant::now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_step(&self, step: &StepMetrics) -> Result<()> {
        self.append(serde_json::json!({
            "kind": "step",
            "step": step.global_step,
            "phase": step.phase,
            "loss": finite_or_null(step.loss),
            "avg_loss": finite_or_null(step.avg_loss),
            "lr": step.learning_rate,
            "steps_per_sec": step.steps_per_sec,
            "elapsed_secs": self.started.elapsed().as_secs_f32(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
    }

    pub fn record_epoch(&self, outcome: &EpochOutcome, transition: &Transition, best_loss: f32) -> Result<()> {
        self.append(serde_json::json!({
            "kind": "epoch",
            "epoch": outcome,
            "transition": transition,
            "best_loss": finite_or_null(best_loss),
            "elapsed_secs": self.started.elapsed().as_secs_f32(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
    }

    fn append(&self, record: serde_json::Value) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open metrics file {}", self.path.display()))?;
        writeln!(file, "{record}")?;
        Ok(())
    }
}

fn finite_or_null(value: f32) -> serde_json::Value {
    if value.is_finite() {
        serde_json::json!(value)
    } else {
        serde_json::Value::Null
    }
}
