// SPDX-License-Identifier: MIT
// Copyright (c) 2024 stemsep-rs contributors
//
// CheckpointManager saves and restores training state as single
// .safetensors files, one directory per experiment and phase.

use crate::checkpoints::state::{
    CheckpointError, CheckpointMetadata, EXP_AVG_PREFIX, EXP_AVG_SQ_PREFIX, METADATA_TENSOR,
};
use crate::model::{ParamMap, ParamTensor};
use crate::training::state::{AdamState, TrainingState};
use memmap2::MmapOptions;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// CheckpointManager manages checkpoint operations for one experiment
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    experiment_dir: PathBuf,
    experiment_id: u64,
    keep_last: usize,
}

impl CheckpointManager {
    /// Creates `<model_base_dir>/<experiment_id>`. `keep_last == 0` keeps
    /// every checkpoint.
    pub fn new(
        model_base_dir: &Path,
        experiment_id: u64,
        keep_last: usize,
    ) -> Result<Self, CheckpointError> {
        let experiment_dir = model_base_dir.join(experiment_id.to_string());
        fs::create_dir_all(&experiment_dir)
            .map_err(|e| CheckpointError::io(&experiment_dir, e))?;

        Ok(Self {
            experiment_dir,
            experiment_id,
            keep_last,
        })
    }

    pub fn experiment_dir(&self) -> &Path {
        &self.experiment_dir
    }

    pub fn experiment_id(&self) -> u64 {
        self.experiment_id
    }

    pub fn phase_dir(&self, phase: usize) -> PathBuf {
        self.experiment_dir.join(format!("phase-{}", phase))
    }

    pub fn checkpoint_path(&self, phase: usize, global_step: u64) -> PathBuf {
        self.phase_dir(phase)
            .join(format!("{}-{}.safetensors", self.experiment_id, global_step))
    }

    /// Writes the state to a temp file and renames it into place, so a
    /// checkpoint path either holds a complete file or nothing.
    pub async fn save(&self, state: &TrainingState, phase: usize) -> Result<PathBuf, CheckpointError> {
        let dir = self.phase_dir(phase);
        fs::create_dir_all(&dir).map_err(|e| CheckpointError::io(&dir, e))?;

        let path = self.checkpoint_path(phase, state.global_step);
        let tmp_path = path.with_extension("safetensors.tmp");
        let metadata = CheckpointMetadata {
            global_step: state.global_step,
            phase,
            experiment_id: self.experiment_id,
            adam_step: state.optimizer.step,
            saved_at: chrono::Utc::now().to_rfc3339(),
        };

        if let Err(e) = write_safetensors(&tmp_path, state, &metadata) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        fs::rename(&tmp_path, &path).map_err(|e| CheckpointError::io(&path, e))?;

        tracing::info!(
            path = %path.display(),
            step = state.global_step,
            phase,
            "saved checkpoint"
        );
        Ok(path)
    }

    /// Loads a checkpoint; the caller's live state is untouched on failure.
    pub async fn load(&self, path: &Path) -> Result<(TrainingState, CheckpointMetadata), CheckpointError> {
        load_checkpoint(path)
    }

    /// Global steps of the checkpoints saved in `phase`, ascending.
    pub fn list_checkpoints(&self, phase: usize) -> Result<Vec<u64>, CheckpointError> {
        let dir = self.phase_dir(phase);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CheckpointError::io(&dir, e)),
        };

        let prefix = format!("{}-", self.experiment_id);
        let mut steps = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CheckpointError::io(&dir, e))?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let step = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".safetensors"))
                .and_then(|step| step.parse::<u64>().ok());
            if let Some(step) = step {
                steps.push(step);
            }
        }
        steps.sort_unstable();
        Ok(steps)
    }

    /// Removes all but the newest `keep_last` checkpoints of `phase`, never
    /// touching `protect`. Returns how many files were removed.
    pub async fn cleanup(&self, phase: usize, protect: Option<&Path>) -> Result<usize, CheckpointError> {
        if self.keep_last == 0 {
            return Ok(0);
        }
        let steps = self.list_checkpoints(phase)?;
        if steps.len() <= self.keep_last {
            return Ok(0);
        }

        let mut removed = 0;
        for step in &steps[..steps.len() - self.keep_last] {
            let path = self.checkpoint_path(phase, *step);
            if protect == Some(path.as_path()) {
                continue;
            }
            fs::remove_file(&path).map_err(|e| CheckpointError::io(&path, e))?;
            tracing::debug!(path = %path.display(), "removed old checkpoint");
            removed += 1;
        }
        Ok(removed)
    }
}

fn encode_f32(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_f32(path: &Path, name: &str, bytes: &[u8]) -> Result<Vec<f32>, CheckpointError> {
    if bytes.len() % 4 != 0 {
        return Err(CheckpointError::corrupt(
            path,
            format!("tensor {} has {} bytes, not a multiple of 4", name, bytes.len()),
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Saves parameters, optimizer moments and metadata to one safetensors file
fn write_safetensors(
    path: &Path,
    state: &TrainingState,
    metadata: &CheckpointMetadata,
) -> Result<(), CheckpointError> {
    let mut buffers: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();

    // 1. Parameters
    for (name, param) in &state.parameters {
        buffers.push((name.clone(), param.shape.clone(), encode_f32(&param.data)));
    }

    // 2. Optimizer moments
    for (name, m) in &state.optimizer.exp_avg {
        buffers.push((
            format!("{}{}", EXP_AVG_PREFIX, name),
            m.shape.clone(),
            encode_f32(&m.data),
        ));
    }
    for (name, v) in &state.optimizer.exp_avg_sq {
        buffers.push((
            format!("{}{}", EXP_AVG_SQ_PREFIX, name),
            v.shape.clone(),
            encode_f32(&v.data),
        ));
    }

    // 3. Metadata
    let metadata_bytes =
        serde_json::to_vec(metadata).map_err(|e| CheckpointError::corrupt(path, e))?;

    let mut views = Vec::with_capacity(buffers.len() + 1);
    for (name, shape, bytes) in &buffers {
        let view = TensorView::new(Dtype::F32, shape.clone(), bytes)
            .map_err(|e| CheckpointError::corrupt(path, format!("tensor {}: {}", name, e)))?;
        views.push((name.clone(), view));
    }
    let metadata_view = TensorView::new(Dtype::U8, vec![metadata_bytes.len()], &metadata_bytes)
        .map_err(|e| CheckpointError::corrupt(path, e))?;
    views.push((METADATA_TENSOR.to_string(), metadata_view));

    safetensors::serialize_to_file(views, &None, path)
        .map_err(|e| CheckpointError::io(path, std::io::Error::other(e.to_string())))
}

/// Loads a checkpoint written by [`CheckpointManager::save`].
pub fn load_checkpoint(path: &Path) -> Result<(TrainingState, CheckpointMetadata), CheckpointError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(CheckpointError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(CheckpointError::io(path, e)),
    };
    let len = file
        .metadata()
        .map_err(|e| CheckpointError::io(path, e))?
        .len();
    if len == 0 {
        return Err(CheckpointError::corrupt(path, "empty file"));
    }

    // SAFETY: the map is read-only and checkpoints are never rewritten in
    // place; saves go through a rename.
    let mmap = unsafe { MmapOptions::new().map(&file) }.map_err(|e| CheckpointError::io(path, e))?;
    let tensors = SafeTensors::deserialize(&mmap).map_err(|e| CheckpointError::corrupt(path, e))?;

    let mut metadata: Option<CheckpointMetadata> = None;
    let mut parameters = ParamMap::new();
    let mut exp_avg = ParamMap::new();
    let mut exp_avg_sq = ParamMap::new();

    for (name, tensor) in tensors.tensors() {
        if name == METADATA_TENSOR {
            metadata = Some(
                serde_json::from_slice(tensor.data())
                    .map_err(|e| CheckpointError::corrupt(path, format!("metadata: {}", e)))?,
            );
            continue;
        }
        if tensor.dtype() != Dtype::F32 {
            return Err(CheckpointError::corrupt(
                path,
                format!("tensor {} has dtype {:?}, expected F32", name, tensor.dtype()),
            ));
        }

        let data = decode_f32(path, &name, tensor.data())?;
        let value = ParamTensor::new(data, tensor.shape().to_vec())
            .map_err(|e| CheckpointError::corrupt(path, format!("tensor {}: {}", name, e)))?;

        if let Some(key) = name.strip_prefix(EXP_AVG_SQ_PREFIX) {
            exp_avg_sq.insert(key.to_string(), value);
        } else if let Some(key) = name.strip_prefix(EXP_AVG_PREFIX) {
            exp_avg.insert(key.to_string(), value);
        } else {
            parameters.insert(name, value);
        }
    }

    let metadata = metadata.ok_or_else(|| CheckpointError::corrupt(path, "missing metadata"))?;
    if parameters.is_empty() {
        return Err(CheckpointError::corrupt(path, "no parameters"));
    }
    for (key, moment) in exp_avg.iter().chain(exp_avg_sq.iter()) {
        match parameters.get(key) {
            Some(param) if param.shape == moment.shape => {}
            _ => {
                return Err(CheckpointError::corrupt(
                    path,
                    format!("optimizer moment {} does not match any parameter", key),
                ))
            }
        }
    }

    let state = TrainingState {
        global_step: metadata.global_step,
        parameters,
        optimizer: AdamState {
            step: metadata.adam_step,
            exp_avg,
            exp_avg_sq,
        },
    };
    Ok((state, metadata))
}
