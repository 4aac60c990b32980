//! Checkpoint persistence
//!
//! A checkpoint is a directory `checkpoint-<global_step>` under the output
//! directory holding the model weights (`model.safetensors`) and the trainer
//! position (`trainer_state.json`), plus the AdamW moment estimates
//! (`optimizer.safetensors`).

use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::training::config::TrainingConfig;
use crate::training::optimizers::AdamWOptimizer;

/// Weights file inside a checkpoint or output directory
pub const WEIGHTS_NAME: &str = "model.safetensors";
/// Trainer position file inside a checkpoint directory
pub const TRAINER_STATE_NAME: &str = "trainer_state.json";
/// Optimizer moments inside a checkpoint directory
pub const OPTIMIZER_STATE_NAME: &str = "optimizer.safetensors";
/// Config written next to the final weights
pub const CONFIG_NAME: &str = "training_config.json";

const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// Where training stopped, enough to resume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Optimizer steps taken
    pub global_step: usize,
    /// Zero-based epoch in progress
    pub epoch: usize,
    /// Micro-batches of `epoch` already consumed
    pub batches_in_epoch: usize,
    /// Total optimizer steps planned
    pub total_steps: usize,
    /// Updates the optimizer actually applied; lags `global_step` when
    /// every micro-batch of a step was skipped
    #[serde(default)]
    pub optimizer_steps: usize,
    /// Last logged training loss
    pub last_loss: Option<f64>,
    /// Write time
    pub saved_at: DateTime<Utc>,
}

impl TrainerState {
    /// Fresh state for a run of `total_steps`
    pub fn new(total_steps: usize) -> Self {
        Self {
            global_step: 0,
            epoch: 0,
            batches_in_epoch: 0,
            total_steps,
            optimizer_steps: 0,
            last_loss: None,
            saved_at: Utc::now(),
        }
    }
}

/// Saves, rotates and finds checkpoints in an output directory
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    output_dir: PathBuf,
    save_total_limit: Option<usize>,
}

impl CheckpointManager {
    /// Manage checkpoints under `output_dir`
    pub fn new(output_dir: impl Into<PathBuf>, save_total_limit: Option<usize>) -> Self {
        Self {
            output_dir: output_dir.into(),
            save_total_limit,
        }
    }

    /// Output directory
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Save weights, optimizer moments and state as `checkpoint-<global_step>`,
    /// then rotate
    #[instrument(skip(self, var_map, optimizer, state), fields(step = state.global_step))]
    pub async fn save(&self, var_map: &VarMap, optimizer: &AdamWOptimizer, state: &TrainerState) -> Result<PathBuf> {
        let dir = self
            .output_dir
            .join(format!("{}{}", CHECKPOINT_PREFIX, state.global_step));
        tokio::fs::create_dir_all(&dir).await?;

        var_map
            .save(dir.join(WEIGHTS_NAME))
            .map_err(|e| Error::checkpoint(format!("failed to save weights to {}: {}", dir.display(), e)))?;
        optimizer.save_state(&dir.join(OPTIMIZER_STATE_NAME))?;

        let mut state = state.clone();
        state.optimizer_steps = optimizer.step_count();
        state.saved_at = Utc::now();
        tokio::fs::write(dir.join(TRAINER_STATE_NAME), serde_json::to_vec_pretty(&state)?).await?;
        info!(path = %dir.display(), "saved checkpoint");

        self.rotate().await?;
        Ok(dir)
    }

    /// Load weights into `var_map` and return the saved trainer state
    #[instrument(skip(self, var_map))]
    pub async fn load(&self, dir: &Path, var_map: &mut VarMap) -> Result<TrainerState> {
        let state_path = dir.join(TRAINER_STATE_NAME);
        let bytes = tokio::fs::read(&state_path)
            .await
            .map_err(|e| Error::checkpoint(format!("cannot read {}: {}", state_path.display(), e)))?;
        let state: TrainerState = serde_json::from_slice(&bytes)?;

        var_map
            .load(dir.join(WEIGHTS_NAME))
            .map_err(|e| Error::checkpoint(format!("failed to load weights from {}: {}", dir.display(), e)))?;

        info!(
            path = %dir.display(),
            global_step = state.global_step,
            epoch = state.epoch,
            "loaded checkpoint"
        );
        Ok(state)
    }

    /// Restore optimizer moments saved with a checkpoint.
    ///
    /// Returns `false`, leaving the moments at zero, when the checkpoint
    /// carries no optimizer state.
    pub async fn load_optimizer(&self, dir: &Path, optimizer: &mut AdamWOptimizer, state: &TrainerState) -> Result<bool> {
        let path = dir.join(OPTIMIZER_STATE_NAME);
        if !tokio::fs::try_exists(&path).await? {
            warn!(path = %dir.display(), "checkpoint has no optimizer state; moments start from zero");
            return Ok(false);
        }
        optimizer.load_state(&path, state.optimizer_steps)?;
        Ok(true)
    }

    /// Existing checkpoints, oldest first
    pub async fn list(&self) -> Result<Vec<(usize, PathBuf)>> {
        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.output_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(step) = name
                .to_str()
                .and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX))
                .and_then(|s| s.parse::<usize>().ok())
            else {
                continue;
            };
            if entry.file_type().await?.is_dir() {
                found.push((step, entry.path()));
            }
        }
        found.sort_by_key(|(step, _)| *step);
        Ok(found)
    }

    /// Newest checkpoint, if any
    pub async fn latest(&self) -> Result<Option<PathBuf>> {
        Ok(self.list().await?.pop().map(|(_, path)| path))
    }

    /// Delete the oldest checkpoints beyond `save_total_limit`
    async fn rotate(&self) -> Result<()> {
        let Some(limit) = self.save_total_limit else {
            return Ok(());
        };
        let checkpoints = self.list().await?;
        let excess = checkpoints.len().saturating_sub(limit);
        for (step, path) in checkpoints.into_iter().take(excess) {
            debug!(step, path = %path.display(), "removing old checkpoint");
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                warn!(path = %path.display(), error = %e, "failed to remove old checkpoint");
            }
        }
        Ok(())
    }
}

/// Write final weights and the run config into `dir`
pub async fn save_model(dir: &Path, var_map: &VarMap, config: &TrainingConfig) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    var_map
        .save(dir.join(WEIGHTS_NAME))
        .map_err(|e| Error::checkpoint(format!("failed to save weights to {}: {}", dir.display(), e)))?;
    tokio::fs::write(dir.join(CONFIG_NAME), serde_json::to_vec_pretty(config)?).await?;
    info!(path = %dir.display(), "saved model");
    Ok(())
}
