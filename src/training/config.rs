//! Training configuration for SimPO runs
//!
//! A run is described by three sections: the loss hyperparameters
//! ([`SimpoConfig`]), the optimization loop ([`TrainingArgs`]) and the data
//! pipeline ([`DataArgs`]). Every field has a default, so a config file only
//! needs to list what it changes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::SimpoConfig;
use crate::error::{Error, Result};

/// Main training configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    /// Loss hyperparameters
    pub simpo: SimpoConfig,
    /// Optimization loop
    pub training: TrainingArgs,
    /// Data pipeline
    pub data: DataArgs,
}

/// Learning rate schedule after warmup
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerType {
    /// Hold the peak learning rate
    Constant,
    /// Linear decay to zero
    Linear,
    /// Half-cosine decay to zero
    #[default]
    Cosine,
}

/// What to do when a micro-batch produces a NaN or infinite loss, or holds
/// a degenerate example (empty prompt or completion, nothing to score)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NonFinitePolicy {
    /// Stop training with the offending error
    #[default]
    Abort,
    /// Drop the micro-batch's gradient and continue
    SkipBatch,
}

/// Which end of an over-long prompt survives truncation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TruncationMode {
    /// Keep the first tokens
    KeepStart,
    /// Keep the last tokens
    #[default]
    KeepEnd,
}

/// Optimization loop parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingArgs {
    /// Peak learning rate
    pub learning_rate: f64,
    /// Number of passes over the training set
    pub num_train_epochs: usize,
    /// Pairs per training micro-batch
    pub per_device_train_batch_size: usize,
    /// Pairs per evaluation batch
    pub per_device_eval_batch_size: usize,
    /// Micro-batches per optimizer step
    pub gradient_accumulation_steps: usize,
    /// Fraction of total steps spent in linear warmup
    pub warmup_ratio: f64,
    /// Decay schedule
    pub lr_scheduler_type: SchedulerType,
    /// Log every N optimizer steps
    pub logging_steps: usize,
    /// Evaluate every N optimizer steps (0 disables periodic eval)
    pub eval_steps: usize,
    /// Checkpoint every N optimizer steps (0 disables periodic saves)
    pub save_steps: usize,
    /// Number of checkpoints kept on disk
    pub save_total_limit: Option<usize>,
    /// Global gradient norm bound (0 disables clipping)
    pub max_grad_norm: f64,
    /// Seed for shuffling
    pub seed: u64,
    /// AdamW beta1
    pub adam_beta1: f64,
    /// AdamW beta2
    pub adam_beta2: f64,
    /// AdamW epsilon
    pub adam_epsilon: f64,
    /// Decoupled weight decay
    pub weight_decay: f64,
    /// Stop after this many optimizer steps
    pub max_steps: Option<usize>,
    /// Checkpoints, final weights and metrics go here
    pub output_dir: PathBuf,
    /// Run evaluation
    pub do_eval: bool,
    /// Checkpoint directory to resume from; `latest` picks the newest in `output_dir`
    pub resume_from_checkpoint: Option<String>,
    /// Non-finite loss handling
    pub non_finite_policy: NonFinitePolicy,
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            learning_rate: 6e-7,
            num_train_epochs: 1,
            per_device_train_batch_size: 1,
            per_device_eval_batch_size: 1,
            gradient_accumulation_steps: 16,
            warmup_ratio: 0.1,
            lr_scheduler_type: SchedulerType::Cosine,
            logging_steps: 5,
            eval_steps: 400,
            save_steps: 1000,
            save_total_limit: Some(20),
            max_grad_norm: 1.0,
            seed: 42,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
            weight_decay: 0.0,
            max_steps: None,
            output_dir: PathBuf::from("outputs/simpo"),
            do_eval: true,
            resume_from_checkpoint: None,
            non_finite_policy: NonFinitePolicy::Abort,
        }
    }
}

impl TrainingArgs {
    /// Warmup steps for a run of `total_steps` optimizer steps
    pub fn warmup_steps(&self, total_steps: usize) -> usize {
        (self.warmup_ratio * total_steps as f64).ceil() as usize
    }

    /// Optimizer steps per epoch for `num_batches` micro-batches
    pub fn steps_per_epoch(&self, num_batches: usize) -> usize {
        num_batches.div_ceil(self.gradient_accumulation_steps.max(1))
    }

    /// Optimizer steps for the whole run; `max_steps` overrides the epoch count
    pub fn total_steps(&self, num_batches: usize) -> usize {
        match self.max_steps {
            Some(max) => max,
            None => self.steps_per_epoch(num_batches) * self.num_train_epochs,
        }
    }

    /// Epochs needed to reach [`total_steps`](Self::total_steps)
    pub fn num_epochs(&self, num_batches: usize) -> usize {
        match self.max_steps {
            Some(max) => max.div_ceil(self.steps_per_epoch(num_batches).max(1)),
            None => self.num_train_epochs,
        }
    }
}

/// Data pipeline parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DataArgs {
    /// Training JSONL file
    pub train_file: Option<PathBuf>,
    /// Evaluation JSONL file
    pub eval_file: Option<PathBuf>,
    /// Maximum prompt+completion length
    pub max_length: usize,
    /// Prompt length after truncation
    pub max_prompt_length: usize,
    /// Which end of the prompt to keep
    pub truncation_mode: TruncationMode,
    /// Label value excluded from the log-probabilities
    pub label_pad_token_id: i64,
    /// Input id used for padding
    pub padding_value: u32,
    /// Prepended to prompts when set
    pub bos_token_id: Option<u32>,
    /// Appended to completions when set
    pub eos_token_id: Option<u32>,
    /// Cap on training examples
    pub max_train_samples: Option<usize>,
    /// Cap on evaluation examples
    pub max_eval_samples: Option<usize>,
    /// Prepend an empty system message to dialogue prompts
    pub auto_insert_empty_system_msg: bool,
}

impl Default for DataArgs {
    fn default() -> Self {
        Self {
            train_file: None,
            eval_file: None,
            max_length: 192,
            max_prompt_length: 96,
            truncation_mode: TruncationMode::KeepEnd,
            label_pad_token_id: -100,
            padding_value: 0,
            bos_token_id: None,
            eos_token_id: None,
            max_train_samples: Some(10_000),
            max_eval_samples: Some(1_000),
            auto_insert_empty_system_msg: true,
        }
    }
}

impl TrainingConfig {
    /// Create a new training configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a `.json`, `.yaml` or `.yml` file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;

        let config = if is_json(path) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };
        Ok(config)
    }

    /// Save configuration; the extension selects JSON or YAML
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = if is_json(path) {
            serde_json::to_string_pretty(self)?
        } else {
            serde_yaml::to_string(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate all sections
    pub fn validate(&self) -> Result<()> {
        self.simpo.validate()?;

        let t = &self.training;
        if !t.learning_rate.is_finite() || t.learning_rate <= 0.0 {
            return Err(Error::config("learning_rate must be positive"));
        }
        if t.num_train_epochs == 0 && t.max_steps.is_none() {
            return Err(Error::config("num_train_epochs must be greater than 0"));
        }
        if t.per_device_train_batch_size == 0 || t.per_device_eval_batch_size == 0 {
            return Err(Error::config("batch sizes must be greater than 0"));
        }
        if t.gradient_accumulation_steps == 0 {
            return Err(Error::config("gradient_accumulation_steps must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&t.warmup_ratio) {
            return Err(Error::config("warmup_ratio must be in [0, 1]"));
        }
        if t.logging_steps == 0 {
            return Err(Error::config("logging_steps must be greater than 0"));
        }
        if t.save_total_limit == Some(0) {
            return Err(Error::config("save_total_limit must be greater than 0 when set"));
        }
        if !t.max_grad_norm.is_finite() || t.max_grad_norm < 0.0 {
            return Err(Error::config("max_grad_norm must be non-negative"));
        }
        if !(0.0..1.0).contains(&t.adam_beta1) || !(0.0..1.0).contains(&t.adam_beta2) {
            return Err(Error::config("adam betas must be in [0, 1)"));
        }
        if t.adam_epsilon <= 0.0 || t.weight_decay < 0.0 {
            return Err(Error::config("adam_epsilon must be positive and weight_decay non-negative"));
        }
        if t.max_steps == Some(0) {
            return Err(Error::config("max_steps must be greater than 0 when set"));
        }

        let d = &self.data;
        if d.max_prompt_length == 0 || d.max_prompt_length >= d.max_length {
            return Err(Error::config(format!(
                "max_prompt_length ({}) must be in [1, max_length ({}))",
                d.max_prompt_length, d.max_length
            )));
        }
        if d.label_pad_token_id >= 0 {
            return Err(Error::config("label_pad_token_id must be negative so it never collides with a token id"));
        }

        Ok(())
    }

    /// Get effective batch size (batch_size * gradient_accumulation_steps)
    pub fn effective_batch_size(&self) -> usize {
        self.training.per_device_train_batch_size * self.training.gradient_accumulation_steps
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some("json")
}
