//! Training infrastructure for SimPO
//!
//! This module provides everything between preference records and updated
//! model weights.
//!
//! # Main Components
//!
//! - **Configuration**: training and data arguments, file loading, validation
//! - **Data**: dialogue splitting, truncation, collation, JSONL datasets, loaders
//! - **Loss**: sequence log-probabilities and the SimPO preference loss
//! - **Optimizers**: AdamW, warmup schedules, accumulation and clipping
//! - **Checkpoints**: weights plus trainer position, rotation, resume
//! - **Metrics**: windowed averaging, history and exporters
//! - **Trainer**: the training loop
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use simpo::training::{DataLoader, SimpoTrainer, TrainingConfig};
//!
//! let config = TrainingConfig::from_file("simpo.yaml")?;
//! let mut trainer = SimpoTrainer::new(config, model, train_loader, Some(eval_loader))?;
//! let summary = trainer.train().await?;
//! ```

pub mod checkpoints;
pub mod config;
pub mod data;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizers;
pub mod trainer;

// Tests module
#[cfg(test)]
pub mod tests;

// Configuration re-exports
pub use config::{DataArgs, NonFinitePolicy, SchedulerType, TrainingArgs, TrainingConfig, TruncationMode};

// Trainer re-exports
pub use trainer::{SimpoTrainer, TrainingEvent, TrainingStatus, TrainingSummary};

// Component re-exports
pub use checkpoints::{CheckpointManager, TrainerState};
pub use data::{DataLoader, DataLoaderConfig, PreferenceBatch, PreferenceCollator, PreferenceDataset, PreferenceExample};
pub use loss::{sequence_logps, PreferenceLossOutput, PreferenceMetrics, SequenceLogps, SimpoLoss};
pub use metrics::{LogRecord, MetricsTracker};
pub use model::PolicyModel;
