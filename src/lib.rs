//! SimPO - reference-free preference optimization on candle
//!
//! This crate computes the SimPO objective, a margin loss over the
//! length-normalized log-probabilities of chosen and rejected completions that
//! needs no reference model, and provides a trainer that optimizes any
//! [`training::PolicyModel`] with it.
//!
//! ```
//! use simpo::{pair_loss, SimpoConfig};
//!
//! // Chosen answer already ahead of the target margin
//! let config = SimpoConfig::new(2.0, 0.5);
//! assert!(pair_loss(-2.0, -4.0, &config) < pair_loss(-4.0, -2.0, &config));
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod error;
pub mod logging;
pub mod training;

// Re-exports
pub use config::{LossType, SimpoConfig};
pub use error::{Error, Result};
pub use training::loss::{pair_loss, pair_margin, sequence_logps, PreferenceMetrics, SimpoLoss};
pub use training::{PolicyModel, SimpoTrainer, TrainingConfig};
