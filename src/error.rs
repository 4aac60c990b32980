//! Error types for the SimPO crate

use thiserror::Error;

use crate::training::data::DataError;

/// Main error type for SimPO operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (invalid hyperparameters, unreadable config file)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Chosen and rejected inputs disagree in shape
    #[error("Shape mismatch: {what} (expected {expected:?}, got {actual:?})")]
    ShapeMismatch {
        /// Which inputs disagree
        what: String,
        /// Expected dimensions
        expected: Vec<usize>,
        /// Actual dimensions
        actual: Vec<usize>,
    },

    /// A sequence has no completion tokens to average over
    #[error("Sequence {row} has no completion tokens; all positions are masked")]
    DegenerateSequence {
        /// Row index within the batch
        row: usize,
    },

    /// Loss evaluated to NaN or infinity
    #[error("Non-finite loss {value} at step {step}")]
    NonFiniteLoss {
        /// Offending loss value
        value: f64,
        /// Global optimizer step
        step: usize,
    },

    /// Checkpoint save/load error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Data pipeline error
    #[error(transparent)]
    Data(#[from] DataError),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for SimPO operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(what: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Whether the training loop may skip the offending batch and continue.
    ///
    /// Covers bad loss values and degenerate examples, whether caught by the
    /// collator or by the log-probability extractor.
    pub fn is_batch_local(&self) -> bool {
        matches!(
            self,
            Self::NonFiniteLoss { .. }
                | Self::DegenerateSequence { .. }
                | Self::Data(DataError::EmptyPrompt { .. } | DataError::EmptyCompletion { .. })
        )
    }
}
