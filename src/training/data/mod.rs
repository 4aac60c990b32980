//! Data loading infrastructure for preference training
//!
//! This module turns preference records into padded chosen/rejected batches:
//! dialogue splitting, truncation, collation, JSONL datasets and a seeded
//! loader.

use serde::{Deserialize, Serialize};

pub mod batching;
pub mod dialogue;
pub mod loaders;

// Re-exports
pub use batching::{PreferenceBatch, PreferenceCollator};
pub use dialogue::{Message, PreferenceDialogue, Role, TokenizedDialogue};
pub use loaders::{DataLoader, DataLoaderConfig, PreferenceDataset};

/// A tokenized preference example.
///
/// Chosen and rejected completions share `prompt_ids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceExample {
    /// Prompt token ids
    pub prompt_ids: Vec<u32>,
    /// Preferred completion token ids
    pub chosen_ids: Vec<u32>,
    /// Dispreferred completion token ids
    pub rejected_ids: Vec<u32>,
}

impl PreferenceExample {
    /// Create an example
    pub fn new(prompt_ids: Vec<u32>, chosen_ids: Vec<u32>, rejected_ids: Vec<u32>) -> Self {
        Self {
            prompt_ids,
            chosen_ids,
            rejected_ids,
        }
    }

    /// Length of the longer of the two prompt+completion sequences
    pub fn max_len(&self) -> usize {
        self.prompt_ids.len() + self.chosen_ids.len().max(self.rejected_ids.len())
    }
}

/// Error types for data loading
#[derive(thiserror::Error, Debug)]
pub enum DataError {
    /// Dataset file does not exist
    #[error("Dataset not found: {path}")]
    DatasetNotFound {
        /// Requested path
        path: String,
    },

    /// A record could not be parsed or violates a data invariant
    #[error("Malformed data at index {index}: {reason}")]
    MalformedData {
        /// Record index (line number for JSONL, zero-based)
        index: usize,
        /// What is wrong with it
        reason: String,
    },

    /// A message carries an unknown role
    #[error("Unknown message role '{role}'; expected system, user or assistant")]
    UnknownRole {
        /// The offending role string
        role: String,
    },

    /// A dialogue cannot be split into prompt and responses
    #[error("Invalid dialogue: {reason}")]
    InvalidDialogue {
        /// Why the split failed
        reason: String,
    },

    /// The prompt is empty after BOS insertion and truncation, so the first
    /// completion token could never be scored
    #[error("Empty prompt at batch row {row}")]
    EmptyPrompt {
        /// Row index within the batch
        row: usize,
    },

    /// A completion is empty after truncation
    #[error("Empty {which} completion at batch row {row}")]
    EmptyCompletion {
        /// `chosen` or `rejected`
        which: &'static str,
        /// Row index within the batch
        row: usize,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Tensor error
    #[error("Tensor error: {0}")]
    TensorError(#[from] candle_core::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Batch collation error
    #[error("Batch collation error: {reason}")]
    BatchCollationError {
        /// Why collation failed
        reason: String,
    },
}
