//! Loss functions for preference training
//!
//! This module splits the objective into two layers:
//!
//! - **Log-probability extraction** ([`logprob`]): per-sequence summed or
//!   length-normalized log-likelihood of the completion tokens
//! - **Preference loss** ([`preference`]): the reference-free SimPO margin
//!   loss over chosen/rejected pairs, with an optional SFT term
//! - **Utilities** ([`utils`]): numerically stable softplus and scalar readout
//!
//! # Usage
//!
//! ```rust,ignore
//! use simpo::training::loss::{sequence_logps, SimpoLoss};
//!
//! let loss_fn = SimpoLoss::new(&config.simpo)?;
//! let logps = sequence_logps(&logits, &labels, -100, true)?;
//! let (chosen, rejected) = logps.split_at(batch_size)?;
//! let output = loss_fn.forward_sequences(&chosen, &rejected)?;
//! output.loss.backward()?;
//! ```

pub mod logprob;
pub mod preference;
pub mod utils;

pub use logprob::{masked_mean_logits, sequence_logps, SequenceLogps, DEFAULT_LABEL_PAD_TOKEN_ID};
pub use preference::{pair_loss, pair_margin, PreferenceLossOutput, PreferenceMetrics, SimpoLoss};
