//! The policy model seam
//!
//! The trainer never looks inside the model: it feeds token ids and reads
//! back logits. Parameters live in the model's [`VarMap`], which is what the
//! optimizer updates and what checkpoints persist.

use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use crate::error::Result;

/// A causal language model being trained
pub trait PolicyModel: Send + Sync {
    /// Logits `[B, T, V]` for `input_ids` `[B, T]` (`u32`).
    ///
    /// `attention_mask` is `[B, T]` (`u32`) with 1 on real tokens.
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;

    /// Trainable parameters
    fn var_map(&self) -> &VarMap;

    /// Device holding the parameters
    fn device(&self) -> &Device;

    /// Number of trainable scalars
    fn num_parameters(&self) -> usize {
        self.var_map().all_vars().iter().map(|v| v.elem_count()).sum()
    }
}
