//! Optimizers and learning rate schedulers for preference training
//!
//! This module provides the AdamW optimizer, warmup schedules, gradient
//! accumulation across micro-batches and global-norm clipping.

pub mod adamw;
pub mod schedulers;

pub use adamw::AdamWOptimizer;
pub use schedulers::{Scheduler, WarmupScheduler};

use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use tracing::debug;

use crate::error::Result;

/// Sums gradients over micro-batches.
///
/// Callers scale each micro-batch loss by `1 / accumulation_steps` before
/// `backward`, so the sum is the gradient of the mean loss.
pub struct GradientAccumulator {
    vars: Vec<Var>,
    grads: Option<GradStore>,
    micro_batches: usize,
}

impl GradientAccumulator {
    /// Track gradients of `vars`
    pub fn new(vars: Vec<Var>) -> Self {
        Self {
            vars,
            grads: None,
            micro_batches: 0,
        }
    }

    /// Add one micro-batch's gradients
    pub fn accumulate(&mut self, grads: GradStore) -> Result<()> {
        self.micro_batches += 1;
        let Some(acc) = self.grads.as_mut() else {
            self.grads = Some(grads);
            return Ok(());
        };

        for var in &self.vars {
            let Some(new) = grads.get(var.as_tensor()) else {
                continue;
            };
            let summed = match acc.get(var.as_tensor()) {
                Some(old) => (old + new)?,
                None => new.clone(),
            };
            acc.insert(var.as_tensor(), summed);
        }
        Ok(())
    }

    /// Micro-batches accumulated since the last [`take`](Self::take)
    pub fn micro_batches(&self) -> usize {
        self.micro_batches
    }

    /// Whether nothing has been accumulated
    pub fn is_empty(&self) -> bool {
        self.grads.is_none()
    }

    /// Hand out the accumulated gradients and reset
    pub fn take(&mut self) -> Option<GradStore> {
        self.micro_batches = 0;
        self.grads.take()
    }

    /// Drop accumulated gradients
    pub fn reset(&mut self) {
        self.micro_batches = 0;
        self.grads = None;
    }
}

/// L2 norm over all gradients of `vars`
pub fn global_grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut sum_sq = 0.0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sum_sq += grad
                .to_dtype(DType::F64)?
                .sqr()?
                .sum_all()?
                .to_scalar::<f64>()?;
        }
    }
    Ok(sum_sq.sqrt())
}

/// Rescale gradients so their global norm is at most `max_norm`.
///
/// Returns the norm before clipping. `max_norm <= 0` only measures.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let norm = global_grad_norm(grads, vars)?;
    if max_norm <= 0.0 || !norm.is_finite() || norm <= max_norm {
        return Ok(norm);
    }

    let scale = max_norm / (norm + 1e-6);
    debug!(norm, max_norm, scale, "clipping gradients");
    for var in vars {
        if let Some(grad) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), grad.affine(scale, 0.0)?);
        }
    }
    Ok(norm)
}
