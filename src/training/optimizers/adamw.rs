//! AdamW optimizer implementation
//!
//! AdamW with decoupled weight decay over every variable of a [`VarMap`].
//! The first and second moment estimates are held here, keyed by variable
//! name, so they can be written into a checkpoint and restored on resume.

use std::collections::HashMap;
use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::training::config::TrainingArgs;

const FIRST_MOMENT_PREFIX: &str = "exp_avg.";
const SECOND_MOMENT_PREFIX: &str = "exp_avg_sq.";

/// AdamW optimizer with decoupled weight decay
pub struct AdamWOptimizer {
    /// Variables sorted by name
    params: Vec<(String, Var)>,
    vars: Vec<Var>,
    /// (first, second) moment per entry of `params`
    moments: Vec<(Tensor, Tensor)>,
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    weight_decay: f64,
    step_count: usize,
}

impl AdamWOptimizer {
    /// Create an optimizer for every variable in `var_map`
    pub fn new(var_map: &VarMap, args: &TrainingArgs) -> Result<Self> {
        let mut params: Vec<(String, Var)> = var_map
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("variable map lock is poisoned"))?
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));

        let moments = params
            .iter()
            .map(|(_, var)| -> Result<(Tensor, Tensor)> { Ok((var.zeros_like()?, var.zeros_like()?)) })
            .collect::<Result<Vec<_>>>()?;
        let vars = params.iter().map(|(_, var)| var.clone()).collect();

        Ok(Self {
            params,
            vars,
            moments,
            learning_rate: args.learning_rate,
            beta1: args.adam_beta1,
            beta2: args.adam_beta2,
            epsilon: args.adam_epsilon,
            weight_decay: args.weight_decay,
            step_count: 0,
        })
    }

    /// Apply one update from accumulated gradients.
    ///
    /// Variables without a gradient keep their value and moments.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_count += 1;
        let t = self.step_count as i32;
        let scale_m = 1.0 / (1.0 - self.beta1.powi(t));
        let scale_v = 1.0 / (1.0 - self.beta2.powi(t));
        let lr = self.learning_rate;

        for ((_, var), (m, v)) in self.params.iter().zip(self.moments.iter_mut()) {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            // m = b1 * m + (1 - b1) * g, v = b2 * v + (1 - b2) * g^2
            let next_m = (m.affine(self.beta1, 0.0)? + grad.affine(1.0 - self.beta1, 0.0)?)?;
            let next_v = (v.affine(self.beta2, 0.0)? + grad.sqr()?.affine(1.0 - self.beta2, 0.0)?)?;

            let m_hat = next_m.affine(scale_m, 0.0)?;
            let v_hat = next_v.affine(scale_v, 0.0)?;
            let update = (m_hat / v_hat.sqrt()?.affine(1.0, self.epsilon)?)?;

            let decayed = var.as_tensor().affine(1.0 - lr * self.weight_decay, 0.0)?;
            var.set(&(decayed - update.affine(lr, 0.0)?)?)?;
            *m = next_m;
            *v = next_v;
        }
        Ok(())
    }

    /// Current learning rate
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Set learning rate
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    /// Updates applied so far; drives bias correction
    pub fn step_count(&self) -> usize {
        self.step_count
    }

    /// Optimized variables
    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    /// Number of trainable scalars
    pub fn parameter_count(&self) -> usize {
        self.vars.iter().map(|v| v.elem_count()).sum()
    }

    /// Moment estimates keyed `exp_avg.<var>` and `exp_avg_sq.<var>`
    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        let mut tensors = HashMap::with_capacity(2 * self.params.len());
        for ((name, _), (m, v)) in self.params.iter().zip(&self.moments) {
            tensors.insert(format!("{FIRST_MOMENT_PREFIX}{name}"), m.clone());
            tensors.insert(format!("{SECOND_MOMENT_PREFIX}{name}"), v.clone());
        }
        tensors
    }

    /// Write the moment estimates as safetensors
    pub fn save_state(&self, path: &Path) -> Result<()> {
        candle_core::safetensors::save(&self.state_tensors(), path)?;
        Ok(())
    }

    /// Restore moment estimates written by [`save_state`](Self::save_state)
    /// and the update count they correspond to
    pub fn load_state(&mut self, path: &Path, step_count: usize) -> Result<()> {
        let device = self
            .vars
            .first()
            .map(|v| v.device().clone())
            .unwrap_or(Device::Cpu);
        let mut tensors = candle_core::safetensors::load(path, &device)?;

        for ((name, var), (m, v)) in self.params.iter().zip(self.moments.iter_mut()) {
            let mut take = |prefix: &str| -> Result<Tensor> {
                let key = format!("{prefix}{name}");
                let tensor = tensors
                    .remove(&key)
                    .ok_or_else(|| Error::checkpoint(format!("optimizer state has no `{key}`")))?;
                if tensor.dims() != var.dims() {
                    return Err(Error::shape_mismatch(key, var.dims(), tensor.dims()));
                }
                Ok(tensor.to_dtype(var.dtype())?)
            };
            *m = take(FIRST_MOMENT_PREFIX)?;
            *v = take(SECOND_MOMENT_PREFIX)?;
        }

        self.step_count = step_count;
        debug!(path = %path.display(), step_count, "restored optimizer state");
        Ok(())
    }
}
