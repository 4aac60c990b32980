//! Reference-free preference loss
//!
//! The implicit reward of a completion is `beta` times its length-normalized
//! log-probability under the policy. A pair is pushed apart until the reward
//! gap exceeds the target margin `gamma = gamma_beta_ratio * beta`.

use std::collections::BTreeMap;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::logprob::SequenceLogps;
use super::utils::{mean_scalar, softplus, softplus_f64, to_f64_vec};
use crate::config::{LossType, SimpoConfig};
use crate::error::{Error, Result};

/// SimPO loss over a batch of (chosen, rejected) log-probabilities
#[derive(Debug, Clone)]
pub struct SimpoLoss {
    config: SimpoConfig,
}

/// Result of a loss evaluation
#[derive(Debug, Clone)]
pub struct PreferenceLossOutput {
    /// Scalar training loss with the gradient tape attached
    pub loss: Tensor,
    /// `[B]` per-pair preference losses
    pub losses: Tensor,
    /// Logged batch means
    pub metrics: PreferenceMetrics,
}

/// Batch means reported alongside the loss
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreferenceMetrics {
    /// `beta * mean(lp_w)`
    pub rewards_chosen: f64,
    /// `beta * mean(lp_l)`
    pub rewards_rejected: f64,
    /// `mean(beta * (lp_w - lp_l))`
    pub rewards_margin: f64,
    /// Fraction of pairs with `lp_w > lp_l`
    pub rewards_accuracy: f64,
    /// `mean(lp_w)`
    pub logps_chosen: f64,
    /// `mean(lp_l)`
    pub logps_rejected: f64,
    /// Mean raw logit over chosen completion positions
    pub logits_chosen: Option<f64>,
    /// Mean raw logit over rejected completion positions
    pub logits_rejected: Option<f64>,
    /// Total loss, including the SFT term when enabled
    pub loss: f64,
    /// Auxiliary NLL on chosen completions
    pub sft_loss: Option<f64>,
}

impl PreferenceMetrics {
    /// Attach the mean raw logits, which only the caller holding the logits knows
    pub fn with_logits(mut self, chosen: f64, rejected: f64) -> Self {
        self.logits_chosen = Some(chosen);
        self.logits_rejected = Some(rejected);
        self
    }

    /// Flatten into the logged metric names, e.g. `eval_rewards/margin` for
    /// prefix `"eval_"`
    pub fn to_map(&self, prefix: &str) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        let mut put = |name: &str, value: f64| {
            map.insert(format!("{prefix}{name}"), value);
        };

        put("rewards/chosen", self.rewards_chosen);
        put("rewards/rejected", self.rewards_rejected);
        put("rewards/margin", self.rewards_margin);
        put("rewards/accuracy", self.rewards_accuracy);
        put("logps/chosen", self.logps_chosen);
        put("logps/rejected", self.logps_rejected);
        if let Some(v) = self.logits_chosen {
            put("logits/chosen", v);
        }
        if let Some(v) = self.logits_rejected {
            put("logits/rejected", v);
        }
        put("loss", self.loss);
        if let Some(v) = self.sft_loss {
            put("sft_loss", v);
        }
        map
    }
}

impl SimpoLoss {
    /// Create a loss from a validated config
    pub fn new(config: &SimpoConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
        })
    }

    /// Loss hyperparameters
    pub fn config(&self) -> &SimpoConfig {
        &self.config
    }

    /// `beta * (lp_w - lp_l) - gamma`, elementwise
    pub fn margins(&self, chosen_logps: &Tensor, rejected_logps: &Tensor) -> Result<Tensor> {
        check_pair_shapes(chosen_logps, rejected_logps)?;
        Ok((chosen_logps - rejected_logps)?.affine(self.config.beta, -self.config.gamma())?)
    }

    /// Per-pair losses for precomputed margins
    pub fn losses_from_margins(&self, margins: &Tensor) -> Result<Tensor> {
        match self.config.loss_type {
            LossType::Sigmoid => {
                let eps = self.config.label_smoothing;
                let primary = softplus(&margins.neg()?)?;
                if eps > 0.0 {
                    let flipped = softplus(margins)?;
                    Ok((primary.affine(1.0 - eps, 0.0)? + flipped.affine(eps, 0.0)?)?)
                } else {
                    Ok(primary)
                }
            }
            LossType::Hinge => Ok(margins.affine(-1.0, 1.0)?.relu()?),
        }
    }

    /// Preference loss for `[B]` chosen and rejected log-probabilities.
    ///
    /// The inputs are normally length-normalized; rewards in the metrics are
    /// `beta` times these values.
    #[instrument(skip_all, level = "debug")]
    pub fn forward(&self, chosen_logps: &Tensor, rejected_logps: &Tensor) -> Result<PreferenceLossOutput> {
        let margins = self.margins(chosen_logps, rejected_logps)?;
        let losses = self.losses_from_margins(&margins)?;
        let loss = losses.mean_all()?;

        let metrics = self.batch_metrics(chosen_logps, rejected_logps, mean_scalar(&loss)?)?;
        debug!(
            loss = metrics.loss,
            margin = metrics.rewards_margin,
            accuracy = metrics.rewards_accuracy,
            "preference loss"
        );

        Ok(PreferenceLossOutput { loss, losses, metrics })
    }

    /// Preference loss plus the optional SFT term on the chosen completions.
    ///
    /// The SFT term is the token-level mean NLL, so it needs the summed
    /// log-probabilities and token counts rather than the averages.
    pub fn forward_sequences(
        &self,
        chosen: &SequenceLogps,
        rejected: &SequenceLogps,
    ) -> Result<PreferenceLossOutput> {
        let mut output = self.forward(&chosen.logps, &rejected.logps)?;
        if self.config.sft_weight <= 0.0 {
            return Ok(output);
        }

        let tokens: usize = chosen.token_counts.iter().sum();
        if tokens == 0 {
            return Err(Error::DegenerateSequence { row: 0 });
        }
        let sft = chosen.summed.sum_all()?.affine(-1.0 / tokens as f64, 0.0)?;
        let sft_value = mean_scalar(&sft)?;

        output.loss = (output.loss + sft.affine(self.config.sft_weight, 0.0)?)?;
        output.metrics.sft_loss = Some(sft_value);
        output.metrics.loss = mean_scalar(&output.loss)?;
        Ok(output)
    }

    fn batch_metrics(&self, chosen: &Tensor, rejected: &Tensor, loss: f64) -> Result<PreferenceMetrics> {
        let beta = self.config.beta;
        let chosen = to_f64_vec(chosen)?;
        let rejected = to_f64_vec(rejected)?;
        let n = chosen.len().max(1) as f64;

        let logps_chosen = chosen.iter().sum::<f64>() / n;
        let logps_rejected = rejected.iter().sum::<f64>() / n;
        let wins = chosen.iter().zip(&rejected).filter(|(w, l)| w > l).count();

        Ok(PreferenceMetrics {
            rewards_chosen: beta * logps_chosen,
            rewards_rejected: beta * logps_rejected,
            rewards_margin: beta * (logps_chosen - logps_rejected),
            rewards_accuracy: wins as f64 / n,
            logps_chosen,
            logps_rejected,
            logits_chosen: None,
            logits_rejected: None,
            loss,
            sft_loss: None,
        })
    }
}

fn check_pair_shapes(chosen: &Tensor, rejected: &Tensor) -> Result<()> {
    if chosen.dims() != rejected.dims() {
        return Err(Error::shape_mismatch(
            "chosen and rejected log-probabilities",
            chosen.dims(),
            rejected.dims(),
        ));
    }
    if chosen.rank() != 1 {
        return Err(Error::shape_mismatch("log-probabilities must be rank 1", &[chosen.elem_count()], chosen.dims()));
    }
    Ok(())
}

/// Margin of a single pair
pub fn pair_margin(lp_w: f64, lp_l: f64, config: &SimpoConfig) -> f64 {
    config.beta * (lp_w - lp_l) - config.gamma()
}

/// Loss of a single pair on plain floats.
///
/// ```
/// use simpo::{pair_loss, SimpoConfig};
///
/// let loss = pair_loss(-2.0, -4.0, &SimpoConfig::new(2.0, 0.5));
/// assert!((loss - 0.0486).abs() < 1e-4);
/// ```
pub fn pair_loss(lp_w: f64, lp_l: f64, config: &SimpoConfig) -> f64 {
    let margin = pair_margin(lp_w, lp_l, config);
    match config.loss_type {
        LossType::Sigmoid => {
            let eps = config.label_smoothing;
            (1.0 - eps) * softplus_f64(-margin) + eps * softplus_f64(margin)
        }
        LossType::Hinge => (1.0 - margin).max(0.0),
    }
}
