//! Configuration structures for the SimPO objective

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::error::{Error, Result};

/// Below this beta the sigmoid saturates slowly and gradients become tiny.
const SMALL_BETA_WARNING: f64 = 0.1;

/// Hyperparameters of the SimPO preference loss
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimpoConfig {
    /// Reward scale applied to the length-normalized log-probabilities
    pub beta: f64,
    /// Target margin expressed as a fraction of beta (gamma / beta)
    pub gamma_beta_ratio: f64,
    /// Loss variant
    pub loss_type: LossType,
    /// Conservative label smoothing, sigmoid variant only
    pub label_smoothing: f64,
    /// Weight of the auxiliary NLL term on chosen completions
    pub sft_weight: f64,
}

impl Default for SimpoConfig {
    fn default() -> Self {
        Self {
            beta: 2.0,
            gamma_beta_ratio: 0.5,
            loss_type: LossType::Sigmoid,
            label_smoothing: 0.0,
            sft_weight: 0.0,
        }
    }
}

impl SimpoConfig {
    /// Create a config with the given beta and gamma/beta ratio
    pub fn new(beta: f64, gamma_beta_ratio: f64) -> Self {
        Self {
            beta,
            gamma_beta_ratio,
            ..Self::default()
        }
    }

    /// Set the loss variant
    pub fn with_loss_type(mut self, loss_type: LossType) -> Self {
        self.loss_type = loss_type;
        self
    }

    /// Set label smoothing
    pub fn with_label_smoothing(mut self, label_smoothing: f64) -> Self {
        self.label_smoothing = label_smoothing;
        self
    }

    /// Enable the auxiliary SFT term
    pub fn with_sft_weight(mut self, sft_weight: f64) -> Self {
        self.sft_weight = sft_weight;
        self
    }

    /// Absolute target margin gamma
    pub fn gamma(&self) -> f64 {
        self.gamma_beta_ratio * self.beta
    }

    /// Validate hyperparameters before any batch is processed
    pub fn validate(&self) -> Result<()> {
        if !self.beta.is_finite() || self.beta <= 0.0 {
            return Err(Error::config(format!("beta must be a positive finite number, got {}", self.beta)));
        }

        if !self.gamma_beta_ratio.is_finite() {
            return Err(Error::config("gamma_beta_ratio must be finite"));
        }

        if !(0.0..0.5).contains(&self.label_smoothing) {
            return Err(Error::config(format!(
                "label_smoothing must be in [0, 0.5), got {}",
                self.label_smoothing
            )));
        }

        if self.label_smoothing > 0.0 && self.loss_type == LossType::Hinge {
            return Err(Error::config("label_smoothing is not supported with the hinge loss"));
        }

        if !self.sft_weight.is_finite() || self.sft_weight < 0.0 {
            return Err(Error::config("sft_weight must be a non-negative finite number"));
        }

        if self.beta < SMALL_BETA_WARNING {
            warn!(beta = self.beta, "beta is very small; preference gradients may vanish");
        }

        if !(0.0..=1.0).contains(&self.gamma_beta_ratio) {
            warn!(
                gamma_beta_ratio = self.gamma_beta_ratio,
                "gamma_beta_ratio outside the usual [0, 1] range"
            );
        }

        Ok(())
    }
}

/// Preference loss variants, selected once per training run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LossType {
    /// `-log(sigmoid(margin))`
    #[default]
    Sigmoid,
    /// `max(0, 1 - margin)`
    Hinge,
}

impl fmt::Display for LossType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossType::Sigmoid => write!(f, "sigmoid"),
            LossType::Hinge => write!(f, "hinge"),
        }
    }
}

impl FromStr for LossType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sigmoid" => Ok(LossType::Sigmoid),
            "hinge" => Ok(LossType::Hinge),
            other => Err(Error::config(format!(
                "unknown loss_type '{}', expected 'sigmoid' or 'hinge'",
                other
            ))),
        }
    }
}
