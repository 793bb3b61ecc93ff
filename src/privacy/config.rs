//! Configuration for a privacy engine attachment.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::accountant::MAX_ORDER;
use crate::error::{Error, Result};
use crate::nn::LossReduction;

/// Default Rényi orders: 1.1, 1.2, ..., 10.9 followed by 12, 13, ..., 63
pub fn default_alphas() -> Vec<f64> {
    (1..100)
        .map(|x| 1.0 + f64::from(x) / 10.0)
        .chain((12..64).map(f64::from))
        .collect()
}

/// Target `(epsilon, delta)` guarantee for a training run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrivacyBudget {
    /// Privacy loss parameter epsilon (smaller = more private)
    pub epsilon: f64,
    /// Probability of privacy breach delta, also the delta the spent epsilon
    /// is measured at
    pub delta: f64,
}

impl PrivacyBudget {
    pub fn new(epsilon: f64, delta: f64) -> Self {
        Self { epsilon, delta }
    }

    /// Whether a run that spent `spent` epsilon is still within budget
    pub fn allows(&self, spent: f64) -> bool {
        spent <= self.epsilon
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.epsilon > 0.0 && self.epsilon.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "budget epsilon {} must be positive",
                self.epsilon
            )));
        }
        if !(self.delta > 0.0 && self.delta < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "budget delta {} must be in (0, 1)",
                self.delta
            )));
        }
        Ok(())
    }
}

impl Default for PrivacyBudget {
    fn default() -> Self {
        Self {
            epsilon: 8.0,
            delta: 1e-5,
        }
    }
}

/// Everything an attachment needs, fixed for its whole lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyConfig {
    /// Noise multiplier (sigma = noise_multiplier * max_grad_norm)
    pub noise_multiplier: f64,
    /// Bound on each example's global gradient norm
    pub max_grad_norm: f64,
    /// Expected number of examples per batch
    pub batch_size: usize,
    /// Total number of examples in the dataset
    pub sample_size: usize,
    /// Rényi orders tracked by the ledger
    #[serde(default = "default_alphas")]
    pub alphas: Vec<f64>,
    /// One clipping bound per trainable parameter, replacing the global bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_layer_max_grad_norm: Option<Vec<f64>>,
    /// Reduction used by the training loss
    #[serde(default)]
    pub loss_reduction: LossReduction,
    /// Fixed noise seed, for reproducible tests only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Target guarantee
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<PrivacyBudget>,
    /// Refuse further steps once the budget is spent
    #[serde(default)]
    pub strict_budget: bool,
}

/// Clipping view of a [`PrivacyConfig`]
#[derive(Debug, Clone, PartialEq)]
pub struct ClippingConfig {
    pub max_grad_norm: f64,
    pub per_layer_max_grad_norm: Option<Vec<f64>>,
}

impl ClippingConfig {
    /// Bound on an example's total gradient norm after clipping
    pub fn total_bound(&self) -> f64 {
        match &self.per_layer_max_grad_norm {
            Some(bounds) => bounds.iter().map(|c| c * c).sum::<f64>().sqrt(),
            None => self.max_grad_norm,
        }
    }
}

/// Noise and sampling view of a [`PrivacyConfig`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseConfig {
    pub noise_multiplier: f64,
    pub batch_size: usize,
    pub sample_size: usize,
}

impl NoiseConfig {
    /// Probability that a given example lands in a batch
    pub fn sampling_rate(&self) -> f64 {
        self.batch_size as f64 / self.sample_size as f64
    }
}

impl PrivacyConfig {
    /// Configuration with entrenar's DP-SGD defaults for noise and clipping
    pub fn new(batch_size: usize, sample_size: usize) -> Self {
        Self {
            noise_multiplier: 1.1,
            max_grad_norm: 1.0,
            batch_size,
            sample_size,
            alphas: default_alphas(),
            per_layer_max_grad_norm: None,
            loss_reduction: LossReduction::Mean,
            seed: None,
            budget: None,
            strict_budget: false,
        }
    }

    /// Set noise multiplier
    pub fn with_noise_multiplier(mut self, multiplier: f64) -> Self {
        self.noise_multiplier = multiplier;
        self
    }

    /// Set maximum gradient norm
    pub fn with_max_grad_norm(mut self, norm: f64) -> Self {
        self.max_grad_norm = norm;
        self
    }

    /// Set the Rényi orders
    pub fn with_alphas(mut self, alphas: Vec<f64>) -> Self {
        self.alphas = alphas;
        self
    }

    /// Clip every trainable parameter against its own bound
    pub fn with_per_layer_max_grad_norm(mut self, norms: Vec<f64>) -> Self {
        self.per_layer_max_grad_norm = Some(norms);
        self
    }

    pub fn with_loss_reduction(mut self, reduction: LossReduction) -> Self {
        self.loss_reduction = reduction;
        self
    }

    /// Seed the noise generator
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set privacy budget
    pub fn with_budget(mut self, budget: PrivacyBudget) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Set strict budget enforcement
    pub fn with_strict_budget(mut self, strict: bool) -> Self {
        self.strict_budget = strict;
        self
    }

    pub fn clipping(&self) -> ClippingConfig {
        ClippingConfig {
            max_grad_norm: self.max_grad_norm,
            per_layer_max_grad_norm: self.per_layer_max_grad_norm.clone(),
        }
    }

    pub fn noise(&self) -> NoiseConfig {
        NoiseConfig {
            noise_multiplier: self.noise_multiplier,
            batch_size: self.batch_size,
            sample_size: self.sample_size,
        }
    }

    /// batch_size / sample_size
    pub fn sampling_rate(&self) -> f64 {
        self.noise().sampling_rate()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.max_grad_norm > 0.0 && self.max_grad_norm.is_finite()) {
            return Err(Error::InvalidConfig("max_grad_norm must be positive".to_string()));
        }
        if !(self.noise_multiplier >= 0.0 && self.noise_multiplier.is_finite()) {
            return Err(Error::InvalidConfig("noise_multiplier must be non-negative".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be positive".to_string()));
        }
        if self.batch_size > self.sample_size {
            return Err(Error::InvalidConfig(format!(
                "batch_size {} exceeds sample_size {}",
                self.batch_size, self.sample_size
            )));
        }
        if self.alphas.is_empty() {
            return Err(Error::InvalidConfig("alphas must not be empty".to_string()));
        }
        if let Some(bad) = self
            .alphas
            .iter()
            .find(|a| !(**a > 1.0 && **a <= MAX_ORDER))
        {
            return Err(Error::InvalidConfig(format!(
                "alpha {bad} must be in (1, {MAX_ORDER}]"
            )));
        }
        if let Some(norms) = &self.per_layer_max_grad_norm {
            if norms.is_empty() || norms.iter().any(|c| !(*c > 0.0 && c.is_finite())) {
                return Err(Error::InvalidConfig(
                    "per_layer_max_grad_norm must hold positive bounds".to_string(),
                ));
            }
        }
        if let Some(budget) = &self.budget {
            budget.validate()?;
        }
        Ok(())
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
