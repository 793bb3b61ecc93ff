//! Privacy engine: attach/detach lifecycle and the privatized step.
//!
//! Per step, after the backward pass has filled the per-example samples:
//! 1. Clip each example's gradient to the configured bound and sum
//! 2. Add calibrated Gaussian noise and rescale
//! 3. Record the step in the RDP ledger

use tracing::{debug, info, warn};

use super::accountant::RdpAccountant;
use super::clip::clip_and_aggregate;
use super::config::{ClippingConfig, PrivacyConfig};
use super::grad_sample::CaptureSession;
use super::noise::NoiseInjector;
use super::validator::ModelValidator;
use crate::error::{Error, Result};
use crate::nn::{LossReduction, Module, Parameter, Sequential};
use crate::optim::{Optimizer, PrivateOptimizer};

/// Lifecycle of a [`PrivacyEngine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Unattached,
    Attached,
    Detached,
}

/// What one privatized step did
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    /// Steps recorded in the ledger, including this one
    pub step: usize,
    pub sample_count: usize,
    pub clipped_examples: usize,
    pub max_norm: f64,
    pub mean_norm: f64,
    /// Standard deviation of the noise added to the clipped sum
    pub noise_std: f64,
}

/// Differentially private training on top of a model and an optimizer
///
/// Attach it to a model, then either call [`privatize_gradients`](Self::privatize_gradients)
/// before the optimizer's native update or let a [`PrivateOptimizer`] from
/// [`wrap`](Self::wrap) do that.
#[derive(Debug)]
pub struct PrivacyEngine {
    config: PrivacyConfig,
    clipping: ClippingConfig,
    state: EngineState,
    session: Option<CaptureSession>,
    accountant: RdpAccountant,
    noise: NoiseInjector,
}

impl PrivacyEngine {
    /// Create an unattached engine
    pub fn new(config: PrivacyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            clipping: config.clipping(),
            accountant: RdpAccountant::new(config.alphas.clone()),
            noise: NoiseInjector::new(config.seed),
            state: EngineState::Unattached,
            session: None,
            config,
        })
    }

    /// Validate the model and install per-example gradient capture
    ///
    /// Starts a fresh ledger. On error nothing is installed.
    pub fn attach(&mut self, model: &mut Sequential) -> Result<()> {
        if self.state == EngineState::Attached {
            return Err(Error::DoubleAttach("privacy engine is already attached".into()));
        }
        ModelValidator::validate(model)?;

        if let Some(bounds) = &self.clipping.per_layer_max_grad_norm {
            let trainable = model.parameters().iter().filter(|p| p.requires_grad()).count();
            if bounds.len() != trainable {
                return Err(Error::InvalidConfig(format!(
                    "{} per-layer clipping bounds for {trainable} trainable parameters",
                    bounds.len()
                )));
            }
        }

        let session = CaptureSession::attach(model, self.config.loss_reduction)?;
        info!(
            hooks = session.hooked(),
            alphas = self.config.alphas.len(),
            noise_multiplier = self.config.noise_multiplier,
            max_grad_norm = self.clipping.total_bound(),
            sample_rate = self.config.sampling_rate(),
            "privacy engine attached"
        );

        self.session = Some(session);
        self.accountant = RdpAccountant::new(self.config.alphas.clone());
        self.noise = NoiseInjector::new(self.config.seed);
        self.state = EngineState::Attached;
        Ok(())
    }

    /// Decorate an optimizer so every `step` is privatized first
    pub fn wrap<'a, O: Optimizer + ?Sized>(
        &'a mut self,
        optimizer: &'a mut O,
    ) -> Result<PrivateOptimizer<'a, O>> {
        if self.state != EngineState::Attached {
            return Err(Error::NotAttached);
        }
        if optimizer.is_privacy_attached() {
            return Err(Error::DoubleAttach("optimizer is already privatized".into()));
        }
        Ok(PrivateOptimizer::new(self, optimizer))
    }

    /// Replace every trainable gradient with its clipped and noised version
    /// and charge the step to the ledger
    pub fn privatize_gradients(&mut self, params: &mut [&mut Parameter]) -> Result<StepReport> {
        if self.state != EngineState::Attached {
            return Err(Error::NotAttached);
        }
        self.check_budget()?;

        let stats = clip_and_aggregate(params, &self.clipping)?;

        let noise_std = self.config.noise_multiplier * stats.bound;
        let divisor = match self.config.loss_reduction {
            LossReduction::Mean => stats.sample_count.max(1) as f64,
            LossReduction::Sum => 1.0,
        };
        self.noise.apply(params, noise_std, divisor);

        self.accountant.record_step(self.config.noise_multiplier, self.config.sampling_rate());

        let report = StepReport {
            step: self.accountant.steps(),
            sample_count: stats.sample_count,
            clipped_examples: stats.clipped_examples,
            max_norm: stats.max_norm,
            mean_norm: stats.mean_norm,
            noise_std,
        };
        debug!(
            step = report.step,
            samples = report.sample_count,
            clipped = report.clipped_examples,
            max_norm = report.max_norm,
            noise_std = report.noise_std,
            "privatized gradients"
        );
        Ok(report)
    }

    /// Privatize, then run the optimizer's native update
    pub fn step<O: Optimizer + ?Sized>(
        &mut self,
        params: &mut [&mut Parameter],
        optimizer: &mut O,
    ) -> Result<StepReport> {
        let report = self.privatize_gradients(params)?;
        optimizer.step(params)?;
        Ok(report)
    }

    /// Remove the capture hooks; the ledger stays queryable
    pub fn detach(&mut self, model: &mut Sequential) -> Result<()> {
        if self.state != EngineState::Attached {
            return Err(Error::NotAttached);
        }
        let session = self.session.as_ref().ok_or(Error::NotAttached)?;
        session.detach(model)?;

        info!(steps = self.accountant.steps(), "privacy engine detached");
        self.session = None;
        self.state = EngineState::Detached;
        Ok(())
    }

    /// `(epsilon, best_alpha)` spent so far
    pub fn get_privacy_spent(&self, target_delta: f64) -> Result<(f64, f64)> {
        if self.state == EngineState::Unattached {
            return Err(Error::NotAttached);
        }
        self.accountant.get_privacy_spent(target_delta)
    }

    fn check_budget(&self) -> Result<()> {
        let Some(budget) = self.config.budget.filter(|_| self.config.strict_budget) else {
            return Ok(());
        };
        if self.accountant.steps() == 0 {
            return Ok(());
        }
        let (spent, _) = self.accountant.get_privacy_spent(budget.delta)?;
        if !budget.allows(spent) {
            warn!(spent, budget = budget.epsilon, "privacy budget exhausted");
            return Err(Error::BudgetExhausted {
                spent,
                budget: budget.epsilon,
            });
        }
        Ok(())
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &PrivacyConfig {
        &self.config
    }

    pub fn accountant(&self) -> &RdpAccountant {
        &self.accountant
    }

    /// Steps recorded in the current ledger
    pub fn steps(&self) -> usize {
        self.accountant.steps()
    }
}
