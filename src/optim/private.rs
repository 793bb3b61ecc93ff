//! Optimizer decorator that privatizes gradients before the native update

use super::Optimizer;
use crate::error::Result;
use crate::nn::Parameter;
use crate::privacy::{PrivacyEngine, StepReport};

/// Borrowed pairing of an attached [`PrivacyEngine`] and an optimizer
///
/// `step` clips, noises and accounts, then runs the inner optimizer. Dropping
/// the wrapper leaves the inner optimizer exactly as it was.
#[derive(Debug)]
pub struct PrivateOptimizer<'a, O: Optimizer + ?Sized> {
    engine: &'a mut PrivacyEngine,
    inner: &'a mut O,
    last_report: Option<StepReport>,
}

impl<'a, O: Optimizer + ?Sized> PrivateOptimizer<'a, O> {
    pub(crate) fn new(engine: &'a mut PrivacyEngine, inner: &'a mut O) -> Self {
        Self {
            engine,
            inner,
            last_report: None,
        }
    }

    /// Report of the latest successful step
    pub fn last_report(&self) -> Option<&StepReport> {
        self.last_report.as_ref()
    }

    pub fn engine(&self) -> &PrivacyEngine {
        self.engine
    }
}

impl<O: Optimizer + ?Sized> Optimizer for PrivateOptimizer<'_, O> {
    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()> {
        let report = self.engine.privatize_gradients(params)?;
        self.inner.step(params)?;
        self.last_report = Some(report);
        Ok(())
    }

    fn zero_grad(&mut self, params: &mut [&mut Parameter]) {
        self.inner.zero_grad(params);
    }

    fn lr(&self) -> f32 {
        self.inner.lr()
    }

    fn set_lr(&mut self, lr: f32) {
        self.inner.set_lr(lr);
    }

    fn is_privacy_attached(&self) -> bool {
        true
    }
}
