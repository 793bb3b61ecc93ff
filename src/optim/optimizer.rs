//! Optimizer trait

use crate::error::Result;
use crate::nn::Parameter;

/// Trait for optimization algorithms
pub trait Optimizer {
    /// Perform a single optimization step on the parameters' current gradients
    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()>;

    /// Zero gradients on referenced parameters
    fn zero_grad(&mut self, params: &mut [&mut Parameter]) {
        for param in params.iter_mut() {
            param.zero_grad();
        }
    }

    /// Get learning rate
    fn lr(&self) -> f32;

    /// Set learning rate
    fn set_lr(&mut self, lr: f32);

    /// Whether this optimizer already privatizes gradients before stepping
    fn is_privacy_attached(&self) -> bool {
        false
    }
}
