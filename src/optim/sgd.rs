//! Stochastic Gradient Descent optimizer

use super::Optimizer;
use crate::error::Result;
use crate::nn::{ParamId, Parameter};
use ndarray::ArrayD;
use std::collections::HashMap;

/// SGD optimizer with optional momentum
#[derive(Debug, Clone)]
pub struct SGD {
    lr: f32,
    momentum: f32,
    velocities: HashMap<ParamId, ArrayD<f32>>,
}

impl SGD {
    /// Create a new SGD optimizer
    pub fn new(lr: f32, momentum: f32) -> Self {
        Self {
            lr,
            momentum,
            velocities: HashMap::new(),
        }
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }
}

impl Optimizer for SGD {
    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()> {
        for param in params.iter_mut() {
            if !param.requires_grad() {
                continue;
            }
            let Some(grad) = param.grad().cloned() else {
                continue;
            };

            if self.momentum > 0.0 {
                // v = momentum * v - lr * grad
                let velocity = match self.velocities.remove(&param.id()) {
                    Some(v) => v * self.momentum - &grad * self.lr,
                    None => &grad * (-self.lr),
                };
                *param.data_mut() += &velocity;
                self.velocities.insert(param.id(), velocity);
            } else {
                // Simple SGD: param -= lr * grad
                param.data_mut().scaled_add(-self.lr, &grad);
            }
        }
        Ok(())
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::ParamRole;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    fn param(values: &[f32], grad: &[f32]) -> Parameter {
        let mut p = Parameter::new("w", ParamRole::Weight, arr1(values).into_dyn());
        p.set_grad(arr1(grad).into_dyn());
        p
    }

    #[test]
    fn test_sgd_plain_step() {
        let mut opt = SGD::new(0.5, 0.0);
        let mut p = param(&[1.0, -1.0], &[2.0, -2.0]);
        opt.step(&mut [&mut p]).unwrap();
        assert_eq!(p.data().as_slice().unwrap(), &[0.0, 0.0]);
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let mut opt = SGD::new(0.1, 0.9);
        let mut p = param(&[0.0], &[1.0]);
        opt.step(&mut [&mut p]).unwrap();
        assert_abs_diff_eq!(p.data()[[0]], -0.1, epsilon = 1e-6);
        opt.step(&mut [&mut p]).unwrap();
        // v = 0.9 * -0.1 - 0.1 = -0.19
        assert_abs_diff_eq!(p.data()[[0]], -0.29, epsilon = 1e-6);
    }

    #[test]
    fn test_sgd_skips_frozen_and_gradless() {
        let mut opt = SGD::new(0.1, 0.0);
        let mut frozen = param(&[1.0], &[1.0]);
        frozen.set_requires_grad(false);
        let mut gradless = Parameter::new("b", ParamRole::Bias, arr1(&[1.0]).into_dyn());
        opt.step(&mut [&mut frozen, &mut gradless]).unwrap();
        assert_eq!(frozen.data()[[0]], 1.0);
        assert_eq!(gradless.data()[[0]], 1.0);
    }
}
