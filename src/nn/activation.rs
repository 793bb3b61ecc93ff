//! Parameter-free layers

use super::module::{HookTable, LayerKind, Module};
use super::parameter::Parameter;
use super::shape::reshape;
use crate::error::{Error, Result};
use ndarray::ArrayD;

/// Rectified linear unit
#[derive(Debug, Clone, Default)]
pub struct ReLU {
    mask: Option<ArrayD<f32>>,
}

impl ReLU {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for ReLU {
    fn kind(&self) -> LayerKind {
        LayerKind::ReLU
    }

    fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.mask = Some(input.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }));
        Ok(input.mapv(|v| v.max(0.0)))
    }

    fn backward(
        &mut self,
        grad_output: &ArrayD<f32>,
        _hooks: &mut HookTable,
    ) -> Result<ArrayD<f32>> {
        let mask = self
            .mask
            .as_ref()
            .ok_or_else(|| Error::Shape("ReLU::backward called before forward".into()))?;
        Ok(grad_output * mask)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        Vec::new()
    }
}

/// Collapse every dim from `start_dim` on into one
#[derive(Debug, Clone)]
pub struct Flatten {
    start_dim: usize,
    input_shape: Option<Vec<usize>>,
}

impl Flatten {
    pub fn new(start_dim: usize) -> Self {
        Self {
            start_dim,
            input_shape: None,
        }
    }
}

impl Default for Flatten {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Module for Flatten {
    fn kind(&self) -> LayerKind {
        LayerKind::Flatten {
            start_dim: self.start_dim,
        }
    }

    fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let shape = input.shape();
        if self.start_dim >= shape.len() {
            return Err(Error::Shape(format!(
                "cannot flatten from dim {} of {shape:?}",
                self.start_dim
            )));
        }
        let mut out: Vec<usize> = shape[..self.start_dim].to_vec();
        out.push(shape[self.start_dim..].iter().product());
        self.input_shape = Some(shape.to_vec());
        reshape(input, &out)
    }

    fn backward(
        &mut self,
        grad_output: &ArrayD<f32>,
        _hooks: &mut HookTable,
    ) -> Result<ArrayD<f32>> {
        let shape = self
            .input_shape
            .as_ref()
            .ok_or_else(|| Error::Shape("Flatten::backward called before forward".into()))?;
        reshape(grad_output, shape)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        Vec::new()
    }
}
