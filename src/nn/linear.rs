//! Fully connected layer

use super::module::{HookTable, LayerKind, Module};
use super::parameter::{ParamRole, Parameter};
use super::shape::{as_matrix, reshape};
use crate::error::{Error, Result};
use ndarray::{Array1, Array2, ArrayD, Axis, Ix1, Ix2};
use rand::Rng;

/// Affine layer `y = x W^T + b` applied over the last axis of `[batch, .., in]`
#[derive(Debug, Clone)]
pub struct Linear {
    in_features: usize,
    out_features: usize,
    weight: Parameter,
    bias: Option<Parameter>,
    input: Option<ArrayD<f32>>,
}

impl Linear {
    /// Create a layer with uniform(-1/sqrt(in), 1/sqrt(in)) initialization
    pub fn new(in_features: usize, out_features: usize, bias: bool) -> Self {
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();
        let mut rng = rand::rng();
        let weight = Array2::from_shape_fn((out_features, in_features), |_| {
            rng.random_range(-bound..=bound)
        });
        let bias = bias.then(|| {
            Array1::from_shape_fn(out_features, |_| rng.random_range(-bound..=bound))
        });
        Self::from_weights(weight, bias)
    }

    /// Create a layer from explicit weights `[out, in]` and bias `[out]`
    pub fn from_weights(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Self {
        let (out_features, in_features) = weight.dim();
        Self {
            in_features,
            out_features,
            weight: Parameter::new("weight", ParamRole::Weight, weight.into_dyn()),
            bias: bias.map(|b| Parameter::new("bias", ParamRole::Bias, b.into_dyn())),
            input: None,
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    fn weight_matrix(&self) -> Result<Array2<f32>> {
        Ok(self.weight.data().clone().into_dimensionality::<Ix2>()?)
    }
}

impl Module for Linear {
    fn kind(&self) -> LayerKind {
        LayerKind::Linear
    }

    fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let shape = input.shape().to_vec();
        if shape.last() != Some(&self.in_features) {
            return Err(Error::Shape(format!(
                "Linear expects last dim {}, got {shape:?}",
                self.in_features
            )));
        }
        let x = as_matrix(input)?;
        let mut y = x.dot(&self.weight_matrix()?.t());
        if let Some(bias) = &self.bias {
            let b = bias.data().view().into_dimensionality::<Ix1>()?;
            y += &b;
        }

        let mut out_shape = shape;
        if let Some(last) = out_shape.last_mut() {
            *last = self.out_features;
        }
        self.input = Some(input.clone());
        reshape(&y.into_dyn(), &out_shape)
    }

    fn backward(
        &mut self,
        grad_output: &ArrayD<f32>,
        hooks: &mut HookTable,
    ) -> Result<ArrayD<f32>> {
        let input = self
            .input
            .as_ref()
            .ok_or_else(|| Error::Shape("Linear::backward called before forward".into()))?;
        let g = as_matrix(grad_output)?;
        let x = as_matrix(input)?;
        let w = self.weight_matrix()?;

        // dL/dW = g^T x, summed over every row of the batch
        if self.weight.requires_grad() {
            self.weight.accumulate_grad(g.t().dot(&x).into_dyn());
        }
        if let Some(bias) = self.bias.as_mut().filter(|b| b.requires_grad()) {
            bias.accumulate_grad(g.sum_axis(Axis(0)).into_dyn());
        }

        let grad_input = reshape(&g.dot(&w).into_dyn(), input.shape())?;

        let mut params = vec![&mut self.weight];
        params.extend(self.bias.as_mut());
        hooks.dispatch(&LayerKind::Linear, input, grad_output, params)?;

        Ok(grad_input)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        std::iter::once(&self.weight).chain(self.bias.as_ref()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        std::iter::once(&mut self.weight).chain(self.bias.as_mut()).collect()
    }
}
