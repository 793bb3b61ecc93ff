//! Lookup table embedding

use super::module::{HookTable, LayerKind, Module};
use super::parameter::{ParamRole, Parameter};
use super::shape::{as_matrix, reshape};
use crate::error::{Error, Result};
use ndarray::{Array2, ArrayD, Axis, Ix2, IxDyn};
use rand::Rng;
use rand_distr::StandardNormal;

/// Convert float-encoded token ids to row indices, checking bounds
pub(crate) fn token_ids(input: &ArrayD<f32>, num_embeddings: usize) -> Result<Vec<usize>> {
    input
        .iter()
        .map(|&v| {
            if v < 0.0 || v.fract() != 0.0 || v as usize >= num_embeddings {
                Err(Error::Shape(format!(
                    "embedding index {v} out of range for {num_embeddings} rows"
                )))
            } else {
                Ok(v as usize)
            }
        })
        .collect()
}

/// Maps integer ids `[batch, ..]` (carried as `f32`) to rows of a `[num, dim]` table
#[derive(Debug, Clone)]
pub struct Embedding {
    num_embeddings: usize,
    embedding_dim: usize,
    weight: Parameter,
    input: Option<ArrayD<f32>>,
}

impl Embedding {
    /// Table initialized from a unit normal
    pub fn new(num_embeddings: usize, embedding_dim: usize) -> Self {
        let mut rng = rand::rng();
        let weight = Array2::from_shape_fn((num_embeddings, embedding_dim), |_| {
            rng.sample::<f32, _>(StandardNormal)
        });
        Self::from_weights(weight)
    }

    pub fn from_weights(weight: Array2<f32>) -> Self {
        let (num_embeddings, embedding_dim) = weight.dim();
        Self {
            num_embeddings,
            embedding_dim,
            weight: Parameter::new("weight", ParamRole::Weight, weight.into_dyn()),
            input: None,
        }
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }
}

impl Module for Embedding {
    fn kind(&self) -> LayerKind {
        LayerKind::Embedding {
            num_embeddings: self.num_embeddings,
        }
    }

    fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let ids = token_ids(input, self.num_embeddings)?;
        let table = self.weight.data().view().into_dimensionality::<Ix2>()?;
        let rows = table.select(Axis(0), &ids);

        let mut out_shape = input.shape().to_vec();
        out_shape.push(self.embedding_dim);
        self.input = Some(input.clone());
        reshape(&rows.into_dyn(), &out_shape)
    }

    fn backward(
        &mut self,
        grad_output: &ArrayD<f32>,
        hooks: &mut HookTable,
    ) -> Result<ArrayD<f32>> {
        let input = self
            .input
            .as_ref()
            .ok_or_else(|| Error::Shape("Embedding::backward called before forward".into()))?;
        let ids = token_ids(input, self.num_embeddings)?;

        if self.weight.requires_grad() {
            let g = as_matrix(grad_output)?;
            let mut dw = Array2::<f32>::zeros((self.num_embeddings, self.embedding_dim));
            for (&id, row) in ids.iter().zip(g.axis_iter(Axis(0))) {
                let mut target = dw.row_mut(id);
                target += &row;
            }
            self.weight.accumulate_grad(dw.into_dyn());
        }

        hooks.dispatch(&self.kind(), input, grad_output, vec![&mut self.weight])?;

        // Indices are not differentiable
        Ok(ArrayD::zeros(IxDyn(input.shape())))
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight]
    }
}
