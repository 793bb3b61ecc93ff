//! Per-example gradients of [`Embedding`](crate::nn::Embedding)

use crate::error::{Error, Result};
use crate::nn::shape::as_batch_rows;
use crate::nn::token_ids;
use ndarray::{s, Array3, ArrayD};

/// Scatter each example's output gradient rows into its own copy of the table
pub(super) fn grad_sample(
    num_embeddings: usize,
    activation: &ArrayD<f32>,
    backprops: &ArrayD<f32>,
) -> Result<ArrayD<f32>> {
    let ids = token_ids(activation, num_embeddings)?;
    let g = as_batch_rows(backprops)?;
    let (batch, tokens, dim) = g.dim();
    if ids.len() != batch * tokens {
        return Err(Error::Shape(format!(
            "{} embedding indices for {batch}x{tokens} output gradient rows",
            ids.len()
        )));
    }

    let mut samples = Array3::<f32>::zeros((batch, num_embeddings, dim));
    for b in 0..batch {
        for t in 0..tokens {
            let id = ids[b * tokens + t];
            let mut row = samples.slice_mut(s![b, id, ..]);
            row += &g.slice(s![b, t, ..]);
        }
    }
    Ok(samples.into_dyn())
}
