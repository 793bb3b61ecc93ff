//! Per-example gradients of the normalization layers that keep examples independent

use crate::error::Result;
use crate::nn::norm::{channel_xhat, layer_xhat, Grouping};
use crate::nn::shape::{as_channels, reshape};
use crate::nn::ParamRole;
use ndarray::{ArrayD, Axis, Ix3};

/// LayerNorm: `sum_t g * xhat` (weight) and `sum_t g` (bias) per example
pub(super) fn layer_norm(
    normalized_dims: usize,
    eps: f32,
    role: ParamRole,
    activation: &ArrayD<f32>,
    backprops: &ArrayD<f32>,
) -> Result<ArrayD<f32>> {
    let shape = activation.shape();
    let batch = shape.first().copied().unwrap_or(0);
    let width: usize = shape[shape.len().saturating_sub(normalized_dims)..]
        .iter()
        .product();
    let rows = if batch * width == 0 {
        0
    } else {
        activation.len() / (batch * width)
    };

    let g = reshape(backprops, &[batch, rows, width])?.into_dimensionality::<Ix3>()?;
    let sample = match role {
        ParamRole::Weight => {
            let xhat = layer_xhat(activation, normalized_dims, eps)?
                .into_shape_with_order((batch, rows, width))?;
            (&g * &xhat).sum_axis(Axis(1))
        }
        ParamRole::Bias => g.sum_axis(Axis(1)),
    };
    Ok(sample.into_dyn())
}

/// GroupNorm / InstanceNorm: per-channel `sum_s g * xhat` and `sum_s g` per example
pub(super) fn channel_norm(
    grouping: Grouping,
    eps: f32,
    role: ParamRole,
    activation: &ArrayD<f32>,
    backprops: &ArrayD<f32>,
) -> Result<ArrayD<f32>> {
    let g = as_channels(backprops)?;
    let sample = match role {
        ParamRole::Weight => {
            (&g * &channel_xhat(activation, grouping, eps)?).sum_axis(Axis(2))
        }
        ParamRole::Bias => g.sum_axis(Axis(2)),
    };
    Ok(sample.into_dyn())
}
