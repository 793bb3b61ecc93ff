//! Per-example gradients of [`Conv1d`](crate::nn::Conv1d) and [`Conv2d`](crate::nn::Conv2d)

use crate::error::Result;
use crate::nn::shape::{as_channels, unfold, Window};
use crate::nn::ParamRole;
use ndarray::{Array3, ArrayD, Axis};

/// Weight: `g_b · unfold(a_b)^T`, shape `[batch, out, in*kh*kw]`; bias: `g_b`
/// summed over positions
pub(super) fn grad_sample(
    window: &Window,
    role: ParamRole,
    activation: &ArrayD<f32>,
    backprops: &ArrayD<f32>,
) -> Result<ArrayD<f32>> {
    let g = as_channels(backprops)?;
    match role {
        ParamRole::Weight => {
            let image = window.as_image(activation)?;
            let cols = unfold(image.view(), window)?;
            let (batch, out_channels, _) = g.dim();
            let patch = cols.len_of(Axis(1));
            let mut samples = Array3::<f32>::zeros((batch, out_channels, patch));
            for (mut sample, (gb, cb)) in samples
                .axis_iter_mut(Axis(0))
                .zip(g.axis_iter(Axis(0)).zip(cols.axis_iter(Axis(0))))
            {
                sample.assign(&gb.dot(&cb.t()));
            }
            Ok(samples.into_dyn())
        }
        ParamRole::Bias => Ok(g.sum_axis(Axis(2)).into_dyn()),
    }
}
