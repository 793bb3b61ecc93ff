//! Per-example gradients of [`Linear`](crate::nn::Linear)

use crate::error::Result;
use crate::nn::shape::as_batch_rows;
use crate::nn::ParamRole;
use ndarray::{Array3, ArrayD, Axis};

/// Weight: `g_b^T a_b` summed over the sequence rows of example `b`; bias: `sum_t g_b`
pub(super) fn grad_sample(
    role: ParamRole,
    activation: &ArrayD<f32>,
    backprops: &ArrayD<f32>,
) -> Result<ArrayD<f32>> {
    let g = as_batch_rows(backprops)?;
    match role {
        ParamRole::Weight => {
            let a = as_batch_rows(activation)?;
            let (batch, _, out_features) = g.dim();
            let in_features = a.len_of(Axis(2));
            let mut samples = Array3::<f32>::zeros((batch, out_features, in_features));
            for (mut sample, (gb, ab)) in samples
                .axis_iter_mut(Axis(0))
                .zip(g.axis_iter(Axis(0)).zip(a.axis_iter(Axis(0))))
            {
                sample.assign(&gb.t().dot(&ab));
            }
            Ok(samples.into_dyn())
        }
        ParamRole::Bias => Ok(g.sum_axis(Axis(1)).into_dyn()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, IxDyn};

    #[test]
    fn test_linear_weight_sample_is_outer_product() {
        let a = arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn();
        let g = arr2(&[[1.0, 0.0, 2.0], [0.0, 1.0, 0.0]]).into_dyn();
        let gs = grad_sample(ParamRole::Weight, &a, &g).unwrap();
        assert_eq!(gs.shape(), &[2, 3, 2]);
        assert_eq!(gs[[0, 2, 1]], 4.0);
        assert_eq!(gs[[1, 1, 0]], 3.0);
        assert_eq!(gs[[1, 0, 0]], 0.0);
    }

    #[test]
    fn test_linear_sums_over_sequence_not_batch() {
        let a = ArrayD::<f32>::ones(IxDyn(&[2, 3, 4]));
        let g = ArrayD::<f32>::ones(IxDyn(&[2, 3, 5]));
        let bias = grad_sample(ParamRole::Bias, &a, &g).unwrap();
        assert_eq!(bias.shape(), &[2, 5]);
        assert!(bias.iter().all(|&v| v == 3.0));
    }
}
