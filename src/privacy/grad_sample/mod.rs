//! Per-example gradient capture.
//!
//! A [`CaptureSession`] claims the hook table of a model and registers one
//! [`GradSampleHook`] per trainable parameter. During the backward pass each
//! hook receives the layer's saved input activation and its output gradient,
//! derives one gradient per example and stores it in the parameter's
//! [`GradSample`](crate::nn::GradSample) buffer, overwriting whatever an
//! earlier pass left there.

mod conv;
mod embedding;
mod linear;
mod norm;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ndarray::ArrayD;

use crate::error::{Error, Result};
use crate::nn::norm::Grouping;
use crate::nn::shape::{reshape, Window};
use crate::nn::{
    BackwardContext, BackwardHook, LayerKind, LossReduction, Module, ParamId, ParamRole, Parameter,
    Sequential,
};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Whether per-example gradients of a layer's parameters can be derived from
/// its activations alone
pub fn supports(kind: &LayerKind) -> bool {
    matches!(
        kind,
        LayerKind::Linear
            | LayerKind::Conv1d { .. }
            | LayerKind::Conv2d { .. }
            | LayerKind::Embedding { .. }
            | LayerKind::LayerNorm { .. }
            | LayerKind::GroupNorm { .. }
            | LayerKind::InstanceNorm { track_running_stats: false, .. }
    )
}

/// Per-example gradient `[batch, ..param_shape]`, or `None` when the layer
/// kind has no sampler
pub fn compute_grad_sample(
    kind: &LayerKind,
    role: ParamRole,
    param_shape: &[usize],
    activation: &ArrayD<f32>,
    backprops: &ArrayD<f32>,
) -> Result<Option<ArrayD<f32>>> {
    let raw = match kind {
        LayerKind::Linear => linear::grad_sample(role, activation, backprops)?,
        LayerKind::Conv1d { kernel, stride, padding } => {
            let window = Window {
                kernel: (1, *kernel),
                stride: (1, *stride),
                padding: (0, *padding),
            };
            conv::grad_sample(&window, role, activation, backprops)?
        }
        LayerKind::Conv2d { kernel, stride, padding } => {
            let window = Window {
                kernel: *kernel,
                stride: *stride,
                padding: *padding,
            };
            conv::grad_sample(&window, role, activation, backprops)?
        }
        LayerKind::Embedding { num_embeddings } => {
            embedding::grad_sample(*num_embeddings, activation, backprops)?
        }
        LayerKind::LayerNorm { normalized_dims, eps } => {
            norm::layer_norm(*normalized_dims, *eps, role, activation, backprops)?
        }
        LayerKind::GroupNorm { groups, eps } => {
            norm::channel_norm(Grouping::Groups(*groups), *eps, role, activation, backprops)?
        }
        LayerKind::InstanceNorm { eps, track_running_stats: false } => {
            norm::channel_norm(Grouping::Instance, *eps, role, activation, backprops)?
        }
        _ => return Ok(None),
    };

    let batch = backprops.shape().first().copied().unwrap_or(0);
    let dims: Vec<usize> = std::iter::once(batch)
        .chain(param_shape.iter().copied())
        .collect();
    reshape(&raw, &dims).map(Some)
}

/// Backward hook writing per-example gradients into the parameter's sample buffer
#[derive(Debug, Clone, Copy)]
pub struct GradSampleHook {
    reduction: LossReduction,
}

impl GradSampleHook {
    pub fn new(reduction: LossReduction) -> Self {
        Self { reduction }
    }
}

impl BackwardHook for GradSampleHook {
    fn on_backward(&mut self, ctx: &BackwardContext<'_>, param: &mut Parameter) -> Result<()> {
        let sample = compute_grad_sample(
            ctx.kind,
            param.role(),
            param.shape(),
            ctx.activation,
            ctx.backprops,
        )?
        .ok_or_else(|| Error::MissingGradSample {
            param: param.name().to_string(),
        })?;

        // a mean loss divides every example's gradient by B; undo it
        let scale = match self.reduction {
            LossReduction::Mean => sample.shape()[0] as f32,
            LossReduction::Sum => 1.0,
        };

        let buffer = param.grad_sample_mut().prepare(sample.shape());
        buffer.zip_mut_with(&sample, |dst, &src| *dst = src * scale);
        param.grad_sample_mut().commit(ctx.pass);
        Ok(())
    }
}

/// Installed capture hooks on one model
///
/// The model's hook table stays claimed only while the session is alive.
#[derive(Debug)]
pub struct CaptureSession {
    id: u64,
    _token: Arc<()>,
    hooked: Vec<ParamId>,
}

impl CaptureSession {
    /// Claim the model's hook table and hook every trainable parameter
    pub fn attach(model: &mut Sequential, reduction: LossReduction) -> Result<Self> {
        let id = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        let token = Arc::new(());
        let hooked: Vec<ParamId> = model
            .parameters()
            .into_iter()
            .filter(|p| p.requires_grad())
            .map(Parameter::id)
            .collect();

        let hooks = model.hooks_mut();
        hooks.claim(id, &token).map_err(|owner| {
            Error::DoubleAttach(format!("model is already captured by session {owner}"))
        })?;
        for &param in &hooked {
            hooks.register(param, Box::new(GradSampleHook::new(reduction)));
        }

        Ok(Self {
            id,
            _token: token,
            hooked,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of parameters carrying a capture hook
    pub fn hooked(&self) -> usize {
        self.hooked.len()
    }

    /// Remove every hook and drop all per-example buffers
    pub fn detach(&self, model: &mut Sequential) -> Result<()> {
        if model.hooks().session() != Some(self.id) {
            return Err(Error::NotAttached);
        }
        model.hooks_mut().release();
        for param in model.parameters_mut() {
            param.grad_sample_mut().clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::test_utils::finite_difference;
    use crate::nn::{
        mse, Conv1d, Conv2d, Embedding, Flatten, GroupNorm, InstanceNorm, LayerNorm, Linear, ReLU,
    };
    use approx::assert_abs_diff_eq;
    use ndarray::{Axis, IxDyn};

    fn ramp(shape: &[usize], offset: usize) -> ArrayD<f32> {
        let n: usize = shape.iter().product();
        let values = (0..n).map(|v| (((v + offset) * 7) % 13) as f32 * 0.15 - 0.9).collect();
        ArrayD::from_shape_vec(IxDyn(shape), values).unwrap()
    }

    /// Run forward/backward with capture installed and check, for every
    /// parameter, that the samples sum to the batch gradient
    fn assert_samples_sum_to_grad(mut model: Sequential, x: ArrayD<f32>) {
        CaptureSession::attach(&mut model, LossReduction::Sum).unwrap();
        let y = model.forward(&x).unwrap();
        let target = ramp(y.shape(), 3);
        let (_, grad) = mse(&y, &target).unwrap();
        model.backprop(&grad).unwrap();

        for param in model.parameters() {
            let sample = param
                .grad_sample()
                .live()
                .unwrap_or_else(|| panic!("{} has no sample", param.name()));
            assert_eq!(sample.shape()[0], x.shape()[0]);
            let summed = sample.sum_axis(Axis(0));
            let grad = param.grad().unwrap();
            for (s, g) in summed.iter().zip(grad.iter()) {
                assert_abs_diff_eq!(s, g, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_linear_samples_sum_to_grad() {
        let model = Sequential::new()
            .add("fc1", Linear::new(5, 4, true))
            .add("relu", ReLU::new())
            .add("fc2", Linear::new(4, 3, true));
        assert_samples_sum_to_grad(model, ramp(&[6, 5], 0));
    }

    #[test]
    fn test_sequence_linear_samples_sum_to_grad() {
        let model = Sequential::new().add("fc", Linear::new(4, 2, true));
        assert_samples_sum_to_grad(model, ramp(&[3, 5, 4], 1));
    }

    #[test]
    fn test_conv_samples_sum_to_grad() {
        let model = Sequential::new()
            .add("conv", Conv2d::with_geometry(2, 3, (3, 2), (1, 2), (1, 0)))
            .add("flat", Flatten::new(2))
            .add("conv1d", Conv1d::with_padding(3, 2, 3, 2, 1));
        assert_samples_sum_to_grad(model, ramp(&[4, 2, 5, 6], 2));
    }

    #[test]
    fn test_norm_samples_sum_to_grad() {
        let model = Sequential::new()
            .add("gn", GroupNorm::new(2, 4).unwrap())
            .add("in", InstanceNorm::new(4, true, false))
            .add("ln", LayerNorm::new(&[4, 3]));
        assert_samples_sum_to_grad(model, ramp(&[3, 4, 3], 5));
    }

    #[test]
    fn test_embedding_samples_sum_to_grad() {
        let mut model = Sequential::new().add("emb", Embedding::new(5, 3));
        CaptureSession::attach(&mut model, LossReduction::Sum).unwrap();
        let ids =
            ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![0.0, 4.0, 0.0, 1.0, 1.0, 2.0]).unwrap();
        model.forward(&ids).unwrap();
        model.backprop(&ramp(&[2, 3, 3], 0)).unwrap();

        let param = model.parameters()[0];
        let sample = param.grad_sample().live().unwrap();
        assert_eq!(sample.shape(), &[2, 5, 3]);
        // example 1 never touches rows 0, 3 and 4
        assert!(sample
            .index_axis(Axis(0), 1)
            .index_axis(Axis(0), 4)
            .iter()
            .all(|&v| v == 0.0));
        let summed = sample.sum_axis(Axis(0));
        for (s, g) in summed.iter().zip(param.grad().unwrap().iter()) {
            assert_abs_diff_eq!(s, g, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_sample_matches_single_example_gradient() {
        // the sample of example i equals the gradient of a batch holding only i
        let mut model = Sequential::new()
            .add("ln", LayerNorm::new(&[3]))
            .add("fc", Linear::new(3, 2, true));
        CaptureSession::attach(&mut model, LossReduction::Sum).unwrap();
        let x = ramp(&[3, 3], 4);
        let y = model.forward(&x).unwrap();
        let (_, grad) = mse(&y, &ArrayD::zeros(y.raw_dim())).unwrap();
        model.backprop(&grad.mapv(|g| g * 6.0)).unwrap();
        let weight = model.parameters()[0]
            .grad_sample()
            .live()
            .unwrap()
            .index_axis(Axis(0), 1)
            .to_owned();

        let gamma0: Vec<f32> = model.parameters()[0].data().iter().copied().collect();
        let mut single = Sequential::new()
            .add("ln", LayerNorm::new(&[3]))
            .add("fc", Linear::new(3, 2, true));
        single.copy_parameters_from(&model).unwrap();
        let row = x.index_axis(Axis(0), 1).insert_axis(Axis(0)).to_owned();
        let numeric = finite_difference(
            |gamma| {
                let gamma = ArrayD::from_shape_vec(IxDyn(&[3]), gamma.to_vec()).unwrap();
                single.parameters_mut()[0].data_mut().assign(&gamma);
                let y = single.forward(&row).unwrap();
                y.mapv(|v| v * v).sum()
            },
            &gamma0,
            1e-2,
        );
        for (a, n) in weight.iter().zip(numeric) {
            assert_abs_diff_eq!(*a, n, epsilon = 2e-2);
        }
    }

    #[test]
    fn test_repeated_backward_overwrites_samples() {
        let mut model = Sequential::new().add("fc", Linear::new(2, 2, true));
        CaptureSession::attach(&mut model, LossReduction::Sum).unwrap();
        let x = ramp(&[3, 2], 0);
        let g = ramp(&[3, 2], 1);
        model.forward(&x).unwrap();
        model.backprop(&g).unwrap();
        let first = model.parameters()[0].grad_sample().live().unwrap().clone();
        model.backprop(&g).unwrap();
        let second = model.parameters()[0].grad_sample().live().unwrap();
        assert_eq!(&first, second);
        assert_eq!(model.parameters()[0].grad_sample().pass(), 2);
    }

    #[test]
    fn test_mean_reduction_rescales_by_batch() {
        let mut sum_model = Sequential::new().add("fc", Linear::new(2, 1, false));
        let mut mean_model = Sequential::new().add("fc", Linear::new(2, 1, false));
        mean_model.copy_parameters_from(&sum_model).unwrap();
        CaptureSession::attach(&mut sum_model, LossReduction::Sum).unwrap();
        CaptureSession::attach(&mut mean_model, LossReduction::Mean).unwrap();

        let x = ramp(&[4, 2], 0);
        let g = ramp(&[4, 1], 2);
        sum_model.forward(&x).unwrap();
        sum_model.backprop(&g).unwrap();
        mean_model.forward(&x).unwrap();
        mean_model.backprop(&g.mapv(|v| v / 4.0)).unwrap();

        let a = sum_model.parameters()[0].grad_sample().live().unwrap().clone();
        let b = mean_model.parameters()[0].grad_sample().live().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_second_session_is_rejected() {
        let mut model = Sequential::new().add("fc", Linear::new(2, 2, true));
        let session = CaptureSession::attach(&mut model, LossReduction::Mean).unwrap();
        assert_eq!(session.hooked(), 2);
        assert!(matches!(
            CaptureSession::attach(&mut model, LossReduction::Mean),
            Err(Error::DoubleAttach(_))
        ));
        assert_eq!(model.hooks().session(), Some(session.id()));
        assert_eq!(model.hooks().len(), 2);

        session.detach(&mut model).unwrap();
        assert!(model.hooks().is_empty());
        assert!(CaptureSession::attach(&mut model, LossReduction::Mean).is_ok());
    }

    #[test]
    fn test_dropped_session_releases_model() {
        let mut model = Sequential::new().add("fc", Linear::new(2, 2, true));
        let session = CaptureSession::attach(&mut model, LossReduction::Mean).unwrap();
        let stale = session.id();
        drop(session);
        assert_eq!(model.hooks().session(), None);

        let fresh = CaptureSession::attach(&mut model, LossReduction::Mean).unwrap();
        assert_ne!(fresh.id(), stale);
        assert_eq!(model.hooks().session(), Some(fresh.id()));
        assert_eq!(model.hooks().len(), 2);
        // the old handle cannot tear down the new session
        let old = CaptureSession {
            id: stale,
            _token: Arc::new(()),
            hooked: Vec::new(),
        };
        assert!(matches!(old.detach(&mut model), Err(Error::NotAttached)));
    }

    #[test]
    fn test_frozen_parameters_are_not_hooked() {
        let mut frozen = Linear::new(2, 2, true);
        for p in frozen.parameters_mut() {
            p.set_requires_grad(false);
        }
        let mut model = Sequential::new()
            .add("frozen", frozen)
            .add("fc", Linear::new(2, 1, true));
        let session = CaptureSession::attach(&mut model, LossReduction::Mean).unwrap();
        assert_eq!(session.hooked(), 2);

        model.forward(&ramp(&[3, 2], 0)).unwrap();
        model.backprop(&ramp(&[3, 1], 0)).unwrap();
        let params = model.parameters();
        assert!(params[0].grad().is_none() && !params[0].grad_sample().is_allocated());
        assert!(params[2].grad_sample().is_live());
    }

    #[test]
    fn test_supported_kinds() {
        assert!(supports(&LayerKind::Linear));
        assert!(supports(&LayerKind::InstanceNorm {
            eps: 1e-5,
            track_running_stats: false,
        }));
        assert!(!supports(&LayerKind::InstanceNorm {
            eps: 1e-5,
            track_running_stats: true,
        }));
        assert!(!supports(&LayerKind::BatchNorm {
            num_features: 3,
            eps: 1e-5,
        }));
        assert!(!supports(&LayerKind::Custom("LSTM".into())));
    }

    #[test]
    fn test_unsupported_kind_has_no_sampler() {
        let kind = LayerKind::BatchNorm {
            num_features: 2,
            eps: 1e-5,
        };
        let a = ArrayD::zeros(IxDyn(&[2, 2]));
        let result = compute_grad_sample(&kind, ParamRole::Weight, &[2], &a, &a).unwrap();
        assert!(result.is_none());
    }
}
