//! Normalization layers
//!
//! All variants share one row-wise normalize core: the input is rearranged so
//! that every row holds one normalization group, normalized to zero mean and
//! unit variance, then an optional per-channel (or per-element, for
//! [`LayerNorm`]) affine transform is applied.

use super::module::{HookTable, LayerKind, Module};
use super::parameter::{ParamRole, Parameter};
use super::shape::{as_channels, reshape};
use crate::error::{Error, Result};
use ndarray::{Array1, Array2, Array3, ArrayD, Axis, Ix1};

/// Normalize each row to zero mean and unit variance; returns `(xhat, 1/std)`
pub(crate) fn normalize_rows(x: &Array2<f32>, eps: f32) -> (Array2<f32>, Array1<f32>) {
    let n = x.ncols().max(1) as f32;
    let mean = x.sum_axis(Axis(1)) / n;
    let centered = x - &mean.insert_axis(Axis(1));
    let var = centered.mapv(|v| v * v).sum_axis(Axis(1)) / n;
    let inv_std = var.mapv(|v| 1.0 / (v + eps).sqrt());
    let xhat = &centered * &inv_std.view().insert_axis(Axis(1));
    (xhat, inv_std)
}

/// Gradient through [`normalize_rows`] given the gradient w.r.t. `xhat`
pub(crate) fn normalize_rows_backward(
    dxhat: &Array2<f32>,
    xhat: &Array2<f32>,
    inv_std: &Array1<f32>,
) -> Array2<f32> {
    let n = dxhat.ncols().max(1) as f32;
    let mean_d = dxhat.sum_axis(Axis(1)) / n;
    let mean_dx = (dxhat * xhat).sum_axis(Axis(1)) / n;
    let dx = dxhat - &mean_d.insert_axis(Axis(1));
    let dx = dx - &(xhat * &mean_dx.insert_axis(Axis(1)));
    dx * &inv_std.view().insert_axis(Axis(1))
}

/// How `[batch, channels, spatial]` is split into normalization groups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Grouping {
    /// `groups` contiguous channel groups per example
    Groups(usize),
    /// Every channel of every example on its own
    Instance,
    /// Every channel across the whole batch
    Batch,
}

fn to_rows(x: &Array3<f32>, grouping: Grouping) -> Result<Array2<f32>> {
    let (b, c, s) = x.dim();
    let rows = match grouping {
        Grouping::Groups(g) => {
            if g == 0 || c % g != 0 {
                return Err(Error::Shape(format!(
                    "{c} channels cannot be split into {g} groups"
                )));
            }
            x.as_standard_layout()
                .into_owned()
                .into_shape_with_order((b * g, c / g * s))?
        }
        Grouping::Instance => x
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((b * c, s))?,
        Grouping::Batch => x
            .view()
            .permuted_axes([1, 0, 2])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((c, b * s))?,
    };
    Ok(rows)
}

fn from_rows(
    rows: Array2<f32>,
    grouping: Grouping,
    dim: (usize, usize, usize),
) -> Result<Array3<f32>> {
    let (b, c, s) = dim;
    let rows = rows.as_standard_layout().into_owned();
    Ok(match grouping {
        Grouping::Groups(_) | Grouping::Instance => rows.into_shape_with_order(dim)?,
        Grouping::Batch => rows
            .into_shape_with_order((c, b, s))?
            .permuted_axes([1, 0, 2])
            .as_standard_layout()
            .into_owned(),
    })
}

/// Normalized activations `[batch, channels, spatial]` of a channel normalization
pub(crate) fn channel_xhat(
    x: &ArrayD<f32>,
    grouping: Grouping,
    eps: f32,
) -> Result<Array3<f32>> {
    let x3 = as_channels(x)?;
    let (xhat, _) = normalize_rows(&to_rows(&x3, grouping)?, eps);
    from_rows(xhat, grouping, x3.dim())
}

/// Normalized activations `[rows, prod(normalized_shape)]` of a layer normalization
pub(crate) fn layer_xhat(
    x: &ArrayD<f32>,
    normalized_dims: usize,
    eps: f32,
) -> Result<Array2<f32>> {
    let rows = layer_rows(x, normalized_dims)?;
    Ok(normalize_rows(&rows, eps).0)
}

fn layer_rows(x: &ArrayD<f32>, normalized_dims: usize) -> Result<Array2<f32>> {
    let shape = x.shape();
    if normalized_dims == 0 || normalized_dims >= shape.len() {
        return Err(Error::Shape(format!(
            "cannot normalize the last {normalized_dims} dims of {shape:?}"
        )));
    }
    let n: usize = shape[shape.len() - normalized_dims..].iter().product();
    let rows = if n == 0 { 0 } else { x.len() / n };
    Ok(reshape(x, &[rows, n])?.into_dimensionality()?)
}

/// Exponential moving averages of per-channel statistics
#[derive(Debug, Clone)]
struct RunningStats {
    mean: Array1<f32>,
    var: Array1<f32>,
    momentum: f32,
}

impl RunningStats {
    fn new(channels: usize) -> Self {
        Self {
            mean: Array1::zeros(channels),
            var: Array1::ones(channels),
            momentum: 0.1,
        }
    }

    fn update(&mut self, x: &Array3<f32>) {
        let (b, _, s) = x.dim();
        let n = (b * s) as f32;
        let m = self.momentum;
        for (c, chan) in x.axis_iter(Axis(1)).enumerate() {
            let mean = chan.sum() / n;
            // unbiased, like the usual framework convention
            let var = chan.mapv(|v| (v - mean).powi(2)).sum() / (n - 1.0).max(1.0);
            self.mean[c] = (1.0 - m) * self.mean[c] + m * mean;
            self.var[c] = (1.0 - m) * self.var[c] + m * var;
        }
    }
}

#[derive(Debug, Clone)]
struct Saved {
    input: ArrayD<f32>,
    xhat: Array3<f32>,
    inv_std: Array1<f32>,
    /// Statistics came from the current batch and depend on the input
    batch_stats: bool,
}

/// Shared implementation of the channel-affine normalizations
#[derive(Debug, Clone)]
struct ChannelNorm {
    num_channels: usize,
    grouping: Grouping,
    eps: f32,
    weight: Option<Parameter>,
    bias: Option<Parameter>,
    running: Option<RunningStats>,
    training: bool,
    saved: Option<Saved>,
}

impl ChannelNorm {
    fn new(num_channels: usize, grouping: Grouping, affine: bool, running: bool) -> Self {
        let weight = Array1::ones(num_channels).into_dyn();
        let bias = Array1::zeros(num_channels).into_dyn();
        let (weight, bias) = if affine {
            (
                Some(Parameter::new("weight", ParamRole::Weight, weight)),
                Some(Parameter::new("bias", ParamRole::Bias, bias)),
            )
        } else {
            (None, None)
        };
        Self {
            num_channels,
            grouping,
            eps: 1e-5,
            weight,
            bias,
            running: running.then(|| RunningStats::new(num_channels)),
            training: true,
            saved: None,
        }
    }

    fn running_xhat(&self, x: &Array3<f32>) -> Result<(Array3<f32>, Array1<f32>)> {
        let c = self.num_channels;
        let stats = self
            .running
            .as_ref()
            .ok_or_else(|| Error::Shape("no running statistics tracked".into()))?;
        let inv_std = stats.var.mapv(|v| 1.0 / (v + self.eps).sqrt());
        let mean = stats.mean.view().into_shape_with_order((1, c, 1))?;
        let scale = inv_std.view().into_shape_with_order((1, c, 1))?;
        let xhat = (x - &mean) * &scale;
        Ok((xhat, inv_std))
    }

    fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = as_channels(input)?;
        let (b, c, s) = x.dim();
        if c != self.num_channels {
            return Err(Error::Shape(format!(
                "expected {} channels, got {c}",
                self.num_channels
            )));
        }

        let batch_stats = self.training || self.running.is_none();
        let (xhat, inv_std) = if batch_stats {
            if self.training {
                if let Some(stats) = self.running.as_mut() {
                    stats.update(&x);
                }
            }
            let (rows, inv_std) = normalize_rows(&to_rows(&x, self.grouping)?, self.eps);
            (from_rows(rows, self.grouping, (b, c, s))?, inv_std)
        } else {
            self.running_xhat(&x)?
        };

        let mut y = xhat.clone();
        if let Some(w) = &self.weight {
            y = y * &w.data().view().into_shape_with_order((1, c, 1))?;
        }
        if let Some(bias) = &self.bias {
            y = y + &bias.data().view().into_shape_with_order((1, c, 1))?;
        }

        self.saved = Some(Saved {
            input: input.clone(),
            xhat,
            inv_std,
            batch_stats,
        });
        reshape(&y.into_dyn(), input.shape())
    }

    fn backward(
        &mut self,
        kind: &LayerKind,
        grad_output: &ArrayD<f32>,
        hooks: &mut HookTable,
    ) -> Result<ArrayD<f32>> {
        let saved = self
            .saved
            .as_ref()
            .ok_or_else(|| Error::Shape(format!("{kind}::backward called before forward")))?;
        let g = as_channels(grad_output)?;
        let (b, c, s) = g.dim();

        if let Some(w) = self.weight.as_mut().filter(|p| p.requires_grad()) {
            let dw = (&g * &saved.xhat).sum_axis(Axis(2)).sum_axis(Axis(0));
            w.accumulate_grad(dw.into_dyn());
        }
        if let Some(bias) = self.bias.as_mut().filter(|p| p.requires_grad()) {
            bias.accumulate_grad(g.sum_axis(Axis(2)).sum_axis(Axis(0)).into_dyn());
        }

        let dxhat = match &self.weight {
            Some(w) => &g * &w.data().view().into_shape_with_order((1, c, 1))?,
            None => g.clone(),
        };
        let dx = if saved.batch_stats {
            let rows = normalize_rows_backward(
                &to_rows(&dxhat, self.grouping)?,
                &to_rows(&saved.xhat, self.grouping)?,
                &saved.inv_std,
            );
            from_rows(rows, self.grouping, (b, c, s))?
        } else {
            dxhat * &saved.inv_std.view().into_shape_with_order((1, c, 1))?
        };
        let dx = reshape(&dx.into_dyn(), saved.input.shape())?;

        let params: Vec<&mut Parameter> = self
            .weight
            .iter_mut()
            .chain(self.bias.iter_mut())
            .collect();
        hooks.dispatch(kind, &saved.input, grad_output, params)?;
        Ok(dx)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.weight.iter().chain(self.bias.iter()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.weight.iter_mut().chain(self.bias.iter_mut()).collect()
    }
}

/// Group normalization over `[batch, channels, ..]`; statistics never mix examples
#[derive(Debug, Clone)]
pub struct GroupNorm {
    groups: usize,
    inner: ChannelNorm,
}

impl GroupNorm {
    pub fn new(groups: usize, num_channels: usize) -> Result<Self> {
        if groups == 0 || num_channels % groups != 0 {
            return Err(Error::InvalidConfig(format!(
                "GroupNorm: {num_channels} channels are not divisible into {groups} groups"
            )));
        }
        Ok(Self {
            groups,
            inner: ChannelNorm::new(num_channels, Grouping::Groups(groups), true, false),
        })
    }

    pub fn groups(&self) -> usize {
        self.groups
    }

    pub fn num_channels(&self) -> usize {
        self.inner.num_channels
    }
}

impl Module for GroupNorm {
    fn kind(&self) -> LayerKind {
        LayerKind::GroupNorm {
            groups: self.groups,
            eps: self.inner.eps,
        }
    }

    fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.inner.forward(input)
    }

    fn backward(
        &mut self,
        grad_output: &ArrayD<f32>,
        hooks: &mut HookTable,
    ) -> Result<ArrayD<f32>> {
        let kind = self.kind();
        self.inner.backward(&kind, grad_output, hooks)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.inner.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.inner.parameters_mut()
    }
}

/// Per-example, per-channel normalization, optionally with running statistics
#[derive(Debug, Clone)]
pub struct InstanceNorm {
    inner: ChannelNorm,
}

impl InstanceNorm {
    pub fn new(num_features: usize, affine: bool, track_running_stats: bool) -> Self {
        Self {
            inner: ChannelNorm::new(num_features, Grouping::Instance, affine, track_running_stats),
        }
    }
}

impl Module for InstanceNorm {
    fn kind(&self) -> LayerKind {
        LayerKind::InstanceNorm {
            eps: self.inner.eps,
            track_running_stats: self.inner.running.is_some(),
        }
    }

    fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.inner.forward(input)
    }

    fn backward(
        &mut self,
        grad_output: &ArrayD<f32>,
        hooks: &mut HookTable,
    ) -> Result<ArrayD<f32>> {
        let kind = self.kind();
        self.inner.backward(&kind, grad_output, hooks)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.inner.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.inner.parameters_mut()
    }

    fn set_training(&mut self, training: bool) {
        self.inner.training = training;
    }
}

/// Batch normalization; couples every example of the batch through its statistics
#[derive(Debug, Clone)]
pub struct BatchNorm {
    inner: ChannelNorm,
}

impl BatchNorm {
    pub fn new(num_features: usize) -> Self {
        Self {
            inner: ChannelNorm::new(num_features, Grouping::Batch, true, true),
        }
    }

    pub fn num_features(&self) -> usize {
        self.inner.num_channels
    }

    pub fn running_mean(&self) -> Option<&Array1<f32>> {
        self.inner.running.as_ref().map(|s| &s.mean)
    }
}

impl Module for BatchNorm {
    fn kind(&self) -> LayerKind {
        LayerKind::BatchNorm {
            num_features: self.inner.num_channels,
            eps: self.inner.eps,
        }
    }

    fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.inner.forward(input)
    }

    fn backward(
        &mut self,
        grad_output: &ArrayD<f32>,
        hooks: &mut HookTable,
    ) -> Result<ArrayD<f32>> {
        let kind = self.kind();
        self.inner.backward(&kind, grad_output, hooks)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.inner.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.inner.parameters_mut()
    }

    fn set_training(&mut self, training: bool) {
        self.inner.training = training;
    }
}

/// Normalization over the trailing `normalized_shape` dims with an elementwise affine
#[derive(Debug, Clone)]
pub struct LayerNorm {
    normalized_shape: Vec<usize>,
    eps: f32,
    weight: Parameter,
    bias: Parameter,
    saved: Option<(ArrayD<f32>, Array2<f32>, Array1<f32>)>,
}

impl LayerNorm {
    pub fn new(normalized_shape: &[usize]) -> Self {
        let shape = ndarray::IxDyn(normalized_shape);
        Self {
            normalized_shape: normalized_shape.to_vec(),
            eps: 1e-5,
            weight: Parameter::new("weight", ParamRole::Weight, ArrayD::ones(shape.clone())),
            bias: Parameter::new("bias", ParamRole::Bias, ArrayD::zeros(shape)),
            saved: None,
        }
    }

    pub fn normalized_shape(&self) -> &[usize] {
        &self.normalized_shape
    }

    fn flat(p: &Parameter) -> Result<ndarray::ArrayView1<'_, f32>> {
        let n = p.len();
        Ok(p.data().view().into_shape_with_order(n)?.into_dimensionality::<Ix1>()?)
    }
}

impl Module for LayerNorm {
    fn kind(&self) -> LayerKind {
        LayerKind::LayerNorm {
            normalized_dims: self.normalized_shape.len(),
            eps: self.eps,
        }
    }

    fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let dims = self.normalized_shape.len();
        if !input.shape().ends_with(&self.normalized_shape) {
            return Err(Error::Shape(format!(
                "LayerNorm over {:?} got input {:?}",
                self.normalized_shape,
                input.shape()
            )));
        }
        let (xhat, inv_std) = normalize_rows(&layer_rows(input, dims)?, self.eps);
        let y = &xhat * &Self::flat(&self.weight)? + &Self::flat(&self.bias)?;
        self.saved = Some((input.clone(), xhat, inv_std));
        reshape(&y.into_dyn(), input.shape())
    }

    fn backward(
        &mut self,
        grad_output: &ArrayD<f32>,
        hooks: &mut HookTable,
    ) -> Result<ArrayD<f32>> {
        let kind = self.kind();
        let (input, xhat, inv_std) = self
            .saved
            .as_ref()
            .ok_or_else(|| Error::Shape("LayerNorm::backward called before forward".into()))?;
        let g = layer_rows(grad_output, self.normalized_shape.len())?;

        if self.weight.requires_grad() {
            let dgamma = (&g * xhat).sum_axis(Axis(0));
            self.weight
                .accumulate_grad(reshape(&dgamma.into_dyn(), &self.normalized_shape)?);
        }
        if self.bias.requires_grad() {
            let dbeta = g.sum_axis(Axis(0));
            self.bias.accumulate_grad(reshape(&dbeta.into_dyn(), &self.normalized_shape)?);
        }

        let dxhat = &g * &Self::flat(&self.weight)?;
        let dx = normalize_rows_backward(&dxhat, xhat, inv_std);
        let dx = reshape(&dx.into_dyn(), input.shape())?;

        let params = vec![&mut self.weight, &mut self.bias];
        hooks.dispatch(&kind, input, grad_output, params)?;
        Ok(dx)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }
}
