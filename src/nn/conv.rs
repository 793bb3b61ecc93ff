//! 1-D and 2-D convolutions lowered to matrix products over unfolded patches

use super::module::{HookTable, LayerKind, Module};
use super::parameter::{ParamRole, Parameter};
use super::shape::{as_channels, fold, reshape, unfold, Window};
use crate::error::{Error, Result};
use ndarray::{Array1, Array2, Array3, ArrayD, Axis, Ix2, IxDyn};
use rand::Rng;

/// Shared state of both convolution ranks
#[derive(Debug, Clone)]
struct ConvCore {
    in_channels: usize,
    out_channels: usize,
    window: Window,
    weight: Parameter,
    bias: Option<Parameter>,
    input: Option<ArrayD<f32>>,
    cols: Option<Array3<f32>>,
}

impl ConvCore {
    fn new(
        in_channels: usize,
        out_channels: usize,
        window: Window,
        weight_shape: &[usize],
        bias: bool,
    ) -> Self {
        let fan_in = in_channels * window.kernel.0 * window.kernel.1;
        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
        let mut rng = rand::rng();
        let weight =
            ArrayD::from_shape_fn(IxDyn(weight_shape), |_| rng.random_range(-bound..=bound));
        let bias = bias.then(|| {
            Array1::from_shape_fn(out_channels, |_| rng.random_range(-bound..=bound)).into_dyn()
        });
        Self {
            in_channels,
            out_channels,
            window,
            weight: Parameter::new("weight", ParamRole::Weight, weight),
            bias: bias.map(|b| Parameter::new("bias", ParamRole::Bias, b)),
            input: None,
            cols: None,
        }
    }

    fn weight_matrix(&self) -> Result<Array2<f32>> {
        let rows = self.out_channels;
        let cols = self.weight.len() / rows.max(1);
        Ok(reshape(self.weight.data(), &[rows, cols])?.into_dimensionality::<Ix2>()?)
    }

    /// Returns `[batch, out_channels, out_h*out_w]` plus the spatial output size
    fn forward(&mut self, input: &ArrayD<f32>) -> Result<(Array3<f32>, (usize, usize))> {
        let image = self.window.as_image(input)?;
        let (_, channels, height, width) = image.dim();
        if channels != self.in_channels {
            return Err(Error::Shape(format!(
                "convolution expects {} input channels, got {channels}",
                self.in_channels
            )));
        }
        let out_size = self.window.output_size(height, width)?;
        let cols = unfold(image.view(), &self.window)?;
        let w = self.weight_matrix()?;

        let batch = cols.len_of(Axis(0));
        let positions = out_size.0 * out_size.1;
        let mut out = Array3::<f32>::zeros((batch, self.out_channels, positions));
        for (b, patches) in cols.axis_iter(Axis(0)).enumerate() {
            out.index_axis_mut(Axis(0), b).assign(&w.dot(&patches));
        }
        if let Some(bias) = &self.bias {
            for (o, &value) in bias.data().iter().enumerate() {
                out.index_axis_mut(Axis(1), o).mapv_inplace(|v| v + value);
            }
        }

        self.input = Some(input.clone());
        self.cols = Some(cols);
        Ok((out, out_size))
    }

    fn backward(
        &mut self,
        kind: &LayerKind,
        grad_output: &ArrayD<f32>,
        hooks: &mut HookTable,
    ) -> Result<ArrayD<f32>> {
        let w = self.weight_matrix()?;
        let (Some(input), Some(cols)) = (self.input.as_ref(), self.cols.as_ref()) else {
            return Err(Error::Shape(
                "convolution backward called before forward".into(),
            ));
        };
        let g = as_channels(grad_output)?;

        if self.weight.requires_grad() {
            let mut dw = Array2::<f32>::zeros(w.dim());
            for (gb, cb) in g.axis_iter(Axis(0)).zip(cols.axis_iter(Axis(0))) {
                dw += &gb.dot(&cb.t());
            }
            self.weight.accumulate_grad(reshape(&dw.into_dyn(), self.weight.shape())?);
        }
        if let Some(bias) = self.bias.as_mut().filter(|b| b.requires_grad()) {
            bias.accumulate_grad(g.sum_axis(Axis(2)).sum_axis(Axis(0)).into_dyn());
        }

        let mut dcols = Array3::<f32>::zeros(cols.dim());
        for (b, gb) in g.axis_iter(Axis(0)).enumerate() {
            dcols.index_axis_mut(Axis(0), b).assign(&w.t().dot(&gb));
        }
        let image = self.window.as_image(input)?;
        let (_, channels, height, width) = image.dim();
        let grad_input = fold(&dcols, &self.window, channels, height, width)?;
        let grad_input = reshape(&grad_input.into_dyn(), input.shape())?;

        let mut params = vec![&mut self.weight];
        params.extend(self.bias.as_mut());
        hooks.dispatch(kind, input, grad_output, params)?;

        Ok(grad_input)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        std::iter::once(&self.weight).chain(self.bias.as_ref()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        std::iter::once(&mut self.weight).chain(self.bias.as_mut()).collect()
    }
}

/// Convolution over `[batch, channels, length]`, weight `[out, in, kernel]`
#[derive(Debug, Clone)]
pub struct Conv1d {
    core: ConvCore,
}

impl Conv1d {
    pub fn new(in_channels: usize, out_channels: usize, kernel: usize, stride: usize) -> Self {
        Self::with_padding(in_channels, out_channels, kernel, stride, 0)
    }

    pub fn with_padding(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
    ) -> Self {
        let window = Window {
            kernel: (1, kernel),
            stride: (1, stride),
            padding: (0, padding),
        };
        let shape = [out_channels, in_channels, kernel];
        Self {
            core: ConvCore::new(in_channels, out_channels, window, &shape, true),
        }
    }

    pub fn weight(&self) -> &Parameter {
        &self.core.weight
    }
}

impl Module for Conv1d {
    fn kind(&self) -> LayerKind {
        let w = self.core.window;
        LayerKind::Conv1d {
            kernel: w.kernel.1,
            stride: w.stride.1,
            padding: w.padding.1,
        }
    }

    fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        if input.ndim() != 3 {
            return Err(Error::Shape(format!(
                "Conv1d expects [batch, channels, length], got {:?}",
                input.shape()
            )));
        }
        let (out, (_, out_w)) = self.core.forward(input)?;
        let batch = out.len_of(Axis(0));
        reshape(&out.into_dyn(), &[batch, self.core.out_channels, out_w])
    }

    fn backward(
        &mut self,
        grad_output: &ArrayD<f32>,
        hooks: &mut HookTable,
    ) -> Result<ArrayD<f32>> {
        let kind = self.kind();
        self.core.backward(&kind, grad_output, hooks)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.core.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.core.parameters_mut()
    }
}

/// Convolution over `[batch, channels, height, width]`, weight `[out, in, kh, kw]`
#[derive(Debug, Clone)]
pub struct Conv2d {
    core: ConvCore,
}

impl Conv2d {
    pub fn new(in_channels: usize, out_channels: usize, kernel: usize, stride: usize) -> Self {
        Self::with_geometry(
            in_channels,
            out_channels,
            (kernel, kernel),
            (stride, stride),
            (0, 0),
        )
    }

    pub fn with_geometry(
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
    ) -> Self {
        let window = Window {
            kernel,
            stride,
            padding,
        };
        let shape = [out_channels, in_channels, kernel.0, kernel.1];
        Self {
            core: ConvCore::new(in_channels, out_channels, window, &shape, true),
        }
    }

    pub fn weight(&self) -> &Parameter {
        &self.core.weight
    }
}

impl Module for Conv2d {
    fn kind(&self) -> LayerKind {
        let w = self.core.window;
        LayerKind::Conv2d {
            kernel: w.kernel,
            stride: w.stride,
            padding: w.padding,
        }
    }

    fn forward(&mut self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        if input.ndim() != 4 {
            return Err(Error::Shape(format!(
                "Conv2d expects [batch, channels, height, width], got {:?}",
                input.shape()
            )));
        }
        let (out, (out_h, out_w)) = self.core.forward(input)?;
        let batch = out.len_of(Axis(0));
        reshape(&out.into_dyn(), &[batch, self.core.out_channels, out_h, out_w])
    }

    fn backward(
        &mut self,
        grad_output: &ArrayD<f32>,
        hooks: &mut HookTable,
    ) -> Result<ArrayD<f32>> {
        let kind = self.kind();
        self.core.backward(&kind, grad_output, hooks)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.core.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.core.parameters_mut()
    }
}
